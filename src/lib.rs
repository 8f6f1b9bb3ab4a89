//! Remote benchmark execution and monitoring engine.
//!
//! Drives a vdbench-style file I/O tool over interactive SSH shells across
//! a fleet of hosts: renders the workload config from a template, prepares
//! the file tree (or proves the existing one matches), runs the measured
//! workload while watching its logs, and distills logs and flat files into
//! a report.
//!
//! The major pieces:
//!
//! - [`remote`]: SSH transport, interactive session protocol, per-host
//!   command facade, and the connected fleet.
//! - [`bench`]: job lifecycle, workload config rendering, and the local
//!   control-file watcher.
//! - [`logsig`]: pure signal extraction from tool logs (stages, zero-rate
//!   dips, closing averages).
//! - [`metrics`]: CSV report extraction via the tool's own parser.
//! - [`polling`]: the bounded wait primitive everything above leans on.

pub mod bench;
pub mod config;
pub mod error;
pub mod logsig;
pub mod metrics;
pub mod polling;
pub mod remote;

pub use error::{BenchError, Result};
