//! Benchmark job orchestration.

pub mod config_gen;
pub mod controller;
pub mod job;
pub mod watcher;

use std::time::Duration;

/// Elapsed seconds substituted into the file-preparation pass. Preparation
/// only needs the format phase, so the measured phase is cut to the minimum.
pub const ELAPSED_PREPARE: u64 = 5;

/// Default measurement duration in seconds.
pub const DEFAULT_ELAPSED: u64 = 180;

/// Upper bound on any single tool run.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Grace period between the success marker appearing and the process
/// actually exiting.
pub const PROC_END_TIMEOUT: Duration = Duration::from_secs(60);

/// Disk statistics sampling interval in seconds.
pub const IOSTAT_INTERVAL: u64 = 5;

/// Name of the remote file the tool watches for a shutdown request.
pub const MONITOR_FILE_NAME: &str = "vdb.mon";

/// Token written to the monitor file to request a graceful shutdown.
pub const STOP_TOKEN: &str = "end_vdbench";

/// Log line that marks a fully successful tool run.
pub const SUCCESS_MARKER: &str = "Vdbench execution completed successfully";

/// Directory depth substituted for `$depth` inside shard definitions.
pub const SHARD_TREE_DEPTH: u32 = 4;

/// Name of the marker file at the anchor root recording the prepared
/// shard layout.
pub const TAG_FILE_NAME: &str = "tag";

/// Wait budget for reading the tag file; a hung read here means the
/// mount point is gone.
pub const TAG_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub use controller::{JobController, JobReport, RunCheck};
pub use job::{JobPaths, JobStage};
pub use watcher::{ControlState, ControlWatcher};
