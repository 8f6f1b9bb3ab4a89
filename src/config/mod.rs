//! Configuration for hosts and benchmark jobs.
//!
//! The engine is handed a host list and a job specification by its caller
//! (scenario loading and case-level rules live outside this crate). This
//! module defines those inbound types and loads them from a YAML file.
//!
//! # Example configuration
//!
//! ```yaml
//! hosts:
//!   - address: "10.0.0.11"
//!     user: "root"
//!     password: "secret"
//!     role: "master_host"
//!     anchor_path: "/mnt/bench"
//!   - address: "10.0.0.12"
//!     user: "root"
//!     ssh_key: "~/.ssh/id_rsa"
//!     role: "host1"
//!     anchor_path: "/mnt/bench"
//! job:
//!   install_dir: "/opt/vdb"
//!   template: "/opt/vdb/templates/16k_rw.txt"
//!   output_dir: "/tmp/fleetbench"
//!   shard_width: 4
//!   shard_count: 2
//!   thread_baseline: 64
//!   multiple: 2
//!   elapsed: "2h"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{BenchError, Result};

/// Default SSH port.
const DEFAULT_SSH_PORT: u16 = 22;

/// Default per-command timeout in seconds.
const DEFAULT_COMMAND_TIMEOUT: u64 = 120;

/// Role tag of the host that drives the benchmark tool.
pub const MASTER_ROLE: &str = "master_host";

/// OS family of a remote host, detected at connection time unless pinned
/// in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Posix,
    Windows,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Fleet of remote hosts participating in the run.
    pub hosts: Vec<HostConfig>,

    /// Benchmark job specification.
    pub job: JobSpec,

    /// Local control file polled for stop/pause/restart requests.
    /// Defaults to `<home>/fleetbench.mon`.
    #[serde(default)]
    pub monitor_file: Option<String>,
}

/// Connection settings and identity of one remote host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Hostname or IP address.
    pub address: String,

    /// SSH username.
    pub user: String,

    /// SSH password (optional; key/agent auth is tried as well).
    #[serde(default)]
    pub password: Option<String>,

    /// Path to an SSH private key file.
    #[serde(default)]
    pub ssh_key: Option<String>,

    /// SSH port (default 22).
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Role tag, e.g. "master_host". Exactly one host must carry
    /// [`MASTER_ROLE`].
    pub role: String,

    /// Mount point used as the root of the benchmark file tree on this host.
    #[serde(default)]
    pub anchor_path: Option<String>,

    /// Commands used to refresh the mount before performance measurement.
    #[serde(default)]
    pub umount_command: Option<String>,
    #[serde(default)]
    pub mount_command: Option<String>,

    /// Pinned OS family. When absent the family is probed at connect time.
    #[serde(default)]
    pub os: Option<OsFamily>,

    /// Default per-command timeout in seconds.
    #[serde(default = "default_command_timeout")]
    pub timeout: u64,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT
}

impl HostConfig {
    pub fn new(address: impl Into<String>, user: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: user.into(),
            password: None,
            ssh_key: None,
            port: DEFAULT_SSH_PORT,
            role: role.into(),
            anchor_path: None,
            umount_command: None,
            mount_command: None,
            os: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Returns the SSH connection string (user@host:port).
    pub fn connection_string(&self) -> String {
        if self.port == DEFAULT_SSH_PORT {
            format!("{}@{}", self.user, self.address)
        } else {
            format!("{}@{}:{}", self.user, self.address, self.port)
        }
    }
}

/// Specification of one benchmark job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Benchmark tool install directory on the master host.
    pub install_dir: String,

    /// Remote path of the workload config template.
    pub template: String,

    /// Remote output root for this job.
    pub output_dir: String,

    /// Shard directory width per group.
    pub shard_width: u32,

    /// Number of shard groups per template entry.
    pub shard_count: u32,

    /// Baseline thread count; rounded up to a multiple of
    /// `shard_count * multiple`.
    pub thread_baseline: u32,

    /// Thread fan-out multiplier.
    pub multiple: u32,

    /// Measurement duration. Accepts seconds or "<n>h"/"<n>m"/"<n>s".
    #[serde(default)]
    pub elapsed: Option<String>,

    /// Target operation rate per second ("max" by default).
    #[serde(default = "default_fwdrate")]
    pub fwdrate: String,

    /// Nesting depth of the shard directory tree.
    #[serde(default = "default_dir_depth")]
    pub dir_depth: u32,

    /// Warm-up seconds excluded from reported series.
    #[serde(default = "default_warmup")]
    pub warmup: u64,

    /// Drop caches and remount anchors before measurement, and sample
    /// disk statistics while it runs.
    #[serde(default)]
    pub refresh_mounts: bool,

    /// Minimum length in seconds for a zero-rate stretch to be reported.
    /// Assumes one-second log intervals.
    #[serde(default = "default_zero_threshold")]
    pub zero_threshold: u64,
}

fn default_zero_threshold() -> u64 {
    3
}

fn default_fwdrate() -> String {
    "max".to_string()
}

fn default_dir_depth() -> u32 {
    1
}

fn default_warmup() -> u64 {
    60
}

impl JobSpec {
    /// Measurement duration in seconds, after parsing any unit suffix.
    pub fn elapsed_secs(&self, default: u64) -> Result<u64> {
        match &self.elapsed {
            Some(s) => parse_duration_secs(s),
            None => Ok(default),
        }
    }

    /// Structural tag of the shard layout, compared against the remote
    /// marker file to decide whether re-preparation is required.
    pub fn structure_tag(&self) -> String {
        format!("{}&{}", self.shard_count, self.shard_width)
    }
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| BenchError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(BenchError::Config("Requires at least one host".into()));
        }
        let masters = self.hosts.iter().filter(|h| h.role == MASTER_ROLE).count();
        if masters != 1 {
            return Err(BenchError::Config(format!(
                "Requires exactly one host with role='{}', found {}",
                MASTER_ROLE, masters
            )));
        }
        if self.job.shard_count == 0 || self.job.shard_width == 0 || self.job.multiple == 0 {
            return Err(BenchError::Config(
                "shard_width, shard_count and multiple must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Resolved control-file path.
    pub fn monitor_path(&self) -> std::path::PathBuf {
        match &self.monitor_file {
            Some(p) => std::path::PathBuf::from(p),
            None => dirs::home_dir()
                .unwrap_or_else(|| std::path::PathBuf::from("."))
                .join("fleetbench.mon"),
        }
    }
}

/// Parses a duration string to seconds.
///
/// A bare number is seconds; a trailing `h`/`m`/`s` scales accordingly,
/// so `7200` == `7200s` == `120m` == `2h`.
pub fn parse_duration_secs(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BenchError::Config("Empty duration".into()));
    }
    if value.chars().last().unwrap().is_ascii_digit() {
        return value
            .parse::<u64>()
            .map_err(|_| BenchError::Config(format!("Invalid duration: {}", value)));
    }
    let (num, unit) = value.split_at(value.len() - 1);
    let num: u64 = num
        .parse()
        .map_err(|_| BenchError::Config(format!("Invalid duration: {}", value)))?;
    match unit.to_ascii_lowercase().as_str() {
        "h" => Ok(num * 3600),
        "m" => Ok(num * 60),
        "s" => Ok(num),
        _ => Err(BenchError::Config(format!(
            "Invalid duration unit: {}. Valid units: h/m/s",
            value
        ))),
    }
}
