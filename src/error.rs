use thiserror::Error;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connectivity error ({host}): {message}")]
    Connectivity { host: String, message: String },

    #[error("Command timed out after {timeout_secs}s: {command}")]
    CommandTimeout { command: String, timeout_secs: u64 },

    #[error("Config generation error: {0}")]
    ConfigGeneration(String),

    #[error("File-preparation timed out after {0}s before any measurable start")]
    PrepareTimedOut(u64),

    #[error("File-preparation failed, check log for details: {0}")]
    PrepareFailed(String),

    #[error("Measurement process terminated abnormally (pid={pid}), check log for details: {logfile}")]
    AbnormalTermination { pid: u32, logfile: String },

    #[error("Remote command failed on {host} (status {status}): {command}")]
    RemoteCommand {
        host: String,
        command: String,
        status: i32,
        detail: String,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Operation not supported on this host: {0}")]
    Unsupported(&'static str),
}

impl BenchError {
    /// True for transport-level failures that warrant the single
    /// reconnect-and-retry at the point of failure.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, BenchError::Connectivity { .. })
    }
}

pub type Error = BenchError;
pub type Result<T> = std::result::Result<T, Error>;
