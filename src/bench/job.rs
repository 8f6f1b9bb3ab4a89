//! Job lifecycle stages and remote path layout.

use crate::bench::MONITOR_FILE_NAME;

/// Lifecycle of one benchmark job. Stages only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobStage {
    Init,
    Prepare,
    DonePrepare,
    Measure,
    Complete,
}

impl JobStage {
    /// One-line status announcement for a stage transition.
    pub fn status_message(&self, elapsed: u64) -> String {
        match self {
            JobStage::Init => "File I/O: Initiating".to_string(),
            JobStage::Prepare => "File I/O: Preparing files".to_string(),
            JobStage::DonePrepare => "File I/O: File-preparation completed".to_string(),
            JobStage::Measure => format!("File I/O: Generating workload: {}s", elapsed),
            JobStage::Complete => "File I/O: Completed".to_string(),
        }
    }
}

/// Remote file layout of one job under its output root.
///
/// The cleanup and preparation passes get their own directories so their
/// logs never shadow the measurement logs.
#[derive(Debug, Clone)]
pub struct JobPaths {
    root: String,
    sep: char,
}

impl JobPaths {
    pub fn new(root: impl Into<String>, sep: char) -> Self {
        Self {
            root: root.into(),
            sep,
        }
    }

    pub fn join(&self, dir: &str, name: &str) -> String {
        format!("{}{}{}", dir, self.sep, name)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn measure_dir(&self) -> String {
        self.join(&self.root, "measure")
    }

    pub fn clean_dir(&self) -> String {
        self.join(&self.root, "clean")
    }

    pub fn prepare_dir(&self) -> String {
        self.join(&self.root, "prepare")
    }

    /// The fully rendered workload config for the measurement pass.
    pub fn config_file(&self) -> String {
        self.join(&self.root, "workload.txt")
    }

    pub fn clean_config(&self) -> String {
        self.join(&self.clean_dir(), "clean.txt")
    }

    pub fn prepare_config(&self) -> String {
        self.join(&self.prepare_dir(), "prepare.txt")
    }

    /// The file the tool polls for a shutdown request.
    pub fn monitor_file(&self) -> String {
        self.join(&self.measure_dir(), MONITOR_FILE_NAME)
    }

    pub fn logfile(&self, dir: &str) -> String {
        self.join(dir, "logfile.html")
    }

    pub fn summary(&self, dir: &str) -> String {
        self.join(dir, "summary.html")
    }

    pub fn flatfile(&self, dir: &str) -> String {
        self.join(dir, "flatfile.html")
    }

    pub fn parmscan(&self, dir: &str) -> String {
        self.join(dir, "parmscan.html")
    }

    pub fn launch_log(&self, dir: &str) -> String {
        self.join(dir, "launch.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_are_ordered() {
        assert!(JobStage::Init < JobStage::Prepare);
        assert!(JobStage::Prepare < JobStage::DonePrepare);
        assert!(JobStage::DonePrepare < JobStage::Measure);
        assert!(JobStage::Measure < JobStage::Complete);
    }

    #[test]
    fn test_paths() {
        let paths = JobPaths::new("/tmp/out", '/');
        assert_eq!(paths.measure_dir(), "/tmp/out/measure");
        assert_eq!(paths.monitor_file(), "/tmp/out/measure/vdb.mon");
        assert_eq!(paths.logfile(&paths.prepare_dir()), "/tmp/out/prepare/logfile.html");

        let win = JobPaths::new("C:\\out", '\\');
        assert_eq!(win.config_file(), "C:\\out\\workload.txt");
    }
}
