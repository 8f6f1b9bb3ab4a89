//! Benchmark job lifecycle.
//!
//! One controller owns the fleet for the duration of a job and walks it
//! through cleanup, file preparation, environment refresh, the measured
//! run, graceful shutdown and report collection. Progress is observed
//! purely through the tool's remote log files; operator requests arrive
//! through the shared [`ControlState`].

use crate::bench::config_gen::{render_workload, with_clean_format, with_elapsed, WorkloadParams};
use crate::bench::job::{JobPaths, JobStage};
use crate::bench::{
    DEFAULT_ELAPSED, ELAPSED_PREPARE, EXEC_TIMEOUT, IOSTAT_INTERVAL, PROC_END_TIMEOUT, STOP_TOKEN,
    SUCCESS_MARKER, TAG_FILE_NAME, TAG_READ_TIMEOUT,
};
use crate::config::{JobSpec, OsFamily};
use crate::error::{BenchError, Result};
use crate::logsig::{self, Stage, ZeroInterval};
use crate::metrics::{MetricsAggregator, MetricsReport};
use crate::polling::{PollOutcome, Poller};
use crate::remote::host::DeviceStats;
use crate::remote::Fleet;
use chrono::Local;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::watcher::ControlState;

/// Poll interval while waiting for a run to complete.
const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// One observation of a running tool instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCheck {
    Running,
    Done,
    Failed,
    Stopped,
}

/// Averaged disk statistics of one host.
#[derive(Debug, Clone, Serialize)]
pub struct HostDiskStats {
    pub role: String,
    pub address: String,
    pub devices: Vec<DeviceStats>,
}

/// Outcome of a completed (or operator-stopped) job.
#[derive(Debug, Serialize)]
pub struct JobReport {
    /// Local wall-clock time the report was assembled, RFC 3339.
    pub finished_at: String,
    pub stopped_early: bool,
    /// True when the anchor's layout tag matched and cleanup plus
    /// preparation were skipped.
    pub skipped_preparation: bool,
    pub metrics: Option<MetricsReport>,
    pub zero_intervals: Vec<ZeroInterval>,
    pub disk_stats: Vec<HostDiskStats>,
}

pub struct JobController {
    fleet: Fleet,
    job: JobSpec,
    control: Arc<ControlState>,
    paths: JobPaths,
    executable: String,
    elapsed: u64,
    stage: JobStage,
    pid: Option<u32>,
    /// (role, sampler pid, log path) of every running iostat.
    iostat_logs: Vec<(String, u32, String)>,
    estimate_logged: bool,
}

impl JobController {
    pub fn new(mut fleet: Fleet, job: JobSpec, control: Arc<ControlState>) -> Result<Self> {
        let elapsed = job.elapsed_secs(DEFAULT_ELAPSED)?;
        let master = fleet.master()?;
        let (sep, tool) = match master.os() {
            OsFamily::Posix => ('/', "vdbench"),
            OsFamily::Windows => ('\\', "vdbench.bat"),
        };
        let executable = format!("{}{}{}", job.install_dir, sep, tool);
        let paths = JobPaths::new(job.output_dir.clone(), sep);
        Ok(Self {
            fleet,
            job,
            control,
            paths,
            executable,
            elapsed,
            stage: JobStage::Init,
            pid: None,
            iostat_logs: Vec::new(),
            estimate_logged: false,
        })
    }

    /// Runs the job end to end and collects the report.
    pub fn run(&mut self) -> Result<JobReport> {
        info!("{}", JobStage::Init.status_message(self.elapsed));
        let measure_dir = self.paths.measure_dir();
        {
            let root = self.paths.root().to_string();
            let master = self.fleet.master()?;
            master.make_dirs(&root)?;
            master.make_dirs(&measure_dir)?;
        }

        let (config_text, anchor) = self.render_config()?;
        let skipped_preparation = self.layout_matches_tag(&anchor)?;
        if skipped_preparation {
            info!(
                "Prepared file tree matches layout tag {}, skipping cleanup and preparation",
                self.job.structure_tag()
            );
            self.stage = JobStage::DonePrepare;
        } else {
            if self.clean_pass(&config_text)? == RunCheck::Stopped {
                return self.finish_stopped(skipped_preparation);
            }
            if self.prepare_pass(&config_text, &anchor)? == RunCheck::Stopped {
                return self.finish_stopped(skipped_preparation);
            }
        }

        if self.job.refresh_mounts {
            self.refresh_environment()?;
            self.start_iostat()?;
        }

        info!("File I/O: workload will run for {}", duration_string(self.elapsed));
        let config_file = self.paths.config_file();
        let pid = self.launch(&config_file, &measure_dir, Some(self.job.warmup))?;
        self.pid = Some(pid);
        match self.wait_for_completion(pid, &measure_dir, EXEC_TIMEOUT, true)? {
            RunCheck::Done => {}
            RunCheck::Stopped => return self.finish_stopped(skipped_preparation),
            RunCheck::Failed => {
                self.collect_disk_stats_quietly();
                return Err(BenchError::AbnormalTermination {
                    pid,
                    logfile: self.paths.logfile(&measure_dir),
                });
            }
            RunCheck::Running => {
                return Err(BenchError::CommandTimeout {
                    command: "file I/O measurement".into(),
                    timeout_secs: EXEC_TIMEOUT.as_secs(),
                });
            }
        }

        // The success marker can precede the actual exit by a while; give
        // the process a grace period before forcing the issue.
        debug!("Waiting for process {} to end", pid);
        if !self.wait_process_end(pid, PROC_END_TIMEOUT, Duration::from_secs(5))? {
            debug!("Run completed with process hanging, forcing stop");
            self.stop(false)?;
        }
        self.stage = JobStage::Complete;
        info!("{}", JobStage::Complete.status_message(self.elapsed));

        let metrics = {
            let aggregator = MetricsAggregator::new(&self.executable, &self.paths, self.job.warmup);
            aggregator.collect(self.fleet.master()?)?
        };
        let zero_intervals = self.extract_zero_intervals()?;
        let disk_stats = self.collect_disk_stats_quietly();

        Ok(JobReport {
            finished_at: Local::now().to_rfc3339(),
            stopped_early: false,
            skipped_preparation,
            metrics: Some(metrics),
            zero_intervals,
            disk_stats,
        })
    }

    /// Renders the workload config and writes it to the master. Returns the
    /// rendered text and the anchor path it was built around.
    fn render_config(&mut self) -> Result<(String, String)> {
        let clients: Vec<String> = self.fleet.iter().map(|h| h.address().to_string()).collect();
        let monitor_file = self.paths.monitor_file();
        let config_file = self.paths.config_file();
        let sep = if matches!(self.fleet.master()?.os(), OsFamily::Windows) {
            '\\'
        } else {
            '/'
        };

        let master = self.fleet.master()?;
        let anchor = master
            .anchor()
            .ok_or_else(|| BenchError::Config("master host needs anchor_path".into()))?
            .to_string();
        let template = master.read_file(&self.job.template)?;

        let params = WorkloadParams {
            install_dir: &self.job.install_dir,
            monitor_file: &monitor_file,
            format: "restart",
            fwdrate: &self.job.fwdrate,
            elapsed: self.elapsed,
            shard_width: self.job.shard_width,
            shard_count: self.job.shard_count,
            thread_baseline: self.job.thread_baseline,
            multiple: self.job.multiple,
            dir_depth: self.job.dir_depth,
            anchor_path: &anchor,
            path_sep: sep,
            clients: &clients,
        };
        let rendered = render_workload(&template, &params)?;
        master.write_file(&config_file, &rendered)?;
        debug!("Workload config written to {}", config_file);
        Ok((rendered, anchor))
    }

    /// Compares the layout tag at the anchor root with this job's layout.
    /// A hung read means the mount point itself is gone, which no retry
    /// will fix.
    fn layout_matches_tag(&mut self, anchor: &str) -> Result<bool> {
        let tag_path = self.paths.join(anchor, TAG_FILE_NAME);
        let tag = self.job.structure_tag();
        let master = self.fleet.master()?;
        let address = master.address().to_string();
        match master
            .session_mut()
            .exec_with_timeout(&format!("cat {}", tag_path), TAG_READ_TIMEOUT)
        {
            Ok(out) => Ok(out.status == 0 && out.stdout.trim() == tag),
            Err(BenchError::CommandTimeout { .. }) => Err(BenchError::Connectivity {
                host: address,
                message: format!("mount-point {} may be disconnected, please check", anchor),
            }),
            Err(e) => Err(e),
        }
    }

    /// Runs the tool once in `format=clean` mode to drop the previous file
    /// tree. Failures here are not fatal; the preparation pass rebuilds
    /// from whatever is left.
    fn clean_pass(&mut self, config_text: &str) -> Result<RunCheck> {
        let clean_dir = self.paths.clean_dir();
        let clean_config = self.paths.clean_config();
        {
            let master = self.fleet.master()?;
            master.make_dirs(&clean_dir)?;
            master.write_file(&clean_config, &with_clean_format(config_text))?;
        }
        debug!("Cleaning previous file tree");
        let pid = self.launch(&clean_config, &clean_dir, None)?;
        let outcome = self.wait_for_completion(pid, &clean_dir, EXEC_TIMEOUT, false)?;
        if outcome == RunCheck::Failed || outcome == RunCheck::Running {
            warn!("Cleanup pass did not complete cleanly, continuing");
        }
        Ok(outcome)
    }

    /// Builds the file tree with a minimal measured phase, then records the
    /// layout tag at the anchor root.
    fn prepare_pass(&mut self, config_text: &str, anchor: &str) -> Result<RunCheck> {
        self.stage = JobStage::Prepare;
        info!("{}", JobStage::Prepare.status_message(self.elapsed));

        let prepare_dir = self.paths.prepare_dir();
        let prepare_config = self.paths.prepare_config();
        {
            let master = self.fleet.master()?;
            master.make_dirs(&prepare_dir)?;
            master.write_file(&prepare_config, &with_elapsed(config_text, ELAPSED_PREPARE))?;
        }
        let pid = self.launch(&prepare_config, &prepare_dir, None)?;
        match self.wait_for_completion(pid, &prepare_dir, EXEC_TIMEOUT, false)? {
            RunCheck::Done => {
                let tag_path = self.paths.join(anchor, TAG_FILE_NAME);
                let tag = self.job.structure_tag();
                self.fleet.master()?.write_file(&tag_path, &tag)?;
                self.stage = JobStage::DonePrepare;
                info!("{}", JobStage::DonePrepare.status_message(self.elapsed));
                Ok(RunCheck::Done)
            }
            RunCheck::Stopped => Ok(RunCheck::Stopped),
            RunCheck::Running => {
                let log = self.fleet.master()?.read_file(&self.paths.logfile(&prepare_dir))?;
                if logsig::stage_started(&log, Stage::Measure) {
                    Err(BenchError::PrepareFailed(self.paths.logfile(&prepare_dir)))
                } else {
                    Err(BenchError::PrepareTimedOut(EXEC_TIMEOUT.as_secs()))
                }
            }
            RunCheck::Failed => Err(BenchError::PrepareFailed(self.paths.logfile(&prepare_dir))),
        }
    }

    /// Drops caches and remounts anchors on every host. A failed cache
    /// drop is tolerable; a failed mount is not.
    fn refresh_environment(&mut self) -> Result<()> {
        debug!("Refreshing mounts and caches");
        for host in self.fleet.iter_mut() {
            if let Err(e) = host.drop_caches() {
                warn!("[{}] drop caches failed: {}", host.address(), e);
            }
            host.refresh_mount()?;
        }
        Ok(())
    }

    /// Starts a disk statistics sampler on every host that supports one.
    fn start_iostat(&mut self) -> Result<()> {
        let measure_dir = self.paths.measure_dir();
        let mut logs = Vec::new();
        for host in self.fleet.iter_mut() {
            let path = format!("{}/iostat_{}.log", measure_dir, host.role());
            match host.start_iostat(IOSTAT_INTERVAL, &path) {
                Ok(pid) => {
                    debug!("[{}] iostat started, pid={}, log={}", host.role(), pid, path);
                    logs.push((host.role().to_string(), pid, path));
                }
                Err(BenchError::Unsupported(_)) => {
                    debug!("[{}] disk statistics not supported, skipping", host.role());
                }
                Err(e) => warn!("[{}] failed to start iostat: {}", host.role(), e),
            }
        }
        self.iostat_logs = logs;
        Ok(())
    }

    /// Launches the tool detached on the master and returns its pid.
    fn launch(&mut self, config_file: &str, output_dir: &str, warmup: Option<u64>) -> Result<u32> {
        let mut command = format!("{} -f {} -o {}", self.executable, config_file, output_dir);
        if let Some(w) = warmup {
            command.push_str(&format!(" -w {}", w));
        }
        let launch_log = self.paths.launch_log(output_dir);
        // The jar name pins the java worker (the launcher script also shows
        // up as "vdbench"); the config path pins this run.
        let keywords = vec!["vdbench.jar".to_string(), config_file.to_string()];
        let pid = self
            .fleet
            .master()?
            .spawn_background(&command, &launch_log, &keywords)?;
        debug!("Launched: {} (pid={})", command, pid);
        Ok(pid)
    }

    /// Polls one tool run until it reports success, dies, is stopped by the
    /// operator, or the budget runs out ([`RunCheck::Running`]).
    fn wait_for_completion(
        &mut self,
        pid: u32,
        output_dir: &str,
        timeout: Duration,
        main_run: bool,
    ) -> Result<RunCheck> {
        let poller = Poller::new(timeout, CHECK_INTERVAL).with_label("file-io");
        let outcome = poller.wait_until(
            || self.check_run(pid, output_dir, main_run),
            &[RunCheck::Done],
            &[RunCheck::Failed, RunCheck::Stopped],
        )?;
        Ok(match outcome {
            PollOutcome::Success => RunCheck::Done,
            PollOutcome::Timeout => RunCheck::Running,
            PollOutcome::FailFast => {
                if self.control.stop_requested() {
                    RunCheck::Stopped
                } else {
                    RunCheck::Failed
                }
            }
        })
    }

    fn check_run(&mut self, pid: u32, output_dir: &str, main_run: bool) -> Result<RunCheck> {
        if self.control.stop_requested() {
            return Ok(RunCheck::Stopped);
        }
        self.control.wait_if_paused();
        if self.control.stop_requested() {
            return Ok(RunCheck::Stopped);
        }

        let logfile = self.paths.logfile(output_dir);
        if !self.fleet.master()?.path_exists(&logfile)? {
            return Ok(RunCheck::Running);
        }
        let log = self.fleet.master()?.read_file(&logfile)?;

        if main_run {
            if self.stage < JobStage::Measure && logsig::stage_started(&log, Stage::Measure) {
                self.stage = JobStage::Measure;
                info!("{}", JobStage::Measure.status_message(self.elapsed));
            }
        } else if self.stage == JobStage::Prepare && !self.estimate_logged {
            if let Some(estimate) = logsig::estimate_summary(&log) {
                info!("File I/O structure: {}", estimate);
                self.estimate_logged = true;
            }
        }

        if log.contains(SUCCESS_MARKER) {
            return Ok(RunCheck::Done);
        }
        if self.fleet.master()?.pid_exists(pid)? {
            Ok(RunCheck::Running)
        } else {
            debug!("Process (pid={}) terminated without success marker", pid);
            Ok(RunCheck::Failed)
        }
    }

    /// Blocks until the measurement log shows the given stage, then sleeps
    /// the optional post-delay, e.g. to let a freshly started workload ramp
    /// up before sampling. Read errors are tolerated while waiting; the log
    /// may not exist yet.
    pub fn wait_for_stage(
        &mut self,
        stage: Stage,
        timeout: Duration,
        post_delay: Option<Duration>,
    ) -> Result<PollOutcome> {
        let logfile = self.paths.logfile(&self.paths.measure_dir());
        let poller = Poller::new(timeout, CHECK_INTERVAL)
            .with_label("stage")
            .ignoring_errors();
        let outcome = poller.wait_until(
            || {
                let log = self.fleet.master()?.read_file(&logfile)?;
                Ok(logsig::stage_started(&log, stage))
            },
            &[true],
            &[],
        )?;
        if outcome == PollOutcome::Success {
            if let Some(delay) = post_delay {
                thread::sleep(delay);
            }
        }
        Ok(outcome)
    }

    fn wait_process_end(&mut self, pid: u32, timeout: Duration, interval: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.fleet.master()?.pid_exists(pid)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(interval);
        }
    }

    /// Graceful shutdown: ask the tool to stop through its monitor file,
    /// give it a grace period, then kill the process and sweep every host
    /// for leftovers.
    pub fn stop(&mut self, wait: bool) -> Result<()> {
        let monitor = self.paths.monitor_file();
        self.fleet.master()?.write_file(&monitor, STOP_TOKEN)?;
        if let Some(pid) = self.pid {
            if wait {
                self.wait_process_end(pid, PROC_END_TIMEOUT, Duration::from_secs(2))?;
            }
            self.fleet.master()?.kill(pid)?;
            thread::sleep(Duration::from_secs(5));
            let keywords = vec!["vdbench.jar".to_string()];
            for host in self.fleet.iter_mut() {
                if let Err(e) = host.kill_by_keywords(&keywords) {
                    warn!("[{}] sweep failed: {}", host.address(), e);
                }
            }
        }
        self.stage = JobStage::Complete;
        debug!("Tool stopped (pid={:?})", self.pid);
        Ok(())
    }

    fn finish_stopped(&mut self, skipped_preparation: bool) -> Result<JobReport> {
        info!("Stop requested, shutting down");
        self.stop(true)?;
        let disk_stats = self.collect_disk_stats_quietly();
        Ok(JobReport {
            finished_at: Local::now().to_rfc3339(),
            stopped_early: true,
            skipped_preparation,
            metrics: None,
            zero_intervals: Vec::new(),
            disk_stats,
        })
    }

    /// Zero-rate stretches in the measured data, longest first.
    fn extract_zero_intervals(&mut self) -> Result<Vec<ZeroInterval>> {
        let logfile = self.paths.logfile(&self.paths.measure_dir());
        let log = self.fleet.master()?.read_file(&logfile)?;
        let trimmed = match logsig::trim_to_stage(&log, Stage::Measure) {
            Some(t) => t,
            None => return Ok(Vec::new()),
        };
        let cols = match logsig::rate_columns(&trimmed) {
            Ok(cols) => cols,
            Err(e) => {
                debug!("No rate columns in measured data: {}", e);
                return Ok(Vec::new());
            }
        };
        let rows = logsig::zero_rows(&trimmed, &cols);
        let intervals = logsig::zero_intervals(&rows, self.job.zero_threshold);
        if !intervals.is_empty() {
            warn!("Detected {} zero-rate interval(s)", intervals.len());
        }
        Ok(intervals)
    }

    /// Disk statistics are supplementary; collection failures are logged,
    /// never fatal.
    fn collect_disk_stats_quietly(&mut self) -> Vec<HostDiskStats> {
        let logs = std::mem::take(&mut self.iostat_logs);
        let mut result = Vec::new();
        for (role, pid, path) in logs {
            let host = match self.fleet.by_role(&role) {
                Some(h) => h,
                None => continue,
            };
            let address = host.address().to_string();
            match host.collect_iostat(pid, &path) {
                Ok(devices) => {
                    info!("[{}] avg disk I/O: {}", role, summarize_devices(&devices));
                    result.push(HostDiskStats {
                        role,
                        address,
                        devices,
                    });
                }
                Err(e) => debug!("[{}] collecting disk statistics failed: {}", role, e),
            }
        }
        result
    }
}

fn summarize_devices(devices: &[DeviceStats]) -> String {
    devices
        .iter()
        .map(|d| {
            format!(
                "{}: tps={:.2}, read={:.2} kB/s, write={:.2} kB/s",
                d.device, d.tps, d.kb_read_s, d.kb_wrtn_s
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Human-readable duration, e.g. `2h 0m 30s`.
pub fn duration_string(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
