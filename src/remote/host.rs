//! Per-host facade over a [`RemoteSession`].
//!
//! File and process operations are phrased differently on POSIX shells and
//! PowerShell; [`HostCommands`] is the strategy seam between the two. The
//! family is probed once at connect time (a successful `uname` means POSIX)
//! unless the configuration pins it. Operations with no Windows counterpart
//! (cache dropping, disk statistics) report [`BenchError::Unsupported`] and
//! callers decide whether that is fatal.

use crate::config::{HostConfig, OsFamily};
use crate::error::{BenchError, Result};
use crate::remote::session::RemoteSession;
use crate::remote::transport::{SshTransport, Transport};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

/// Settle time between launching a background process and searching the
/// process table for it.
const SPAWN_SETTLE: Duration = Duration::from_secs(3);

/// Timeout for the `uname` family probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// OS-specific command vocabulary.
pub trait HostCommands: Send {
    fn family(&self) -> OsFamily;
    fn path_exists(&self, session: &mut RemoteSession, path: &str) -> Result<bool>;
    fn is_dir(&self, session: &mut RemoteSession, path: &str) -> Result<bool>;
    fn read_file(&self, session: &mut RemoteSession, path: &str) -> Result<String>;
    fn remove(&self, session: &mut RemoteSession, path: &str) -> Result<()>;
    fn make_dirs(&self, session: &mut RemoteSession, path: &str) -> Result<()>;
    fn copy(&self, session: &mut RemoteSession, src: &str, dst: &str) -> Result<()>;

    /// Replaces every `pattern` match in the file in place. The pattern is
    /// interpreted by the remote tool (`sed` or `-replace`), not locally.
    fn replace_content(
        &self,
        session: &mut RemoteSession,
        path: &str,
        pattern: &str,
        replacement: &str,
    ) -> Result<()>;

    /// Lines of the file matching `pattern`.
    fn search_content(&self, session: &mut RemoteSession, path: &str, pattern: &str) -> Result<Vec<String>>;

    fn file_contains(&self, session: &mut RemoteSession, path: &str, pattern: &str) -> Result<bool>;
    fn last_line(&self, session: &mut RemoteSession, path: &str) -> Result<String>;
    fn line_count(&self, session: &mut RemoteSession, path: &str) -> Result<u64>;

    /// Launches `command` detached from the session, redirecting its output
    /// to `log_file`, and returns its pid. `keywords` identify the process
    /// in the process table when the launch itself does not reveal the pid.
    fn spawn_background(
        &self,
        session: &mut RemoteSession,
        command: &str,
        log_file: &str,
        keywords: &[String],
    ) -> Result<u32>;

    /// Pids of processes whose command line contains every keyword,
    /// oldest first.
    fn find_pids(&self, session: &mut RemoteSession, keywords: &[String]) -> Result<Vec<u32>>;

    fn pid_exists(&self, session: &mut RemoteSession, pid: u32) -> Result<bool>;
    fn kill(&self, session: &mut RemoteSession, pid: u32) -> Result<()>;
    fn drop_caches(&self, session: &mut RemoteSession) -> Result<()>;

    /// Starts the disk statistics sampler and returns its pid, so collection
    /// stops exactly that process and nothing else.
    fn start_iostat(&self, session: &mut RemoteSession, interval: u64, out_file: &str) -> Result<u32>;
}

///// One connected host: session, detected command vocabulary, and the
/// identity it was configured with.
pub struct RemoteHost {
    config: HostConfig,
    session: RemoteSession,
    commands: Box<dyn HostCommands>,
}

impl RemoteHost {
    /// Connects, authenticates, and probes the OS family.
    pub fn connect(config: HostConfig) -> Result<Self> {
        let transport = SshTransport::connect(config.clone())?;
        Self::with_transport(config, Box::new(transport))
    }

    /// Builds a host over an already-constructed transport.
    pub fn with_transport(config: HostConfig, transport: Box<dyn Transport>) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout);
        let mut session = RemoteSession::new(config.address.clone(), transport, timeout);
        let family = match config.os {
            Some(family) => family,
            None => detect_os(&mut session)?,
        };
        let commands: Box<dyn HostCommands> = match family {
            OsFamily::Posix => Box::new(PosixCommands),
            OsFamily::Windows => {
                session.use_windows_prompt();
                Box::new(WindowsCommands)
            }
        };
        info!("Host {} is {:?} ({})", config.address, family, config.role);
        Ok(Self {
            config,
            session,
            commands,
        })
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn role(&self) -> &str {
        &self.config.role
    }

    pub fn os(&self) -> OsFamily {
        self.commands.family()
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn anchor(&self) -> Option<&str> {
        self.config.anchor_path.as_deref()
    }

    pub fn session_mut(&mut self) -> &mut RemoteSession {
        &mut self.session
    }

    /// Runs a command and returns its output regardless of status.
    pub fn exec(&mut self, command: &str) -> Result<crate::remote::transport::ExecOutput> {
        self.session.exec(command)
    }

    /// Runs a command and fails on a nonzero exit status.
    pub fn run_ok(&mut self, command: &str) -> Result<String> {
        let out = self.session.exec(command)?;
        if out.status != 0 {
            return Err(BenchError::RemoteCommand {
                host: self.config.address.clone(),
                command: command.to_string(),
                status: out.status,
                detail: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }

    pub fn path_exists(&mut self, path: &str) -> Result<bool> {
        self.commands.path_exists(&mut self.session, path)
    }

    pub fn is_dir(&mut self, path: &str) -> Result<bool> {
        self.commands.is_dir(&mut self.session, path)
    }

    pub fn read_file(&mut self, path: &str) -> Result<String> {
        self.commands.read_file(&mut self.session, path)
    }

    pub fn replace_content(&mut self, path: &str, pattern: &str, replacement: &str) -> Result<()> {
        self.commands.replace_content(&mut self.session, path, pattern, replacement)
    }

    pub fn search_content(&mut self, path: &str, pattern: &str) -> Result<Vec<String>> {
        self.commands.search_content(&mut self.session, path, pattern)
    }

    pub fn file_contains(&mut self, path: &str, pattern: &str) -> Result<bool> {
        self.commands.file_contains(&mut self.session, path, pattern)
    }

    pub fn last_line(&mut self, path: &str) -> Result<String> {
        self.commands.last_line(&mut self.session, path)
    }

    pub fn line_count(&mut self, path: &str) -> Result<u64> {
        self.commands.line_count(&mut self.session, path)
    }

    /// Writes a remote file, replacing any existing contents.
    pub fn write_file(&mut self, path: &str, content: &str) -> Result<()> {
        self.session.put(path, content.as_bytes())
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.commands.remove(&mut self.session, path)
    }

    pub fn make_dirs(&mut self, path: &str) -> Result<()> {
        self.commands.make_dirs(&mut self.session, path)
    }

    pub fn copy(&mut self, src: &str, dst: &str) -> Result<()> {
        self.commands.copy(&mut self.session, src, dst)
    }

    pub fn spawn_background(&mut self, command: &str, log_file: &str, keywords: &[String]) -> Result<u32> {
        self.commands
            .spawn_background(&mut self.session, command, log_file, keywords)
    }

    pub fn find_pids(&mut self, keywords: &[String]) -> Result<Vec<u32>> {
        self.commands.find_pids(&mut self.session, keywords)
    }

    pub fn pid_exists(&mut self, pid: u32) -> Result<bool> {
        self.commands.pid_exists(&mut self.session, pid)
    }

    pub fn kill(&mut self, pid: u32) -> Result<()> {
        self.commands.kill(&mut self.session, pid)
    }

    /// Kills every process matching the keywords. Returns how many were
    /// signalled.
    pub fn kill_by_keywords(&mut self, keywords: &[String]) -> Result<usize> {
        let pids = self.find_pids(keywords)?;
        for pid in &pids {
            if let Err(e) = self.kill(*pid) {
                warn!("[{}] Failed to kill pid {}: {}", self.config.address, pid, e);
            }
        }
        Ok(pids.len())
    }

    pub fn drop_caches(&mut self) -> Result<()> {
        self.commands.drop_caches(&mut self.session)
    }

    /// Unmounts and re-mounts the anchor using the configured commands.
    /// A failed unmount is logged and the mount is attempted anyway.
    pub fn refresh_mount(&mut self) -> Result<()> {
        let (umount, mount) = match (&self.config.umount_command, &self.config.mount_command) {
            (Some(u), Some(m)) => (u.clone(), m.clone()),
            _ => {
                debug!("[{}] No mount commands configured, skipping refresh", self.config.address);
                return Ok(());
            }
        };
        let out = self.session.exec(&umount)?;
        if out.status != 0 {
            warn!("[{}] umount failed (status {}): {}", self.config.address, out.status, out.stderr.trim());
        }
        self.run_ok(&mount)?;
        Ok(())
    }

    /// Starts the disk statistics sampler and returns its pid.
    pub fn start_iostat(&mut self, interval: u64, out_file: &str) -> Result<u32> {
        self.commands.start_iostat(&mut self.session, interval, out_file)
    }

    /// Stops the sampler started by [`start_iostat`] and returns the
    /// averaged per-device figures from its output file.
    ///
    /// [`start_iostat`]: RemoteHost::start_iostat
    pub fn collect_iostat(&mut self, pid: u32, out_file: &str) -> Result<Vec<DeviceStats>> {
        self.kill(pid)?;
        let content = self.read_file(out_file)?;
        parse_iostat(&content)
    }
}

/// Probes the OS family. `uname` succeeding means a POSIX shell; any
/// non-transport failure means PowerShell.
fn detect_os(session: &mut RemoteSession) -> Result<OsFamily> {
    match session.exec_with_timeout("uname", PROBE_TIMEOUT) {
        Ok(out) if out.status == 0 => Ok(OsFamily::Posix),
        Ok(_) => Ok(OsFamily::Windows),
        Err(e) if e.is_connectivity() => Err(e),
        Err(e) => {
            debug!("uname probe failed ({}), assuming Windows", e);
            Ok(OsFamily::Windows)
        }
    }
}

pub struct PosixCommands;

impl HostCommands for PosixCommands {
    fn family(&self) -> OsFamily {
        OsFamily::Posix
    }

    fn path_exists(&self, session: &mut RemoteSession, path: &str) -> Result<bool> {
        Ok(session.exec(&format!("test -e {}", path))?.status == 0)
    }

    fn is_dir(&self, session: &mut RemoteSession, path: &str) -> Result<bool> {
        Ok(session.exec(&format!("test -d {}", path))?.status == 0)
    }

    fn replace_content(
        &self,
        session: &mut RemoteSession,
        path: &str,
        pattern: &str,
        replacement: &str,
    ) -> Result<()> {
        run_checked(session, &format!("sed -i 's/{}/{}/g' {}", pattern, replacement, path))
    }

    fn search_content(&self, session: &mut RemoteSession, path: &str, pattern: &str) -> Result<Vec<String>> {
        // grep exits 1 on no match; that is an empty result, not a failure.
        let out = session.exec(&format!("grep '{}' {}", pattern, path))?;
        Ok(out.stdout.lines().map(str::to_string).collect())
    }

    fn file_contains(&self, session: &mut RemoteSession, path: &str, pattern: &str) -> Result<bool> {
        Ok(session.exec(&format!("grep -q '{}' {}", pattern, path))?.status == 0)
    }

    fn last_line(&self, session: &mut RemoteSession, path: &str) -> Result<String> {
        let out = session.exec(&format!("tail -n 1 {}", path))?;
        Ok(out.stdout.trim_end().to_string())
    }

    fn line_count(&self, session: &mut RemoteSession, path: &str) -> Result<u64> {
        let out = session.exec(&format!("wc -l < {}", path))?;
        out.stdout
            .trim()
            .parse()
            .map_err(|_| BenchError::Parse(format!("wc reply {:?} for {}", out.stdout.trim(), path)))
    }

    fn read_file(&self, session: &mut RemoteSession, path: &str) -> Result<String> {
        let out = session.exec(&format!("cat {}", path))?;
        if out.status != 0 {
            return Err(BenchError::RemoteCommand {
                host: session.host().to_string(),
                command: format!("cat {}", path),
                status: out.status,
                detail: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }

    fn remove(&self, session: &mut RemoteSession, path: &str) -> Result<()> {
        session.exec(&format!("rm -rf {}", path))?;
        Ok(())
    }

    fn make_dirs(&self, session: &mut RemoteSession, path: &str) -> Result<()> {
        run_checked(session, &format!("mkdir -p {}", path))
    }

    fn copy(&self, session: &mut RemoteSession, src: &str, dst: &str) -> Result<()> {
        run_checked(session, &format!("cp {} {}", src, dst))
    }

    fn spawn_background(
        &self,
        session: &mut RemoteSession,
        command: &str,
        log_file: &str,
        keywords: &[String],
    ) -> Result<u32> {
        let launch = format!("nohup {} > {} 2>&1 &", command, log_file);
        let out = session.interact(&launch)?;
        // Job control reports "[1] 12345" on launch.
        let job = Regex::new(r"\[\d+\] (\d+)").unwrap();
        if let Some(caps) = job.captures(&out.stdout) {
            if let Ok(pid) = caps[1].parse() {
                return Ok(pid);
            }
        }
        debug!("No job-control pid in {:?}, searching process table", out.stdout);
        thread::sleep(SPAWN_SETTLE);
        let pids = self.find_pids(session, keywords)?;
        pids.first().copied().ok_or_else(|| BenchError::RemoteCommand {
            host: session.host().to_string(),
            command: launch,
            status: -1,
            detail: format!("no process matching {:?} after launch", keywords),
        })
    }

    fn find_pids(&self, session: &mut RemoteSession, keywords: &[String]) -> Result<Vec<u32>> {
        // Quoted so dots and slashes in config paths match literally.
        let filters: String = keywords
            .iter()
            .map(|k| format!(" | grep '{}'", k))
            .collect();
        let command = format!("ps aux{} | grep -v grep | awk '{{print $2}}'", filters);
        let out = session.exec(&command)?;
        Ok(out
            .stdout
            .lines()
            .filter_map(|l| l.trim().parse::<u32>().ok())
            .collect())
    }

    fn pid_exists(&self, session: &mut RemoteSession, pid: u32) -> Result<bool> {
        Ok(session.exec(&format!("ps -p {}", pid))?.status == 0)
    }

    fn kill(&self, session: &mut RemoteSession, pid: u32) -> Result<()> {
        session.exec(&format!("kill -9 {}", pid))?;
        Ok(())
    }

    fn drop_caches(&self, session: &mut RemoteSession) -> Result<()> {
        run_checked(session, "sync; echo 3 > /proc/sys/vm/drop_caches")
    }

    fn start_iostat(&self, session: &mut RemoteSession, interval: u64, out_file: &str) -> Result<u32> {
        let command = format!("iostat -d -k {}", interval);
        self.spawn_background(session, &command, out_file, &["iostat".to_string()])
    }
}

fn run_checked(session: &mut RemoteSession, command: &str) -> Result<()> {
    let out = session.exec(command)?;
    if out.status != 0 {
        return Err(BenchError::RemoteCommand {
            host: session.host().to_string(),
            command: command.to_string(),
            status: out.status,
            detail: out.stderr.trim().to_string(),
        });
    }
    Ok(())
}

pub struct WindowsCommands;

#[derive(Debug, Deserialize)]
struct WmiProcess {
    #[serde(rename = "ProcessId")]
    process_id: u32,
    #[serde(rename = "CommandLine")]
    #[allow(dead_code)]
    command_line: Option<String>,
    #[serde(rename = "CreationDate")]
    creation_date: Option<String>,
}

/// Parses the `ConvertTo-Json -Compress` reply of a WMI process query.
/// A single match serializes as an object, several as an array; pids come
/// back oldest first (WMI creation dates sort lexicographically).
fn parse_wmi_processes(json: &str) -> Result<Vec<u32>> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(Vec::new());
    }
    let mut procs: Vec<WmiProcess> = if json.starts_with('[') {
        serde_json::from_str(json).map_err(|e| BenchError::Parse(format!("WMI reply: {}", e)))?
    } else {
        vec![serde_json::from_str(json).map_err(|e| BenchError::Parse(format!("WMI reply: {}", e)))?]
    };
    procs.sort_by(|a, b| a.creation_date.cmp(&b.creation_date));
    Ok(procs.into_iter().map(|p| p.process_id).collect())
}

impl HostCommands for WindowsCommands {
    fn family(&self) -> OsFamily {
        OsFamily::Windows
    }

    fn path_exists(&self, session: &mut RemoteSession, path: &str) -> Result<bool> {
        let out = session.interact(&format!("Test-Path \"{}\"", path))?;
        Ok(out.stdout.contains("True"))
    }

    fn is_dir(&self, session: &mut RemoteSession, path: &str) -> Result<bool> {
        let out = session.interact(&format!("Test-Path \"{}\" -PathType Container", path))?;
        Ok(out.stdout.contains("True"))
    }

    fn replace_content(
        &self,
        session: &mut RemoteSession,
        path: &str,
        pattern: &str,
        replacement: &str,
    ) -> Result<()> {
        interact_checked(
            session,
            &format!(
                "(Get-Content \"{0}\") -replace '{1}', '{2}' | Set-Content \"{0}\"",
                path, pattern, replacement
            ),
        )
    }

    fn search_content(&self, session: &mut RemoteSession, path: &str, pattern: &str) -> Result<Vec<String>> {
        let out = session.interact(&format!(
            "Select-String -Pattern '{}' -Path \"{}\" | ForEach-Object {{ $_.Line }}",
            pattern, path
        ))?;
        Ok(out.stdout.lines().map(str::to_string).collect())
    }

    fn file_contains(&self, session: &mut RemoteSession, path: &str, pattern: &str) -> Result<bool> {
        Ok(!self.search_content(session, path, pattern)?.is_empty())
    }

    fn last_line(&self, session: &mut RemoteSession, path: &str) -> Result<String> {
        let out = session.interact(&format!("Get-Content \"{}\" -Tail 1", path))?;
        Ok(out.stdout.trim_end().to_string())
    }

    fn line_count(&self, session: &mut RemoteSession, path: &str) -> Result<u64> {
        let out = session.interact(&format!("(Get-Content \"{}\").Length", path))?;
        out.stdout
            .trim()
            .lines()
            .last()
            .unwrap_or("")
            .trim()
            .parse()
            .map_err(|_| BenchError::Parse(format!("line count reply {:?} for {}", out.stdout.trim(), path)))
    }

    fn read_file(&self, session: &mut RemoteSession, path: &str) -> Result<String> {
        let out = session.interact(&format!("Get-Content -Raw \"{}\"", path))?;
        if out.status != 0 {
            return Err(BenchError::RemoteCommand {
                host: session.host().to_string(),
                command: format!("Get-Content -Raw \"{}\"", path),
                status: out.status,
                detail: String::new(),
            });
        }
        Ok(out.stdout)
    }

    fn remove(&self, session: &mut RemoteSession, path: &str) -> Result<()> {
        session.interact(&format!(
            "Remove-Item -Recurse -Force -ErrorAction SilentlyContinue \"{}\"",
            path
        ))?;
        Ok(())
    }

    fn make_dirs(&self, session: &mut RemoteSession, path: &str) -> Result<()> {
        interact_checked(
            session,
            &format!("New-Item -ItemType Directory -Force -Path \"{}\" | Out-Null", path),
        )
    }

    fn copy(&self, session: &mut RemoteSession, src: &str, dst: &str) -> Result<()> {
        interact_checked(session, &format!("Copy-Item \"{}\" \"{}\" -Force", src, dst))
    }

    fn spawn_background(
        &self,
        session: &mut RemoteSession,
        command: &str,
        log_file: &str,
        keywords: &[String],
    ) -> Result<u32> {
        let launch = format!(
            "Start-Job -ScriptBlock {{ {} *> \"{}\" }} | Out-Null",
            command, log_file
        );
        interact_checked(session, &launch)?;
        thread::sleep(SPAWN_SETTLE);
        let pids = self.find_pids(session, keywords)?;
        // A job wrapper may spawn helpers; the oldest match is the target.
        pids.first().copied().ok_or_else(|| BenchError::RemoteCommand {
            host: session.host().to_string(),
            command: launch,
            status: -1,
            detail: format!("no process matching {:?} after launch", keywords),
        })
    }

    fn find_pids(&self, session: &mut RemoteSession, keywords: &[String]) -> Result<Vec<u32>> {
        let filter = keywords
            .iter()
            .map(|k| format!("commandline like '%{}%'", k))
            .collect::<Vec<_>>()
            .join(" and ");
        let query = format!(
            "Get-WmiObject Win32_Process -Filter \"{}\" | Select-Object ProcessId, CommandLine, CreationDate | ConvertTo-Json -Compress",
            filter
        );
        let out = session.interact(&query)?;
        parse_wmi_processes(&out.stdout)
    }

    fn pid_exists(&self, session: &mut RemoteSession, pid: u32) -> Result<bool> {
        let out = session.interact(&format!("Get-Process -Id {} -ErrorAction SilentlyContinue", pid))?;
        Ok(out.status == 0 && !out.stdout.trim().is_empty())
    }

    fn kill(&self, session: &mut RemoteSession, pid: u32) -> Result<()> {
        session.interact(&format!("Stop-Process -Id {} -Force", pid))?;
        Ok(())
    }

    fn drop_caches(&self, _session: &mut RemoteSession) -> Result<()> {
        Err(BenchError::Unsupported("drop_caches"))
    }

    fn start_iostat(&self, _session: &mut RemoteSession, _interval: u64, _out_file: &str) -> Result<u32> {
        Err(BenchError::Unsupported("iostat"))
    }
}

fn interact_checked(session: &mut RemoteSession, command: &str) -> Result<()> {
    let out = session.interact(command)?;
    if out.status != 0 {
        return Err(BenchError::RemoteCommand {
            host: session.host().to_string(),
            command: command.to_string(),
            status: out.status,
            detail: out.stdout.trim().to_string(),
        });
    }
    Ok(())
}

/// Per-device figures averaged over every report section in an `iostat -d -k`
/// capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStats {
    pub device: String,
    pub tps: f64,
    pub kb_read_s: f64,
    pub kb_wrtn_s: f64,
    pub kb_read: f64,
    pub kb_wrtn: f64,
}

/// Parses `iostat -d -k` output. Sections are counted by their
/// `Device ...` header lines; each device's columns are summed across
/// sections and divided by the section count.
pub fn parse_iostat(content: &str) -> Result<Vec<DeviceStats>> {
    let mut sections = 0usize;
    let mut sums: BTreeMap<String, [f64; 5]> = BTreeMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.to_lowercase().starts_with("device") {
            sections += 1;
            continue;
        }
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() != 6 {
            continue;
        }
        let mut values = [0f64; 5];
        let mut numeric = true;
        for (i, col) in cols[1..].iter().enumerate() {
            match col.parse::<f64>() {
                Ok(v) => values[i] = v,
                Err(_) => {
                    numeric = false;
                    break;
                }
            }
        }
        if !numeric {
            continue;
        }
        let entry = sums.entry(cols[0].to_string()).or_insert([0f64; 5]);
        for i in 0..5 {
            entry[i] += values[i];
        }
    }

    if sections == 0 {
        return Err(BenchError::Parse("no device sections in iostat output".into()));
    }
    let n = sections as f64;
    Ok(sums
        .into_iter()
        .map(|(device, s)| DeviceStats {
            device,
            tps: s[0] / n,
            kb_read_s: s[1] / n,
            kb_wrtn_s: s[2] / n,
            kb_read: s[3] / n,
            kb_wrtn: s[4] / n,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::transport::script::*;

    const IOSTAT_SAMPLE: &str = "\
Linux 5.14.0 (node1) \t08/30/26 \t_x86_64_\t(8 CPU)

Device             tps    kB_read/s    kB_wrtn/s    kB_read    kB_wrtn
sda              10.00        20.00        30.00       1000       2000
sdb               4.00         8.00        12.00        400        800

Device             tps    kB_read/s    kB_wrtn/s    kB_read    kB_wrtn
sda              20.00        40.00        50.00       3000       4000
sdb               6.00        12.00        18.00        600       1200
";

    #[test]
    fn test_parse_iostat_averages_over_sections() {
        let stats = parse_iostat(IOSTAT_SAMPLE).unwrap();
        assert_eq!(stats.len(), 2);
        let sda = &stats[0];
        assert_eq!(sda.device, "sda");
        assert!((sda.tps - 15.0).abs() < 1e-9);
        assert!((sda.kb_read_s - 30.0).abs() < 1e-9);
        assert!((sda.kb_wrtn_s - 40.0).abs() < 1e-9);
        let sdb = &stats[1];
        assert!((sdb.tps - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_iostat_without_sections_is_an_error() {
        assert!(parse_iostat("garbage\n1 2 3\n").is_err());
    }

    #[test]
    fn test_parse_wmi_single_object_and_array() {
        let single = r#"{"ProcessId":4242,"CommandLine":"java -jar tool.jar","CreationDate":"20260830120000.000000+000"}"#;
        assert_eq!(parse_wmi_processes(single).unwrap(), vec![4242]);

        let multiple = r#"[
            {"ProcessId":2,"CommandLine":"b","CreationDate":"20260830120500.000000+000"},
            {"ProcessId":1,"CommandLine":"a","CreationDate":"20260830120000.000000+000"}
        ]"#;
        // Oldest first.
        assert_eq!(parse_wmi_processes(multiple).unwrap(), vec![1, 2]);
        assert_eq!(parse_wmi_processes("").unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_posix_find_pids_builds_keyword_pipeline() {
        let transport = ScriptedTransport::new(|cmd| {
            assert_eq!(
                cmd,
                "ps aux | grep 'tool.jar' | grep 'cfg_1' | grep -v grep | awk '{print $2}'"
            );
            Ok(ok_output("1234\n5678\n"))
        });
        let log = std::sync::Arc::clone(&transport.exec_log);
        let mut session = RemoteSession::new("h", Box::new(transport), Duration::from_secs(1));
        let pids = PosixCommands
            .find_pids(&mut session, &["tool.jar".into(), "cfg_1".into()])
            .unwrap();
        assert_eq!(pids, vec![1234, 5678]);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_posix_spawn_background_takes_job_control_pid() {
        let mut transport = ScriptedTransport::new(|_| Ok(ok_output("")));
        let mut plan = ShellPlan {
            banner: vec![ShellRead::Bytes(b"node:~ #".to_vec())],
            ..Default::default()
        };
        plan.replies.push_back(vec![ShellRead::Bytes(
            b"nohup java -jar tool.jar > /tmp/log 2>&1 &\r\n[1] 9999\r\nnode:~ #".to_vec(),
        )]);
        plan.replies
            .push_back(vec![ShellRead::Bytes(b"echo $?\r\n0\r\nnode:~ #".to_vec())]);
        transport.push_shell(plan);
        let mut session = RemoteSession::new("h", Box::new(transport), Duration::from_secs(1));

        let pid = PosixCommands
            .spawn_background(&mut session, "java -jar tool.jar", "/tmp/log", &[])
            .unwrap();
        assert_eq!(pid, 9999);
    }

    #[test]
    fn test_iostat_lifecycle_kills_recorded_pid() {
        let mut transport = ScriptedTransport::new(|cmd| match cmd {
            "kill -9 777" => Ok(ok_output("")),
            "cat /out/io.log" => Ok(ok_output(IOSTAT_SAMPLE)),
            other => panic!("unexpected command: {}", other),
        });
        let mut plan = ShellPlan {
            banner: vec![ShellRead::Bytes(b"node:~ #".to_vec())],
            ..Default::default()
        };
        plan.replies.push_back(vec![ShellRead::Bytes(
            b"nohup iostat -d -k 5 > /out/io.log 2>&1 &\r\n[1] 777\r\nnode:~ #".to_vec(),
        )]);
        plan.replies
            .push_back(vec![ShellRead::Bytes(b"echo $?\r\n0\r\nnode:~ #".to_vec())]);
        transport.push_shell(plan);
        let mut config = HostConfig::new("10.0.0.1", "root", "host1");
        config.os = Some(OsFamily::Posix);
        let mut host = RemoteHost::with_transport(config, Box::new(transport)).unwrap();

        let pid = host.start_iostat(5, "/out/io.log").unwrap();
        assert_eq!(pid, 777);
        let stats = host.collect_iostat(pid, "/out/io.log").unwrap();
        assert_eq!(stats.len(), 2);
    }

    #[test]
    fn test_posix_content_queries() {
        let transport = ScriptedTransport::new(|cmd| match cmd {
            "grep 'elapsed=' /out/logfile.html" => Ok(ok_output("elapsed=180\nelapsed=5\n")),
            "grep -q 'completed' /out/logfile.html" => Ok(status_output(1)),
            "tail -n 1 /out/logfile.html" => Ok(ok_output("last\n")),
            "wc -l < /out/logfile.html" => Ok(ok_output("  42\n")),
            "sed -i 's/format=.*/format=clean/g' /out/cfg" => Ok(ok_output("")),
            other => panic!("unexpected command: {}", other),
        });
        let mut session = RemoteSession::new("h", Box::new(transport), Duration::from_secs(1));

        let lines = PosixCommands
            .search_content(&mut session, "/out/logfile.html", "elapsed=")
            .unwrap();
        assert_eq!(lines, vec!["elapsed=180", "elapsed=5"]);
        assert!(!PosixCommands
            .file_contains(&mut session, "/out/logfile.html", "completed")
            .unwrap());
        assert_eq!(
            PosixCommands.last_line(&mut session, "/out/logfile.html").unwrap(),
            "last"
        );
        assert_eq!(
            PosixCommands.line_count(&mut session, "/out/logfile.html").unwrap(),
            42
        );
        PosixCommands
            .replace_content(&mut session, "/out/cfg", "format=.*", "format=clean")
            .unwrap();
    }

    #[test]
    fn test_detect_os_from_uname() {
        let mut session = RemoteSession::new(
            "h",
            Box::new(ScriptedTransport::new(|_| Ok(ok_output("Linux")))),
            Duration::from_secs(1),
        );
        assert_eq!(detect_os(&mut session).unwrap(), OsFamily::Posix);

        let mut session = RemoteSession::new(
            "h",
            Box::new(ScriptedTransport::new(|_| Ok(status_output(127)))),
            Duration::from_secs(1),
        );
        assert_eq!(detect_os(&mut session).unwrap(), OsFamily::Windows);
    }
}
