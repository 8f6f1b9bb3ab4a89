//! Interactive session protocol on top of a [`Transport`].
//!
//! A `RemoteSession` owns one persistent shell channel per host and layers
//! the prompt protocol over it: learn the prompt from the login banner,
//! detect command completion by watching for the prompt (or a caller
//! pattern) at the end of the scrubbed receive buffer, strip the command
//! echo and terminator from replies, and probe the exit status of each
//! interactive command. One-shot commands bypass the shell and run on a
//! dedicated channel with a bounded wait for the command-finished signal.
//!
//! Any operation that fails with a connectivity error is retried exactly
//! once after a reconnect. A second failure propagates.

use crate::error::{BenchError, Result};
use crate::remote::transport::{ExecOutput, ShellChannel, Transport, READ_POLL};
use log::{debug, trace, warn};
use regex::Regex;
use std::thread;
use std::time::{Duration, Instant};

/// Fallback terminator pattern: a line ending in `#`, `>` or `$`.
/// Used until the real prompt has been learned.
pub const DEFAULT_EXPECT: &str = r"(?m).+[#>$][ ]*$";

/// Terminator pattern for PowerShell prompts.
pub const WINDOWS_EXPECT: &str = r"(?m)PS .*>[ ]*$";

/// Wait budget for the login banner when the shell is first opened.
const BANNER_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait budget for the exit-status probe.
const STATUS_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// The status probe itself. `$?` resolves to the last exit code on POSIX
/// shells and to `True`/`False` on PowerShell.
const STATUS_PROBE: &str = "echo $?";

/// One authenticated session against a remote host.
pub struct RemoteSession {
    host: String,
    transport: Box<dyn Transport>,
    shell: Option<Box<dyn ShellChannel>>,
    prompt: Option<String>,
    expect: Regex,
    default_timeout: Duration,
    scrub: Regex,
    collapse: Regex,
}

impl RemoteSession {
    pub fn new(host: impl Into<String>, transport: Box<dyn Transport>, default_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            transport,
            shell: None,
            prompt: None,
            expect: Regex::new(DEFAULT_EXPECT).unwrap(),
            default_timeout,
            scrub: Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])|\x0F").unwrap(),
            collapse: Regex::new(r"\n{2,}").unwrap(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Switches completion detection to the PowerShell prompt pattern.
    /// Forgets any previously learned prompt.
    pub fn use_windows_prompt(&mut self) {
        self.expect = Regex::new(WINDOWS_EXPECT).unwrap();
        self.prompt = None;
        self.shell = None;
    }

    fn uses_default_expect(&self) -> bool {
        self.expect.as_str() == DEFAULT_EXPECT
    }

    /// Removes terminal escape sequences and normalizes line endings.
    fn scrub(&self, raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        let text = text.replace("\r\n", "\n").replace('\r', "");
        let text = self.scrub.replace_all(&text, "");
        self.collapse.replace_all(&text, "\n").into_owned()
    }

    fn recover(&mut self, cause: &BenchError) -> Result<()> {
        warn!("[{}] Connection lost ({}), re-connecting once", self.host, cause);
        self.shell = None;
        self.prompt = None;
        self.transport.reconnect()
    }

    /// Runs a command on a dedicated channel and waits for its
    /// command-finished signal, bounded by the session default timeout.
    pub fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        let timeout = self.default_timeout;
        self.exec_with_timeout(command, timeout)
    }

    pub fn exec_with_timeout(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        debug!("[{}] >> {}", self.host, command);
        let result = match self.transport.exec(command, timeout) {
            Err(e) if e.is_connectivity() => {
                self.recover(&e)?;
                self.transport.exec(command, timeout)
            }
            other => other,
        }?;
        trace!("[{}] << status={} stdout={:?}", self.host, result.status, result.stdout);
        Ok(result)
    }

    /// Runs a command on the interactive shell and probes its exit status.
    pub fn interact(&mut self, command: &str) -> Result<ExecOutput> {
        let timeout = self.default_timeout;
        self.interact_with_timeout(command, timeout)
    }

    pub fn interact_with_timeout(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        match self.interact_once(command, timeout, true, None) {
            Err(e) if e.is_connectivity() => {
                self.recover(&e)?;
                self.interact_once(command, timeout, true, None)
            }
            other => other,
        }
    }

    /// Sends input to the interactive shell without waiting for a status,
    /// e.g. to answer an interactive prompt.
    pub fn interact_no_status(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        match self.interact_once(command, timeout, false, None) {
            Err(e) if e.is_connectivity() => {
                self.recover(&e)?;
                self.interact_once(command, timeout, false, None)
            }
            other => other,
        }
    }

    /// Runs a command whose reply ends in `pattern` instead of the shell
    /// prompt, e.g. a tool waiting for further input. No status probe runs;
    /// the shell is not back at a prompt.
    pub fn interact_expect(&mut self, command: &str, pattern: &str, timeout: Duration) -> Result<ExecOutput> {
        let expect = Regex::new(pattern)
            .map_err(|e| BenchError::Config(format!("bad completion pattern {:?}: {}", pattern, e)))?;
        match self.interact_once(command, timeout, false, Some(&expect)) {
            Err(e) if e.is_connectivity() => {
                self.recover(&e)?;
                self.interact_once(command, timeout, false, Some(&expect))
            }
            other => other,
        }
    }

    fn interact_once(
        &mut self,
        command: &str,
        timeout: Duration,
        probe_status: bool,
        expect: Option<&Regex>,
    ) -> Result<ExecOutput> {
        self.ensure_shell()?;
        debug!("[{}] >> {}", self.host, command);

        self.send_line(command)?;
        let (body, _terminator) = self.read_until_complete(timeout, false, expect)?;
        let stdout = strip_echo(command, &body);

        let status = if probe_status { self.probe_status()? } else { 0 };
        trace!("[{}] << status={} stdout={:?}", self.host, status, stdout);
        Ok(ExecOutput {
            stdout,
            stderr: String::new(),
            status,
        })
    }

    fn ensure_shell(&mut self) -> Result<()> {
        if self.shell.is_some() {
            return Ok(());
        }
        self.shell = Some(self.transport.open_shell()?);
        let (banner, terminator) = self.read_until_complete(BANNER_TIMEOUT, false, None)?;
        if self.uses_default_expect() {
            // The last line of the banner is the prompt. Completion checks
            // become an exact suffix match from here on, which is immune to
            // output that merely looks prompt-like.
            let prompt = last_line(&banner, &terminator);
            if !prompt.is_empty() {
                debug!("[{}] Learned prompt {:?}", self.host, prompt);
                self.prompt = Some(prompt);
            }
        }
        Ok(())
    }

    fn send_line(&mut self, command: &str) -> Result<()> {
        let shell = self.shell.as_mut().ok_or_else(|| BenchError::Connectivity {
            host: self.host.clone(),
            message: "shell not open".into(),
        })?;
        shell.send(&format!("{}\n", command))
    }

    /// Accumulates shell output until the terminator appears at the end of
    /// the scrubbed buffer. Returns the buffer split into body and matched
    /// terminator.
    fn read_until_complete(
        &mut self,
        timeout: Duration,
        probing: bool,
        expect: Option<&Regex>,
    ) -> Result<(String, String)> {
        let mut shell = self.shell.take().ok_or_else(|| BenchError::Connectivity {
            host: self.host.clone(),
            message: "shell not open".into(),
        })?;
        let deadline = Instant::now() + timeout;
        let mut raw: Vec<u8> = Vec::new();
        let result = loop {
            match shell.read_chunk() {
                Ok(Some(chunk)) => {
                    raw.extend_from_slice(&chunk);
                    let scrubbed = self.scrub(&raw);
                    if let Some(split) = self.completion_split(&scrubbed, probing, expect) {
                        break Ok(split);
                    }
                }
                Ok(None) => thread::sleep(READ_POLL),
                Err(e) => break Err(e),
            }
            if Instant::now() >= deadline {
                break Err(BenchError::CommandTimeout {
                    command: "<interactive>".into(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        };
        // A failed wait leaves the channel in an unknown state; the retry
        // path opens a fresh shell instead.
        if result.is_ok() {
            self.shell = Some(shell);
        }
        result
    }

    /// Checks whether `scrubbed` ends with the session terminator (or the
    /// caller's pattern), and if so splits off the terminator.
    fn completion_split(&self, scrubbed: &str, probing: bool, expect: Option<&Regex>) -> Option<(String, String)> {
        let trimmed = scrubbed.trim_end();
        if let Some(re) = expect {
            let m = re.find_iter(trimmed).last()?;
            if m.end() != trimmed.len() {
                return None;
            }
            return Some((trimmed[..m.start()].to_string(), m.as_str().to_string()));
        }
        if let (Some(prompt), true) = (&self.prompt, self.uses_default_expect()) {
            if trimmed.ends_with(prompt.as_str()) {
                let body = &trimmed[..trimmed.len() - prompt.len()];
                return Some((body.to_string(), prompt.clone()));
            }
            return None;
        }
        let m = self.expect.find_iter(trimmed).last()?;
        if m.end() != trimmed.len() {
            return None;
        }
        // The probe's own echo ends in "echo $" once the shell wraps or the
        // scrubber splits it; that is not a prompt.
        if probing && m.as_str().trim_end().ends_with("echo $") {
            return None;
        }
        Some((trimmed[..m.start()].to_string(), m.as_str().to_string()))
    }

    /// Asks the shell for the exit status of the previous command.
    ///
    /// POSIX shells answer with a number, PowerShell with `True`/`False`
    /// (mapped to 0/-1). An unparseable answer is logged and treated as 0
    /// rather than failing the command that just completed.
    fn probe_status(&mut self) -> Result<i32> {
        self.send_line(STATUS_PROBE)?;
        let (body, _terminator) = self.read_until_complete(STATUS_PROBE_TIMEOUT, true, None)?;
        let answer = strip_echo(STATUS_PROBE, &body);
        if answer.contains("False") {
            return Ok(-1);
        }
        if answer.contains("True") {
            return Ok(0);
        }
        match answer.lines().last().map(str::trim).unwrap_or("").parse::<i32>() {
            Ok(code) => Ok(code),
            Err(_) => {
                warn!("[{}] Could not parse exit status from {:?}, assuming 0", self.host, answer);
                Ok(0)
            }
        }
    }

    /// Fetches a remote file as text.
    pub fn fetch(&mut self, remote: &str) -> Result<String> {
        let data = match self.transport.download(remote) {
            Err(e) if e.is_connectivity() => {
                self.recover(&e)?;
                self.transport.download(remote)
            }
            other => other,
        }?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Writes a remote file, replacing any existing contents.
    pub fn put(&mut self, remote: &str, data: &[u8]) -> Result<()> {
        match self.transport.upload(remote, data) {
            Err(e) if e.is_connectivity() => {
                self.recover(&e)?;
                self.transport.upload(remote, data)
            }
            other => other,
        }
    }
}

/// Removes the leading command echo a pty reflects back.
fn strip_echo(command: &str, text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with(command) {
        trimmed.replacen(command, "", 1).trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// Last non-empty line of the banner body, or the matched terminator when
/// the banner is nothing but the prompt.
fn last_line(body: &str, terminator: &str) -> String {
    let tail = format!("{}{}", body, terminator);
    tail.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::transport::script::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    const PROMPT: &str = "server:~ #";

    fn bytes(s: &str) -> ShellRead {
        ShellRead::Bytes(s.as_bytes().to_vec())
    }

    /// A shell plan answering one command plus its status probe.
    fn one_command_plan(command_reply: &str, status_reply: &str) -> ShellPlan {
        let mut plan = ShellPlan {
            banner: vec![bytes(&format!("Last login: today\n{} ", PROMPT))],
            ..Default::default()
        };
        plan.replies.push_back(vec![bytes(command_reply)]);
        plan.replies.push_back(vec![bytes(status_reply)]);
        plan
    }

    fn session_with(transport: ScriptedTransport) -> RemoteSession {
        RemoteSession::new("test-host", Box::new(transport), Duration::from_secs(1))
    }

    #[test]
    fn test_interact_learns_prompt_and_strips_terminator() {
        let mut transport = ScriptedTransport::new(|_| Ok(ok_output("")));
        transport.push_shell(one_command_plan(
            &format!("ls /data\r\nfile1\r\nfile2\r\n{} ", PROMPT),
            &format!("echo $?\r\n0\r\n{} ", PROMPT),
        ));
        let mut session = session_with(transport);

        let out = session.interact("ls /data").unwrap();
        assert_eq!(out.stdout, "file1\nfile2");
        assert_eq!(out.status, 0);
    }

    #[test]
    fn test_interact_scrubs_ansi_escapes() {
        let mut transport = ScriptedTransport::new(|_| Ok(ok_output("")));
        transport.push_shell(one_command_plan(
            &format!("cat f\r\n\x1b[01;32mgreen\x1b[0m text\r\n{} ", PROMPT),
            &format!("echo $?\r\n0\r\n{} ", PROMPT),
        ));
        let mut session = session_with(transport);

        let out = session.interact("cat f").unwrap();
        assert_eq!(out.stdout, "green text");
    }

    #[test]
    fn test_prompt_like_output_does_not_complete_early() {
        // Output contains a line ending in '#', which matches the fallback
        // pattern but not the learned prompt. The command must not complete
        // until the real prompt arrives.
        let mut plan = ShellPlan {
            banner: vec![bytes(&format!("welcome\n{} ", PROMPT))],
            ..Default::default()
        };
        plan.replies.push_back(vec![
            bytes("cat notes\r\nsection #\r\n"),
            bytes(&format!("more\r\n{} ", PROMPT)),
        ]);
        plan.replies.push_back(vec![bytes(&format!("echo $?\r\n0\r\n{} ", PROMPT))]);
        let mut transport = ScriptedTransport::new(|_| Ok(ok_output("")));
        transport.push_shell(plan);
        let mut session = session_with(transport);

        let out = session.interact("cat notes").unwrap();
        assert_eq!(out.stdout, "section #\nmore");
    }

    #[test]
    fn test_interact_expect_completes_on_caller_pattern() {
        // The reply never returns to a prompt; the caller's pattern decides
        // completion and no status probe follows.
        let mut plan = ShellPlan {
            banner: vec![bytes(&format!("hello\n{} ", PROMPT))],
            ..Default::default()
        };
        plan.replies
            .push_back(vec![bytes("passwd\r\nChanging password.\r\nNew password: ")]);
        let mut transport = ScriptedTransport::new(|_| Ok(ok_output("")));
        transport.push_shell(plan);
        let sent = Arc::clone(&transport.sent_log);
        let mut session = session_with(transport);

        let out = session
            .interact_expect("passwd", r"New password:", Duration::from_secs(1))
            .unwrap();
        assert_eq!(out.stdout, "Changing password.");
        assert_eq!(out.status, 0);
        // Only the command itself went out, no "echo $?".
        assert_eq!(sent.lock().unwrap().as_slice(), ["passwd\n"]);
    }

    #[test]
    fn test_powershell_status_false_maps_to_failure() {
        let mut plan = ShellPlan::default();
        plan.banner = vec![bytes("Windows PowerShell\nPS C:\\Users\\admin> ")];
        plan.replies.push_back(vec![bytes("dir Z:\r\nerror\r\nPS C:\\Users\\admin> ")]);
        plan.replies.push_back(vec![bytes("echo $?\r\nFalse\r\nPS C:\\Users\\admin> ")]);
        let mut transport = ScriptedTransport::new(|_| Ok(ok_output("")));
        transport.push_shell(plan);
        let mut session = session_with(transport);
        session.use_windows_prompt();

        let out = session.interact("dir Z:").unwrap();
        assert_eq!(out.status, -1);
    }

    #[test]
    fn test_exec_reconnects_once_then_succeeds() {
        let mut attempts = 0;
        let transport = ScriptedTransport::new(move |_| {
            attempts += 1;
            if attempts == 1 {
                Err(BenchError::Connectivity {
                    host: "test-host".into(),
                    message: "reset by peer".into(),
                })
            } else {
                Ok(ok_output("done"))
            }
        });
        let reconnects = Arc::clone(&transport.reconnects);
        let mut session = session_with(transport);

        let out = session.exec("true").unwrap();
        assert_eq!(out.stdout, "done");
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interact_reopens_shell_after_connection_drop() {
        let mut transport = ScriptedTransport::new(|_| Ok(ok_output("")));
        let mut broken = ShellPlan {
            banner: vec![bytes(&format!("hi\n{} ", PROMPT))],
            ..Default::default()
        };
        broken.replies.push_back(vec![ShellRead::ConnError]);
        transport.push_shell(broken);
        transport.push_shell(one_command_plan(
            &format!("uptime\r\nup 3 days\r\n{} ", PROMPT),
            &format!("echo $?\r\n0\r\n{} ", PROMPT),
        ));
        let reconnects = Arc::clone(&transport.reconnects);
        let mut session = session_with(transport);

        let out = session.interact("uptime").unwrap();
        assert_eq!(out.stdout, "up 3 days");
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exec_gives_up_after_second_connectivity_failure() {
        let transport = ScriptedTransport::new(|_| {
            Err(BenchError::Connectivity {
                host: "test-host".into(),
                message: "reset by peer".into(),
            })
        });
        let reconnects = Arc::clone(&transport.reconnects);
        let mut session = session_with(transport);

        let err = session.exec("true").unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exec_timeout_is_not_retried() {
        let mut calls = 0;
        let transport = ScriptedTransport::new(move |_| {
            calls += 1;
            assert_eq!(calls, 1, "timeout must not trigger a retry");
            Err(BenchError::CommandTimeout {
                command: "sleep 999".into(),
                timeout_secs: 1,
            })
        });
        let mut session = session_with(transport);

        let err = session.exec("sleep 999").unwrap_err();
        assert!(matches!(err, BenchError::CommandTimeout { .. }));
    }

    #[test]
    fn test_interact_times_out_when_prompt_never_returns() {
        let plan = ShellPlan {
            banner: vec![bytes(&format!("hi\n{} ", PROMPT))],
            ..Default::default()
        };
        let mut transport = ScriptedTransport::new(|_| Ok(ok_output("")));
        transport.push_shell(plan);
        let mut session = RemoteSession::new("test-host", Box::new(transport), Duration::from_millis(1));

        let err = session.interact("hang").unwrap_err();
        assert!(matches!(err, BenchError::CommandTimeout { .. }));
    }
}
