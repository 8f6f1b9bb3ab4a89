//! SSH transport for remote sessions.
//!
//! `Transport` is the seam between the session protocol (prompt discovery,
//! echo stripping, reconnect-once) and the wire. The production backend is
//! `SshTransport` over libssh2; tests drive the same protocol against a
//! scripted transport.

use crate::config::HostConfig;
use crate::error::{BenchError, Result};
use log::{debug, info, warn};
use ssh2::Session;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// Sleep between receive-buffer polls. Bounds worst-case completion
/// overshoot to one interval.
pub const READ_POLL: Duration = Duration::from_millis(500);

/// Output of a one-shot command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

/// Low-level per-host transport.
///
/// Implementations surface socket-level failures as
/// [`BenchError::Connectivity`] and completion-deadline expiry as
/// [`BenchError::CommandTimeout`]; the session layer relies on that
/// distinction to decide what may be retried.
pub trait Transport: Send {
    /// Runs one command on a dedicated channel, waiting (bounded by
    /// `timeout`) for the remote command-finished signal.
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput>;

    /// Opens a persistent interactive shell channel.
    fn open_shell(&mut self) -> Result<Box<dyn ShellChannel>>;

    /// Tears down and re-establishes the underlying connection.
    fn reconnect(&mut self) -> Result<()>;

    /// Fetches a remote file's contents.
    fn download(&mut self, remote: &str) -> Result<Vec<u8>>;

    /// Writes a remote file, replacing any existing contents.
    fn upload(&mut self, remote: &str, data: &[u8]) -> Result<()>;
}

/// One interactive shell channel.
pub trait ShellChannel: Send {
    /// Sends raw input to the shell.
    fn send(&mut self, data: &str) -> Result<()>;

    /// Returns pending output, or `None` when nothing has arrived yet.
    fn read_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// libssh2-backed transport.
pub struct SshTransport {
    config: HostConfig,
    session: Option<Session>,
}

impl SshTransport {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Connects and authenticates immediately.
    pub fn connect(config: HostConfig) -> Result<Self> {
        let mut transport = Self::new(config);
        transport.session()?;
        Ok(transport)
    }

    fn conn_err(&self, message: impl std::fmt::Display) -> BenchError {
        BenchError::Connectivity {
            host: self.config.address.clone(),
            message: message.to_string(),
        }
    }

    fn session(&mut self) -> Result<Session> {
        if self.session.is_none() {
            self.session = Some(self.establish()?);
        }
        Ok(self.session.as_ref().unwrap().clone())
    }

    fn establish(&self) -> Result<Session> {
        use std::net::ToSocketAddrs;

        info!("Connecting to {}", self.config.connection_string());
        let addr_str = format!("{}:{}", self.config.address, self.config.port);
        let addr = addr_str
            .to_socket_addrs()
            .map_err(|e| self.conn_err(format!("Failed to resolve host: {}", e)))?
            .next()
            .ok_or_else(|| self.conn_err("No addresses found for host"))?;

        let timeout = Duration::from_secs(self.config.timeout);
        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| self.conn_err(format!("TCP connect failed: {}", e)))?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        let mut sess = Session::new()
            .map_err(|e| self.conn_err(format!("Failed to create SSH session: {}", e)))?;
        sess.set_tcp_stream(tcp);
        sess.handshake()
            .map_err(|e| self.conn_err(format!("SSH handshake failed: {}", e)))?;
        self.authenticate(&sess)?;
        sess.set_keepalive(true, 30);

        debug!("Connected to {}", self.config.address);
        Ok(sess)
    }

    fn authenticate(&self, sess: &Session) -> Result<()> {
        let user = &self.config.user;

        if let Some(password) = &self.config.password {
            match sess.userauth_password(user, password) {
                Ok(()) => return Ok(()),
                Err(e) => warn!("Password authentication failed for {}: {}", user, e),
            }
        }
        if let Some(key_path) = &self.config.ssh_key {
            let expanded = expand_path(key_path);
            match sess.userauth_pubkey_file(user, None, &expanded, None) {
                Ok(()) => return Ok(()),
                Err(e) => warn!("Public key authentication failed: {}", e),
            }
        }
        match sess.userauth_agent(user) {
            Ok(()) => return Ok(()),
            Err(e) => warn!("Agent authentication failed: {}", e),
        }

        Err(self.conn_err(format!("SSH authentication failed for user {}", user)))
    }

    /// Reads everything currently available from `reader` into `buf`.
    /// Returns true when any bytes were read, false when the stream would
    /// block.
    fn drain_available<R: Read>(&self, reader: &mut R, buf: &mut Vec<u8>) -> Result<bool> {
        let mut chunk = [0u8; 32768];
        let mut progressed = false;
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok(progressed),
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(progressed),
                Err(e) => return Err(self.conn_err(format!("read failed: {}", e))),
            }
        }
    }
}

impl Transport for SshTransport {
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let sess = self.session()?;
        let mut channel = sess
            .channel_session()
            .map_err(|e| self.conn_err(format!("Failed to open channel: {}", e)))?;
        channel
            .exec(command)
            .map_err(|e| self.conn_err(format!("Failed to send command: {}", e)))?;

        // Wait specifically for the remote command-finished signal (channel
        // EOF), bounded by the deadline. A per-read idle timer would reset on
        // every output burst and let a slow command overstay its budget.
        let deadline = Instant::now() + timeout;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        sess.set_blocking(false);
        let finished = loop {
            let drained = match (
                self.drain_available(&mut channel, &mut stdout),
                self.drain_available(&mut channel.stderr(), &mut stderr),
            ) {
                (Ok(a), Ok(b)) => a || b,
                (Err(e), _) | (_, Err(e)) => {
                    sess.set_blocking(true);
                    return Err(e);
                }
            };
            if channel.eof() {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            if !drained {
                thread::sleep(READ_POLL);
            }
        };
        sess.set_blocking(true);

        if !finished {
            debug!("{} << command timeout: {}", self.config.address, command);
            return Err(BenchError::CommandTimeout {
                command: command.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }

        channel
            .wait_close()
            .map_err(|e| self.conn_err(format!("Failed to close channel: {}", e)))?;
        let status = channel
            .exit_status()
            .map_err(|e| self.conn_err(format!("Failed to get exit status: {}", e)))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            status,
        })
    }

    fn open_shell(&mut self) -> Result<Box<dyn ShellChannel>> {
        let sess = self.session()?;
        let mut channel = sess
            .channel_session()
            .map_err(|e| self.conn_err(format!("Failed to open shell channel: {}", e)))?;
        channel
            .request_pty("xterm", None, Some((200, 200, 0, 0)))
            .map_err(|e| self.conn_err(format!("Failed to request pty: {}", e)))?;
        channel
            .shell()
            .map_err(|e| self.conn_err(format!("Failed to start shell: {}", e)))?;
        Ok(Box::new(SshShellChannel {
            host: self.config.address.clone(),
            session: sess,
            channel,
        }))
    }

    fn reconnect(&mut self) -> Result<()> {
        debug!("Connection not active, re-connecting to {}", self.config.address);
        self.session = None;
        self.session()?;
        Ok(())
    }

    fn download(&mut self, remote: &str) -> Result<Vec<u8>> {
        let sess = self.session()?;
        let (mut channel, stat) = sess
            .scp_recv(Path::new(remote))
            .map_err(|e| self.conn_err(format!("scp recv {} failed: {}", remote, e)))?;
        let mut data = Vec::with_capacity(stat.size() as usize);
        channel
            .read_to_end(&mut data)
            .map_err(|e| self.conn_err(format!("scp read {} failed: {}", remote, e)))?;
        channel.send_eof().ok();
        channel.wait_close().ok();
        Ok(data)
    }

    fn upload(&mut self, remote: &str, data: &[u8]) -> Result<()> {
        let sess = self.session()?;
        let mut channel = sess
            .scp_send(Path::new(remote), 0o644, data.len() as u64, None)
            .map_err(|e| self.conn_err(format!("scp send {} failed: {}", remote, e)))?;
        channel
            .write_all(data)
            .map_err(|e| self.conn_err(format!("scp write {} failed: {}", remote, e)))?;
        channel.send_eof().ok();
        channel.wait_close().ok();
        Ok(())
    }
}

struct SshShellChannel {
    host: String,
    session: Session,
    channel: ssh2::Channel,
}

impl ShellChannel for SshShellChannel {
    fn send(&mut self, data: &str) -> Result<()> {
        self.channel
            .write_all(data.as_bytes())
            .map_err(|e| BenchError::Connectivity {
                host: self.host.clone(),
                message: format!("shell write failed: {}", e),
            })
    }

    fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; 32768];
        self.session.set_blocking(false);
        let result = self.channel.read(&mut buf);
        self.session.set_blocking(true);
        match result {
            Ok(0) => Err(BenchError::Connectivity {
                host: self.host.clone(),
                message: "shell channel closed".into(),
            }),
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(BenchError::Connectivity {
                host: self.host.clone(),
                message: format!("shell read failed: {}", e),
            }),
        }
    }
}

fn expand_path(path: &str) -> std::path::PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    Path::new(path).to_path_buf()
}
