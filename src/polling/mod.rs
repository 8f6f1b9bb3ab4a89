//! Bounded polling for asynchronous remote conditions.
//!
//! Every long wait in the engine (stage transitions, job completion, process
//! exit) is a polling loop over evolving remote state, since the only
//! observable signal is remote log text. This module provides the single
//! primitive those waits are built on.

use crate::error::Result;
use log::{debug, warn};
use std::fmt::Debug;
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of a bounded polling wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The operation produced an expected value.
    Success,
    /// The operation produced a fail-fast value.
    FailFast,
    /// The deadline elapsed without either.
    Timeout,
}

/// Polling parameters.
#[derive(Debug, Clone)]
pub struct Poller {
    /// Total wait budget. May span days for measurement-phase waits.
    pub timeout: Duration,
    /// Sleep between invocations.
    pub interval: Duration,
    /// When true, operation errors are logged and polling continues.
    /// When false (default), errors propagate immediately.
    pub ignore_errors: bool,
    /// Label used in wait logs.
    pub label: String,
}

impl Poller {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            ignore_errors: false,
            label: String::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn ignoring_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    /// Repeatedly invokes `op` until it yields a value in `expect` (Success),
    /// a value in `fail_fast` (FailFast), or the timeout elapses (Timeout).
    ///
    /// The first invocation always happens, even if the timeout is already
    /// effectively exhausted; a wait that starts late can still observe an
    /// already-satisfied condition. Once a fail-fast value is seen the
    /// operation is never invoked again.
    pub fn wait_until<T, F>(&self, mut op: F, expect: &[T], fail_fast: &[T]) -> Result<PollOutcome>
    where
        T: PartialEq + Debug,
        F: FnMut() -> Result<T>,
    {
        let start = Instant::now();
        let mut last: Option<T> = None;
        loop {
            match op() {
                Ok(value) => {
                    if expect.contains(&value) {
                        debug!("[{}] Success: {:?}", self.label, value);
                        return Ok(PollOutcome::Success);
                    }
                    if fail_fast.contains(&value) {
                        debug!("[{}] Fail fast! result: {:?}", self.label, value);
                        return Ok(PollOutcome::FailFast);
                    }
                    last = Some(value);
                }
                Err(e) if self.ignore_errors => {
                    debug!("[{}] Error during poll: {}", self.label, e);
                }
                Err(e) => return Err(e),
            }

            if start.elapsed() >= self.timeout {
                warn!("[{}] Timeout! Last result: {:?}", self.label, last);
                return Ok(PollOutcome::Timeout);
            }
            thread::sleep(self.interval);
        }
    }
}
