//! Local control-file watcher.
//!
//! Operators steer a long run by writing `stop`, `pause` or `restart` into
//! a local file. A background thread polls the file every two seconds,
//! folds what it reads into shared flags, and truncates the file so each
//! request is consumed exactly once. The controller consults the flags
//! from inside its polling loops.

use log::{debug, info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Shared control flags. A stop request is permanent for the run; pause is
/// lifted by a restart request.
#[derive(Debug, Default)]
pub struct ControlState {
    stop: AtomicBool,
    pause: AtomicBool,
}

impl ControlState {
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Blocks while paused. Returns early if a stop is requested so a
    /// paused run can still be shut down.
    pub fn wait_if_paused(&self) {
        while self.paused() && !self.stop_requested() {
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn apply(&self, request: &str) {
        if request.contains("stop") {
            info!("Control file: stop requested");
            self.stop.store(true, Ordering::SeqCst);
        } else if request.contains("pause") {
            info!("Control file: pause requested");
            self.pause.store(true, Ordering::SeqCst);
        } else if request.contains("restart") {
            info!("Control file: restart requested");
            self.pause.store(false, Ordering::SeqCst);
        } else {
            warn!("Control file: ignoring unknown request {:?}", request.trim());
        }
    }
}

/// Owns the watcher thread. Dropping it (or calling [`shutdown`]) ends the
/// thread; the control file itself is left in place.
///
/// [`shutdown`]: ControlWatcher::shutdown
pub struct ControlWatcher {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ControlWatcher {
    pub fn spawn(path: PathBuf, state: Arc<ControlState>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        debug!("Watching control file {}", path.display());
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                if let Ok(content) = fs::read_to_string(&path) {
                    let request = content.trim().to_lowercase();
                    if !request.is_empty() {
                        state.apply(&request);
                        if let Err(e) = fs::write(&path, "") {
                            warn!("Failed to truncate control file: {}", e);
                        }
                    }
                }
                thread::sleep(POLL_INTERVAL);
            }
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ControlWatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
