//! Platform-agnostic filesystem watcher that emits normalized change events.
//!
//! [`Watcher`] wraps one of three OS-specific backends (FSEvents on macOS,
//! inotify on Linux, `ReadDirectoryChangesW` on Windows) behind a single
//! contract: register absolute directory paths, receive [`ChangeType`]
//! events through a caller-supplied [`ChangeSink`], and shut down
//! cooperatively. See `SPEC_FULL.md` for the full contract this crate
//! implements.

mod error;
mod event;
mod platform;
mod server;
mod sink;
mod watch_point;

pub use error::WatchError;
pub use event::{ChangeType, Event};
pub use sink::ChangeSink;
pub use watch_point::WatchStatus;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use server::ServerControl;

/// Entry point: builds a [`Watcher`] bound to `sink`, using `latency` as the
/// coalescing window on backends that support one (currently only FSEvents;
/// other platforms ignore it).
pub fn create_watcher(sink: Arc<dyn ChangeSink>, latency: Duration) -> Watcher {
    Watcher::new(sink, latency)
}

/// A single watcher instance. Construction does not start the underlying
/// run-loop thread; call [`Watcher::start_watching`] first.
///
/// Every method after [`Watcher::close`] has been called returns
/// [`WatchError::AlreadyClosed`].
pub struct Watcher {
    server: Box<dyn ServerControl>,
    closed: AtomicBool,
}

impl Watcher {
    fn new(sink: Arc<dyn ChangeSink>, latency: Duration) -> Self {
        Self {
            server: Box::new(platform::RecommendedServer::new(sink, latency)),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), WatchError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(WatchError::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    /// Starts the run-loop thread on first use (idempotent) and registers
    /// `paths` for notifications. Fails with [`WatchError::AlreadyWatching`]
    /// if any path is already registered, leaving earlier paths in this call
    /// registered.
    pub fn start_watching(&self, paths: &[PathBuf]) -> Result<(), WatchError> {
        self.check_open()?;
        self.server.start()?;
        self.server.register_paths(paths)
    }

    /// Unregisters previously registered paths. Returns `false` if any path
    /// was not registered, or if the watcher is already closed; all known
    /// paths are still removed in the former case.
    pub fn stop_watching(&self, paths: &[PathBuf]) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.server.unregister_paths(paths)
    }

    /// Stops the run-loop thread and releases all OS resources, waiting up
    /// to `timeout` for the shutdown to complete. Returns whether the
    /// shutdown completed within the deadline. Subsequent calls return
    /// [`WatchError::AlreadyClosed`].
    pub fn close(&self, timeout: Duration) -> Result<bool, WatchError> {
        self.check_open()?;
        let result = self.server.shutdown(timeout);
        self.closed.store(true, Ordering::SeqCst);
        result
    }
}
