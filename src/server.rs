use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::WatchError;

/// The behavior every platform `Server` implements. `start`, `register_paths`
/// and `unregister_paths` run on the caller thread and synchronize with the
/// run-loop thread through each backend's own wakeup primitive; `shutdown`
/// blocks the caller thread on the termination condition variable.
pub trait ServerControl: Send + Sync {
    fn start(&self) -> Result<(), WatchError>;
    fn register_paths(&self, paths: &[PathBuf]) -> Result<(), WatchError>;
    fn unregister_paths(&self, paths: &[PathBuf]) -> bool;
    fn shutdown(&self, timeout: Duration) -> Result<bool, WatchError>;
}

/// Shared termination bookkeeping: a flag plus a condition variable that
/// `shutdown` waits on and the run-loop thread signals once its WatchPoint
/// map has drained to empty and the loop is about to exit.
pub struct Termination {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl Default for Termination {
    fn default() -> Self {
        Self::new()
    }
}

impl Termination {
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Called once, from the run-loop thread, immediately before it exits.
    pub fn signal_done(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.condvar.notify_all();
    }

    /// Waits up to `timeout` for `signal_done` to have been called. Returns
    /// whether termination had completed by the time this returned.
    pub fn wait(&self, timeout: Duration) -> bool {
        let done = self.done.lock().unwrap();
        if *done {
            return true;
        }
        let (done, result) = self
            .condvar
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap();
        drop(done);
        !result.timed_out()
    }
}

/// Validates a registration target the way every platform's `register_paths`
/// must before forwarding the request to the run-loop thread: the path must
/// be absolute, and (outside macOS, see `SPEC_FULL.md` section 11) must
/// already exist as a directory.
pub fn validate_target(path: &Path, require_existing_dir: bool) -> Result<(), WatchError> {
    if !path.is_absolute() {
        return Err(WatchError::InvalidTarget {
            path: path.to_path_buf(),
            reason: "path is not absolute",
        });
    }
    if require_existing_dir {
        let metadata = std::fs::metadata(path).map_err(|_| WatchError::InvalidTarget {
            path: path.to_path_buf(),
            reason: "path does not exist",
        })?;
        if !metadata.is_dir() {
            return Err(WatchError::InvalidTarget {
                path: path.to_path_buf(),
                reason: "path is not a directory",
            });
        }
    }
    Ok(())
}

/// Invokes `sink.path_changed`, catching a panic inside the callback the way
/// the original contract catches a thrown exception, and reporting it via
/// `sink.report_error` as a `CallbackFailure`. A failure inside
/// `report_error` itself is logged and suppressed.
pub fn dispatch_change(
    sink: &dyn crate::sink::ChangeSink,
    change: crate::event::ChangeType,
    path: PathBuf,
) {
    let path_for_panic = path.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        sink.path_changed(change, path_for_panic)
    }));
    if let Err(payload) = result {
        let message = panic_message(&payload);
        tracing::error!(%message, "ChangeSink::path_changed panicked");
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            sink.report_error(WatchError::CallbackFailure(message))
        }));
        if outcome.is_err() {
            tracing::error!("ChangeSink::report_error panicked while reporting a callback failure; suppressing");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
