use std::path::PathBuf;

/// Errors surfaced either synchronously from the public API or asynchronously
/// through [`crate::ChangeSink::report_error`].
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to initialize watcher run-loop: {0}")]
    InitializationError(String),

    #[error("invalid watch target '{}': {reason}", .path.display())]
    InvalidTarget { path: PathBuf, reason: &'static str },

    #[error("path '{}' is already being watched", .0.display())]
    AlreadyWatching(PathBuf),

    #[error("failed to install watch on '{}': {source}", .path.display())]
    WatchFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("change sink callback failed: {0}")]
    CallbackFailure(String),

    #[error("watcher already closed")]
    AlreadyClosed,

    #[error("internal watcher error: {0}")]
    InternalError(#[from] std::io::Error),
}
