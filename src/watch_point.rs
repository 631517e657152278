/// Lifecycle of a single-directory OS subscription, shared across all three
/// platform backends even though the handle each `WatchPoint` owns differs
/// per platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    Uninitialized,
    Listening,
    NotListening,
    FailedToListen,
    Finished,
}
