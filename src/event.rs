use std::path::PathBuf;

/// The closed set of normalized change kinds every platform backend maps its
/// raw OS notifications into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ChangeType {
    Created,
    Removed,
    Modified,
    /// The watched root is no longer observable; callers must re-scan.
    Invalidated,
    /// The OS reported an action this engine does not map.
    Unknown,
    /// Events were dropped by the OS; a re-scan of the watched root is required.
    Overflow,
}

/// A transient, never-stored notification dispatched synchronously to a
/// [`crate::ChangeSink`] from the run-loop thread.
pub type Event = (ChangeType, PathBuf);
