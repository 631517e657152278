use std::path::PathBuf;

use crate::event::ChangeType;
use crate::error::WatchError;

/// Receives structured change notifications and error reports from the
/// engine and forwards them to the embedding runtime.
///
/// Invoked from the run-loop thread, never from the thread that registered
/// the watch. Implementations must not block beyond the work needed to
/// hand the event off (e.g. to a channel); the run-loop stalls for the
/// duration of this call.
pub trait ChangeSink: Send + Sync {
    fn path_changed(&self, change: ChangeType, path: PathBuf);
    fn report_error(&self, error: WatchError);
}
