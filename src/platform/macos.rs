//! macOS backend: a single dedicated thread running a `CFRunLoop`, with one
//! `FSEventStream` covering every currently registered path (see
//! `DESIGN.md` for why paths share a stream rather than each owning its own,
//! as spec.md 4.5 might suggest in the abstract).
//!
//! Cross-thread registration requests are queued behind a mutex and the
//! run-loop thread is woken via a persistent `CFRunLoopSource`, matching the
//! "scheduled callback" wakeup primitive described in spec.md 4.2 and 9.

use std::collections::{HashMap, VecDeque};
use std::ffi::{CStr, CString};
use std::io;
use std::os::raw::c_void;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;

use crate::error::WatchError;
use crate::event::ChangeType;
use crate::server::{dispatch_change, validate_target, ServerControl, Termination};
use crate::sink::ChangeSink;
use crate::watch_point::WatchStatus;

bitflags::bitflags! {
    #[repr(C)]
    struct StreamFlags: u32 {
        const NONE = fs::kFSEventStreamEventFlagNone;
        const MUST_SCAN_SUB_DIRS = fs::kFSEventStreamEventFlagMustScanSubDirs;
        const ROOT_CHANGED = fs::kFSEventStreamEventFlagRootChanged;
        const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
        const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
        const ITEM_INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
        const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
        const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
        const ITEM_FINDER_INFO_MOD = fs::kFSEventStreamEventFlagItemFinderInfoMod;
        const ITEM_CHANGE_OWNER = fs::kFSEventStreamEventFlagItemChangeOwner;
        const ITEM_XATTR_MOD = fs::kFSEventStreamEventFlagItemXattrMod;
    }
}

/// Maps a batch's flags to normalized events in the fixed order
/// (CREATED, MODIFIED, REMOVED) required by spec.md 4.2, first match wins
/// for ROOT_CHANGED/MUST_SCAN_SUB_DIRS.
fn translate_flags(flags: StreamFlags) -> Vec<ChangeType> {
    if flags.contains(StreamFlags::ROOT_CHANGED) {
        return vec![ChangeType::Invalidated];
    }
    if flags.contains(StreamFlags::MUST_SCAN_SUB_DIRS) {
        return vec![ChangeType::Overflow];
    }

    let mut out = Vec::with_capacity(3);
    if flags.intersects(StreamFlags::ITEM_CREATED | StreamFlags::ITEM_RENAMED) {
        out.push(ChangeType::Created);
    }
    if flags.intersects(
        StreamFlags::ITEM_MODIFIED
            | StreamFlags::ITEM_INODE_META_MOD
            | StreamFlags::ITEM_FINDER_INFO_MOD
            | StreamFlags::ITEM_CHANGE_OWNER
            | StreamFlags::ITEM_XATTR_MOD,
    ) {
        out.push(ChangeType::Modified);
    }
    if flags.contains(StreamFlags::ITEM_REMOVED) {
        out.push(ChangeType::Removed);
    }
    if out.is_empty() {
        out.push(ChangeType::Unknown);
    }
    out
}

enum Request {
    Register {
        path: PathBuf,
        reply: Sender<Result<(), WatchError>>,
    },
    Unregister {
        paths: Vec<PathBuf>,
        reply: Sender<bool>,
    },
    /// Enqueued by the FSEvents callback itself (never by a caller) when a
    /// `ROOT_CHANGED` flag is observed, so the root is dropped and the
    /// stream rebuilt without it on the next run-loop pass rather than from
    /// inside the stream's own callback.
    Invalidate { path: PathBuf },
    Shutdown,
}

struct RunState {
    watch_statuses: HashMap<PathBuf, WatchStatus>,
    stream: Option<fs::FSEventStreamRef>,
    current_runloop: Option<cf::CFRunLoopRef>,
}

// SAFETY: the raw CF handles inside `RunState` are only ever dereferenced on
// the run-loop thread that created them; the Mutex wrapping this struct only
// ever hands out the lock to that same thread in practice (the caller thread
// touches the map only through the request queue).
unsafe impl Send for RunState {}

struct Shared {
    sink: Arc<dyn ChangeSink>,
    latency_secs: f64,
    request_queue: Mutex<VecDeque<Request>>,
    run_state: Mutex<RunState>,
    wakeup_source: Mutex<Option<cf::CFRunLoopSourceRef>>,
    termination: Termination,
}

// SAFETY: `wakeup_source` is a CF object; CoreFoundation objects are safe to
// pass between threads per Apple's thread-safety documentation, and are only
// ever signalled (never dereferenced) from the caller thread.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

pub struct MacServer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl MacServer {
    pub fn new(sink: Arc<dyn ChangeSink>, latency: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink,
                latency_secs: latency.as_secs_f64(),
                request_queue: Mutex::new(VecDeque::new()),
                run_state: Mutex::new(RunState {
                    watch_statuses: HashMap::new(),
                    stream: None,
                    current_runloop: None,
                }),
                wakeup_source: Mutex::new(None),
                termination: Termination::new(),
            }),
            thread: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    fn send(&self, request: Request) {
        enqueue(&self.shared, request);
    }
}

/// Pushes `request` onto the shared queue and signals the run-loop thread's
/// wakeup source, the same way whether the sender is the caller thread (via
/// `MacServer::send`) or the run-loop thread itself reacting to an FSEvents
/// callback (via `Request::Invalidate`).
fn enqueue(shared: &Shared, request: Request) {
    shared.request_queue.lock().unwrap().push_back(request);
    let source = *shared.wakeup_source.lock().unwrap();
    let runloop = shared.run_state.lock().unwrap().current_runloop;
    if let (Some(source), Some(runloop)) = (source, runloop) {
        unsafe {
            cf::CFRunLoopSourceSignal(source);
            cf::CFRunLoopWakeUp(runloop);
        }
    }
}

impl ServerControl for MacServer {
    fn start(&self) -> Result<(), WatchError> {
        use std::sync::atomic::Ordering;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("sd-fs-watcher-macos".into())
            .spawn(move || run_loop(shared, ready_tx))
            .map_err(|e| WatchError::InitializationError(e.to_string()))?;
        *self.thread.lock().unwrap() = Some(handle);
        ready_rx
            .recv()
            .map_err(|_| WatchError::InitializationError("run-loop thread exited before signaling readiness".into()))?;
        tracing::info!("MacServer run-loop started");
        Ok(())
    }

    fn register_paths(&self, paths: &[PathBuf]) -> Result<(), WatchError> {
        for path in paths {
            // macOS watches non-existent or non-directory paths silently;
            // see SPEC_FULL.md section 11, open question 2.
            validate_target(path, false)?;
            let (reply_tx, reply_rx) = mpsc::channel();
            self.send(Request::Register {
                path: path.clone(),
                reply: reply_tx,
            });
            reply_rx
                .recv()
                .map_err(|_| WatchError::InternalError(io::Error::other("run-loop gone")))??;
        }
        Ok(())
    }

    fn unregister_paths(&self, paths: &[PathBuf]) -> bool {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Request::Unregister {
            paths: paths.to_vec(),
            reply: reply_tx,
        });
        reply_rx.recv().unwrap_or(false)
    }

    fn shutdown(&self, timeout: Duration) -> Result<bool, WatchError> {
        if self.thread.lock().unwrap().is_none() {
            return Ok(true);
        }
        self.send(Request::Shutdown);
        let drained = self.shared.termination.wait(timeout);
        if drained {
            if let Some(handle) = self.thread.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
        Ok(drained)
    }
}

fn run_loop(shared: Arc<Shared>, ready_tx: Sender<()>) {
    unsafe {
        let cur = cf::CFRunLoopGetCurrent();

        let mut context = cf::CFRunLoopSourceContext {
            version: 0,
            info: Arc::as_ptr(&shared) as *mut c_void,
            retain: None,
            release: None,
            copy_description: None,
            equal: None,
            hash: None,
            schedule: None,
            cancel: None,
            perform: wakeup_perform,
        };
        let source = cf::CFRunLoopSourceCreate(cf::kCFAllocatorDefault, 0, &mut context);
        cf::CFRunLoopAddSource(cur, source, cf::kCFRunLoopDefaultMode);

        shared.run_state.lock().unwrap().current_runloop = Some(cur);
        *shared.wakeup_source.lock().unwrap() = Some(source);

        let _ = ready_tx.send(());

        cf::CFRunLoopRun();

        if let Some(stream) = shared.run_state.lock().unwrap().stream.take() {
            fs::FSEventStreamStop(stream);
            fs::FSEventStreamInvalidate(stream);
            fs::FSEventStreamRelease(stream);
        }
        cf::CFRelease(source as cf::CFRef);
    }
    shared.termination.signal_done();
    tracing::info!("MacServer run-loop exited");
}

extern "C" fn wakeup_perform(info: *mut c_void) {
    let shared = unsafe { &*(info as *const Shared) };
    loop {
        let request = shared.request_queue.lock().unwrap().pop_front();
        let Some(request) = request else { break };
        handle_request(shared, request);
    }
}

fn handle_request(shared: &Shared, request: Request) {
    match request {
        Request::Register { path, reply } => {
            let result = register_one(shared, &path);
            let _ = reply.send(result);
        }
        Request::Unregister { paths, reply } => {
            let mut all_known = true;
            {
                let mut rs = shared.run_state.lock().unwrap();
                for path in &paths {
                    if rs.watch_statuses.remove(path).is_none() {
                        all_known = false;
                    }
                }
            }
            if let Err(err) = rebuild_stream(shared) {
                tracing::warn!(%err, "failed to rebuild FSEventStream after unregister");
            }
            let _ = reply.send(all_known);
        }
        Request::Invalidate { path } => {
            let removed = shared
                .run_state
                .lock()
                .unwrap()
                .watch_statuses
                .remove(&path)
                .is_some();
            if removed {
                tracing::info!(path = %path.display(), "root invalidated; dropping watch");
                if let Err(err) = rebuild_stream(shared) {
                    tracing::warn!(%err, path = %path.display(), "failed to rebuild FSEventStream after root invalidation");
                }
            }
        }
        Request::Shutdown => {
            let runloop = {
                let mut rs = shared.run_state.lock().unwrap();
                rs.watch_statuses.clear();
                if let Some(stream) = rs.stream.take() {
                    unsafe {
                        fs::FSEventStreamStop(stream);
                        fs::FSEventStreamInvalidate(stream);
                        fs::FSEventStreamRelease(stream);
                    }
                }
                rs.current_runloop
            };
            if let Some(runloop) = runloop {
                unsafe { cf::CFRunLoopStop(runloop) };
            }
        }
    }
}

fn register_one(shared: &Shared, path: &PathBuf) -> Result<(), WatchError> {
    {
        let mut rs = shared.run_state.lock().unwrap();
        if rs.watch_statuses.contains_key(path) {
            return Err(WatchError::AlreadyWatching(path.clone()));
        }
        rs.watch_statuses.insert(path.clone(), WatchStatus::Uninitialized);
    }
    match rebuild_stream(shared) {
        Ok(()) => {
            shared
                .run_state
                .lock()
                .unwrap()
                .watch_statuses
                .insert(path.clone(), WatchStatus::Listening);
            tracing::info!(path = %path.display(), "registered watch");
            Ok(())
        }
        Err(err) => {
            let mut rs = shared.run_state.lock().unwrap();
            rs.watch_statuses.insert(path.clone(), WatchStatus::FailedToListen);
            tracing::warn!(path = %path.display(), %err, "failed to install FSEventStream");
            Err(err)
        }
    }
}

struct StreamContext {
    shared: *const Shared,
}

// SAFETY: `shared` points at the `Shared` kept alive by `run_loop`'s local
// `Arc<Shared>` for the thread's entire lifetime, which outlives every
// stream built from it (streams are always stopped/invalidated/released
// before that `Arc` is dropped); only ever dereferenced on that same thread.
unsafe impl Send for StreamContext {}

extern "C" fn release_stream_context(info: *const c_void) {
    unsafe {
        drop(Box::from_raw(info as *mut StreamContext));
    }
}

/// Stops and releases the current stream (if any) and, if there is at least
/// one registered path, creates and starts a fresh one covering the full
/// current path set. `FSEventStreamCreate` has no "add path to a live
/// stream" operation, so every structural change rebuilds the stream; this
/// always runs on the run-loop thread, inside `wakeup_perform`.
fn rebuild_stream(shared: &Shared) -> Result<(), WatchError> {
    let mut rs = shared.run_state.lock().unwrap();

    if let Some(old) = rs.stream.take() {
        unsafe {
            fs::FSEventStreamStop(old);
            fs::FSEventStreamInvalidate(old);
            fs::FSEventStreamRelease(old);
        }
    }

    if rs.watch_statuses.is_empty() {
        return Ok(());
    }

    let runloop = rs
        .current_runloop
        .ok_or_else(|| WatchError::InternalError(io::Error::other("run-loop not ready")))?;

    let context_info = Box::into_raw(Box::new(StreamContext {
        shared: shared as *const Shared,
    }));

    unsafe {
        let cf_paths = cf::CFArrayCreateMutable(cf::kCFAllocatorDefault, 0, &cf::kCFTypeArrayCallBacks);
        for path in rs.watch_statuses.keys() {
            let c_path = match CString::new(path.to_string_lossy().as_bytes()) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let cf_str = cf::CFStringCreateWithCString(
                cf::kCFAllocatorDefault,
                c_path.as_ptr(),
                cf::kCFStringEncodingUTF8,
            );
            cf::CFArrayAppendValue(cf_paths, cf_str as *const c_void);
            cf::CFRelease(cf_str as cf::CFRef);
        }

        let stream_context = fs::FSEventStreamContext {
            version: 0,
            info: context_info as *mut c_void,
            retain: None,
            release: Some(release_stream_context),
            copy_description: None,
        };

        let flags = fs::kFSEventStreamCreateFlagFileEvents | fs::kFSEventStreamCreateFlagNoDefer;
        let stream = fs::FSEventStreamCreate(
            cf::kCFAllocatorDefault,
            event_callback,
            &stream_context,
            cf_paths,
            fs::kFSEventStreamEventIdSinceNow,
            shared.latency_secs,
            flags,
        );
        cf::CFRelease(cf_paths as cf::CFRef);

        if stream.is_null() {
            return Err(WatchError::InitializationError(
                "FSEventStreamCreate returned a null stream".into(),
            ));
        }

        fs::FSEventStreamScheduleWithRunLoop(stream, runloop, cf::kCFRunLoopDefaultMode);
        if fs::FSEventStreamStart(stream) == 0 {
            fs::FSEventStreamInvalidate(stream);
            fs::FSEventStreamRelease(stream);
            return Err(WatchError::InitializationError(
                "FSEventStreamStart failed".into(),
            ));
        }

        rs.stream = Some(stream);
    }

    Ok(())
}

extern "C" fn event_callback(
    _stream_ref: fs::FSEventStreamRef,
    info: *mut c_void,
    num_events: libc::size_t,
    event_paths: *mut c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    _event_ids: *const fs::FSEventStreamEventId,
) {
    // SAFETY: must not unwind across this extern "C" boundary.
    let outcome = std::panic::catch_unwind(|| unsafe {
        let ctx = &*(info as *const StreamContext);
        let shared = &*ctx.shared;
        let paths = event_paths as *const *const libc::c_char;
        let mut invalidated_roots = Vec::new();
        for i in 0..num_events {
            let c_path = *paths.add(i);
            if c_path.is_null() {
                continue;
            }
            let path = PathBuf::from(CStr::from_ptr(c_path).to_string_lossy().into_owned());
            let flags = StreamFlags::from_bits_truncate(*event_flags.add(i));
            let changes = translate_flags(flags);
            let invalidated = changes.contains(&ChangeType::Invalidated);
            for change in changes {
                dispatch_change(shared.sink.as_ref(), change, path.clone());
            }
            if invalidated {
                invalidated_roots.push(path);
            }
        }
        // ROOT_CHANGED "also stops further events for that root" (spec.md
        // 4.2): drop the root and rebuild the stream without it. Deferred
        // through the request queue rather than called directly, since
        // rebuilding tears down this very stream and must not happen
        // reentrantly from inside its own callback.
        for root in invalidated_roots {
            enqueue(shared, Request::Invalidate { path: root });
        }
    });
    if outcome.is_err() {
        tracing::error!("panic inside FSEvents callback; suppressing to protect the C boundary");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        events: StdMutex<Vec<(ChangeType, PathBuf)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: StdMutex::new(Vec::new()),
            })
        }

        fn snapshot(&self) -> Vec<(ChangeType, PathBuf)> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ChangeSink for RecordingSink {
        fn path_changed(&self, change: ChangeType, path: PathBuf) {
            self.events.lock().unwrap().push((change, path));
        }

        fn report_error(&self, _error: WatchError) {}
    }

    fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        condition()
    }

    #[test]
    fn create_file_yields_created_event() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new();
        let server = MacServer::new(sink.clone(), Duration::ZERO);
        server.start().unwrap();
        server
            .register_paths(&[dir.path().to_path_buf()])
            .unwrap();

        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        assert!(wait_for(
            || sink
                .snapshot()
                .iter()
                .any(|(c, p)| *c == ChangeType::Created && p == &file),
            Duration::from_secs(2)
        ));
        assert!(server.shutdown(Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn watching_nonexistent_path_succeeds_silently() {
        let sink = RecordingSink::new();
        let server = MacServer::new(sink, Duration::ZERO);
        server.start().unwrap();
        let missing = PathBuf::from("/tmp/sd-fs-watcher-does-not-exist-12345");
        assert!(server.register_paths(&[missing]).is_ok());
        assert!(server.shutdown(Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn duplicate_registration_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new();
        let server = MacServer::new(sink, Duration::ZERO);
        server.start().unwrap();
        server
            .register_paths(&[dir.path().to_path_buf()])
            .unwrap();
        let err = server
            .register_paths(&[dir.path().to_path_buf()])
            .unwrap_err();
        assert!(matches!(err, WatchError::AlreadyWatching(_)));
        assert!(server.shutdown(Duration::from_secs(2)).unwrap());
    }
}
