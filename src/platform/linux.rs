//! Linux backend: a single inotify instance multiplexed with a self-pipe
//! wakeup via `libc::poll`, as described in `SPEC_FULL.md` section 4.3.
//!
//! Linux watches a single directory level only; subdirectory events are not
//! delivered. This is a documented platform asymmetry, not a bug (spec.md
//! scenario 6).

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};

use crate::error::WatchError;
use crate::event::ChangeType;
use crate::server::{dispatch_change, validate_target, ServerControl, Termination};
use crate::sink::ChangeSink;

fn watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::MODIFY
        | WatchMask::ATTRIB
        | WatchMask::CLOSE_WRITE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MOVE_SELF
        | WatchMask::ONLYDIR
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
    Shutdown,
}

struct SelfPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SelfPipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    fn wake(&self) {
        let byte = [1u8];
        unsafe {
            libc::write(self.write_fd, byte.as_ptr() as *const _, 1);
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// `SAFETY`: raw fds are only read/written by the `SelfPipe` methods above.
unsafe impl Send for SelfPipe {}
unsafe impl Sync for SelfPipe {}

pub struct LinuxServer {
    sink: Arc<dyn ChangeSink>,
    request_tx: Sender<Request>,
    request_rx: Mutex<Option<Receiver<Request>>>,
    // Created in `start()`, not `new()`: `pipe2` failure is an OS-resource
    // condition that must surface as `InitializationError`, not a panic in
    // the non-`Result` constructor reachable from `create_watcher`.
    wakeup: Mutex<Option<Arc<SelfPipe>>>,
    terminate: Arc<AtomicBool>,
    termination: Arc<Termination>,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl LinuxServer {
    pub fn new(sink: Arc<dyn ChangeSink>, _latency: Duration) -> Self {
        let (request_tx, request_rx) = mpsc::channel();
        Self {
            sink,
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
            wakeup: Mutex::new(None),
            terminate: Arc::new(AtomicBool::new(false)),
            termination: Arc::new(Termination::new()),
            thread: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    fn send(&self, request: Request) {
        // The run-loop thread only exits after draining the request queue,
        // so a send racing shutdown is always observed before the thread dies.
        // `wakeup` is only `None` before `start()` has run; every caller of
        // `send` is reachable only after `start()` has succeeded.
        let _ = self.request_tx.send(request);
        if let Some(wakeup) = self.wakeup.lock().unwrap().as_ref() {
            wakeup.wake();
        }
    }
}

impl ServerControl for LinuxServer {
    fn start(&self) -> Result<(), WatchError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inotify = Inotify::init().map_err(|e| WatchError::InitializationError(e.to_string()))?;
        let wakeup = Arc::new(
            SelfPipe::new().map_err(|e| WatchError::InitializationError(e.to_string()))?,
        );
        *self.wakeup.lock().unwrap() = Some(Arc::clone(&wakeup));
        let request_rx = self
            .request_rx
            .lock()
            .unwrap()
            .take()
            .expect("start called more than once");
        let sink = Arc::clone(&self.sink);
        let terminate = Arc::clone(&self.terminate);
        let termination = Arc::clone(&self.termination);

        let handle = std::thread::Builder::new()
            .name("sd-fs-watcher-linux".into())
            .spawn(move || run_loop(inotify, request_rx, wakeup, terminate, termination, sink))
            .map_err(|e| WatchError::InitializationError(e.to_string()))?;

        *self.thread.lock().unwrap() = Some(handle);
        tracing::info!("LinuxServer run-loop started");
        Ok(())
    }

    fn register_paths(&self, paths: &[PathBuf]) -> Result<(), WatchError> {
        for path in paths {
            validate_target(path, true)?;
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
        self.terminate.store(true, Ordering::SeqCst);
        self.send(Request::Shutdown);
        let drained = self.termination.wait(timeout);
        if drained {
            if let Some(handle) = self.thread.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
        Ok(drained)
    }
}

struct WatchPointState {
    watches: HashMap<PathBuf, WatchDescriptor>,
    paths: HashMap<WatchDescriptor, PathBuf>,
}

impl WatchPointState {
    fn new() -> Self {
        Self {
            watches: HashMap::new(),
            paths: HashMap::new(),
        }
    }

    fn insert(&mut self, path: PathBuf, wd: WatchDescriptor) {
        self.watches.insert(path.clone(), wd.clone());
        self.paths.insert(wd, path);
    }

    fn remove_by_wd(&mut self, wd: &WatchDescriptor) -> Option<PathBuf> {
        if let Some(path) = self.paths.remove(wd) {
            self.watches.remove(&path);
            Some(path)
        } else {
            None
        }
    }

    fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    mut inotify: Inotify,
    request_rx: Receiver<Request>,
    wakeup: Arc<SelfPipe>,
    terminate: Arc<AtomicBool>,
    termination: Arc<Termination>,
    sink: Arc<dyn ChangeSink>,
) {
    let mut state = WatchPointState::new();
    let mut buffer = [0u8; 4096];
    let inotify_fd = inotify.as_raw_fd();

    'outer: loop {
        let mut fds = [
            libc::pollfd {
                fd: inotify_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: wakeup.read_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        let poll_result = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if poll_result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(%err, "poll() failed in LinuxServer run-loop");
            break;
        }

        if fds[1].revents & libc::POLLIN != 0 {
            wakeup.drain();
            while let Ok(request) = request_rx.try_recv() {
                handle_request(request, &mut inotify, &mut state, &terminate);
            }
        }

        if fds[0].revents & libc::POLLIN != 0 {
            process_inotify_events(&mut inotify, &mut buffer, &mut state, &sink);
        }

        if terminate.load(Ordering::SeqCst) && state.is_empty() {
            break 'outer;
        }
    }

    termination.signal_done();
    tracing::info!("LinuxServer run-loop exited");
}

fn handle_request(
    request: Request,
    inotify: &mut Inotify,
    state: &mut WatchPointState,
    terminate: &Arc<AtomicBool>,
) {
    match request {
        Request::Register { path, reply } => {
            let result = if state.watches.contains_key(&path) {
                Err(WatchError::AlreadyWatching(path.clone()))
            } else {
                match inotify.add_watch(&path, watch_mask()) {
                    Ok(wd) => {
                        state.insert(path.clone(), wd);
                        tracing::info!(path = %path.display(), "registered watch");
                        Ok(())
                    }
                    Err(source) => {
                        tracing::warn!(path = %path.display(), %source, "failed to install inotify watch");
                        Err(WatchError::WatchFailed { path: path.clone(), source })
                    }
                }
            };
            let _ = reply.send(result);
        }
        Request::Unregister { paths, reply } => {
            let mut all_known = true;
            for path in &paths {
                if let Some(wd) = state.watches.get(path).cloned() {
                    let _ = inotify.rm_watch(wd.clone());
                    state.remove_by_wd(&wd);
                    tracing::info!(path = %path.display(), "unregistered watch");
                } else {
                    all_known = false;
                }
            }
            let _ = reply.send(all_known);
        }
        Request::Shutdown => {
            let wds: Vec<WatchDescriptor> = state.paths.keys().cloned().collect();
            for wd in wds {
                let _ = inotify.rm_watch(wd.clone());
                state.remove_by_wd(&wd);
            }
            terminate.store(true, Ordering::SeqCst);
        }
    }
}

fn process_inotify_events(
    inotify: &mut Inotify,
    buffer: &mut [u8],
    state: &mut WatchPointState,
    sink: &Arc<dyn ChangeSink>,
) {
    let events = match inotify.read_events(buffer) {
        Ok(events) => events,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
        Err(err) => {
            tracing::error!(%err, "failed to read inotify events");
            return;
        }
    };

    // MODIFY suppresses a following CLOSE_WRITE for the same descriptor
    // within the same read (spec.md 4.3).
    let mut modified_this_read: HashSet<WatchDescriptor> = HashSet::new();

    for event in events {
        let mask = event.mask;
        let wd = event.wd;

        if mask.contains(EventMask::Q_OVERFLOW) {
            for path in state.watches.keys().cloned().collect::<Vec<_>>() {
                dispatch_change(sink.as_ref(), ChangeType::Overflow, path);
            }
            continue;
        }

        if mask.contains(EventMask::IGNORED) {
            // The watch is already gone; nothing further to do.
            continue;
        }

        let Some(root) = state.paths.get(&wd).cloned() else {
            continue;
        };

        if mask.contains(EventMask::DELETE_SELF) || mask.contains(EventMask::MOVE_SELF) {
            state.remove_by_wd(&wd);
            dispatch_change(sink.as_ref(), ChangeType::Removed, root);
            continue;
        }

        let Some(name) = event.name else {
            continue;
        };
        let child = root.join(name);

        if mask.contains(EventMask::CREATE) || mask.contains(EventMask::MOVED_TO) {
            dispatch_change(sink.as_ref(), ChangeType::Created, child);
        } else if mask.contains(EventMask::DELETE) || mask.contains(EventMask::MOVED_FROM) {
            dispatch_change(sink.as_ref(), ChangeType::Removed, child);
        } else if mask.contains(EventMask::MODIFY) {
            modified_this_read.insert(wd.clone());
            dispatch_change(sink.as_ref(), ChangeType::Modified, child);
        } else if mask.contains(EventMask::ATTRIB) {
            dispatch_change(sink.as_ref(), ChangeType::Modified, child);
        } else if mask.contains(EventMask::CLOSE_WRITE) {
            if !modified_this_read.contains(&wd) {
                dispatch_change(sink.as_ref(), ChangeType::Modified, child);
            }
        } else {
            dispatch_change(sink.as_ref(), ChangeType::Unknown, child);
        }
    }
}
