//! Black-box scenarios driven entirely through the public `Watcher` API.
//! Each corresponds to one of the literal end-to-end scenarios this crate's
//! testable properties are built around.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sd_fs_watcher::{create_watcher, ChangeSink, ChangeType, WatchError};

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(ChangeType, PathBuf)>>,
    errors: Mutex<Vec<WatchError>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn events(&self) -> Vec<(ChangeType, PathBuf)> {
        self.events.lock().unwrap().clone()
    }

    fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

impl ChangeSink for RecordingSink {
    fn path_changed(&self, change: ChangeType, path: PathBuf) {
        self.events.lock().unwrap().push((change, path));
    }

    fn report_error(&self, error: WatchError) {
        self.errors.lock().unwrap().push(error);
    }
}

/// Polls `condition` until it is true or `timeout` elapses, returning the
/// final observed value. Never a bare fixed sleep: scenario 4 in particular
/// depends on the *absence* of an event showing up within a bound, not on a
/// guessed delay.
fn poll_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return condition();
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn has_event(sink: &RecordingSink, change: ChangeType, path: &PathBuf) -> bool {
    sink.events().iter().any(|(c, p)| *c == change && p == path)
}

#[test]
fn create_yields_created_event() {
    let root = tempfile::tempdir().unwrap();
    let sink = RecordingSink::new();
    let watcher = create_watcher(sink.clone(), Duration::ZERO);
    watcher
        .start_watching(&[root.path().to_path_buf()])
        .unwrap();

    let file = root.path().join("a.txt");
    std::fs::write(&file, b"hello").unwrap();

    assert!(poll_until(
        || has_event(&sink, ChangeType::Created, &file),
        Duration::from_secs(2)
    ));

    assert!(watcher.close(Duration::from_secs(2)).unwrap());
}

#[test]
fn create_then_delete_yields_created_then_removed() {
    let root = tempfile::tempdir().unwrap();
    let sink = RecordingSink::new();
    let watcher = create_watcher(sink.clone(), Duration::ZERO);
    watcher
        .start_watching(&[root.path().to_path_buf()])
        .unwrap();

    let file = root.path().join("b.txt");
    std::fs::write(&file, b"hello").unwrap();
    assert!(poll_until(
        || has_event(&sink, ChangeType::Created, &file),
        Duration::from_secs(2)
    ));

    std::fs::remove_file(&file).unwrap();
    assert!(poll_until(
        || has_event(&sink, ChangeType::Removed, &file),
        Duration::from_secs(2)
    ));

    let events = sink.events();
    let created_idx = events
        .iter()
        .position(|(c, p)| *c == ChangeType::Created && p == &file)
        .unwrap();
    let removed_idx = events
        .iter()
        .position(|(c, p)| *c == ChangeType::Removed && p == &file)
        .unwrap();
    assert!(created_idx < removed_idx);
    // Windows additionally permits a MODIFIED between the two; every other
    // event for this path must be one of the three.
    for (change, path) in &events {
        if path == &file {
            assert!(matches!(
                change,
                ChangeType::Created | ChangeType::Modified | ChangeType::Removed
            ));
        }
    }

    assert!(watcher.close(Duration::from_secs(2)).unwrap());
}

#[test]
fn rename_yields_removed_old_and_created_new() {
    let root = tempfile::tempdir().unwrap();
    let sink = RecordingSink::new();
    let watcher = create_watcher(sink.clone(), Duration::ZERO);
    watcher
        .start_watching(&[root.path().to_path_buf()])
        .unwrap();

    let old_path = root.path().join("x");
    let new_path = root.path().join("y");
    std::fs::write(&old_path, b"hello").unwrap();
    assert!(poll_until(
        || has_event(&sink, ChangeType::Created, &old_path),
        Duration::from_secs(2)
    ));

    std::fs::rename(&old_path, &new_path).unwrap();

    assert!(poll_until(
        || has_event(&sink, ChangeType::Removed, &old_path)
            && has_event(&sink, ChangeType::Created, &new_path),
        Duration::from_secs(2)
    ));

    assert!(watcher.close(Duration::from_secs(2)).unwrap());
}

#[test]
fn no_events_after_stop_watching() {
    let root = tempfile::tempdir().unwrap();
    let sink = RecordingSink::new();
    let watcher = create_watcher(sink.clone(), Duration::ZERO);
    watcher
        .start_watching(&[root.path().to_path_buf()])
        .unwrap();

    assert!(watcher.stop_watching(&[root.path().to_path_buf()]));

    let file = root.path().join("z.txt");
    std::fs::write(&file, b"hello").unwrap();

    // Bounded tail, per this crate's "no events after unregister" property.
    std::thread::sleep(Duration::from_millis(500));
    assert!(!has_event(&sink, ChangeType::Created, &file));

    assert!(watcher.close(Duration::from_secs(2)).unwrap());
}

#[test]
fn concurrent_writers_drain_cleanly_on_close() {
    const DIRS: usize = 4;
    const WRITERS_PER_DIR: usize = 100;
    const APPENDS_PER_WRITER: usize = 500;

    let dirs: Vec<_> = (0..DIRS).map(|_| tempfile::tempdir().unwrap()).collect();
    let sink = RecordingSink::new();
    let watcher = create_watcher(sink.clone(), Duration::ZERO);

    let paths: Vec<PathBuf> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
    watcher.start_watching(&paths).unwrap();

    let mut handles = Vec::with_capacity(DIRS * WRITERS_PER_DIR);
    for dir in &dirs {
        for writer_idx in 0..WRITERS_PER_DIR {
            let file = dir.path().join(format!("writer-{writer_idx}.log"));
            handles.push(std::thread::spawn(move || {
                use std::io::Write;
                let mut handle = std::fs::File::create(&file).unwrap();
                for _ in 0..APPENDS_PER_WRITER {
                    let _ = handle.write_all(b"x");
                }
            }));
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(watcher.close(Duration::from_secs(5)).unwrap());
    assert_eq!(sink.error_count(), 0);
}

#[test]
#[cfg_attr(target_os = "linux", ignore = "recursive delivery is a documented asymmetry on Linux")]
fn recursive_subdirectory_creation_is_observed() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("sub")).unwrap();

    let sink = RecordingSink::new();
    let watcher = create_watcher(sink.clone(), Duration::ZERO);
    watcher
        .start_watching(&[root.path().to_path_buf()])
        .unwrap();

    let nested = root.path().join("sub").join("inner.txt");
    std::fs::write(&nested, b"hello").unwrap();

    assert!(poll_until(
        || has_event(&sink, ChangeType::Created, &nested),
        Duration::from_secs(2)
    ));

    assert!(watcher.close(Duration::from_secs(2)).unwrap());
}

#[cfg(target_os = "linux")]
#[test]
fn linux_does_not_observe_subdirectory_creation() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("sub")).unwrap();

    let sink = RecordingSink::new();
    let watcher = create_watcher(sink.clone(), Duration::ZERO);
    watcher
        .start_watching(&[root.path().to_path_buf()])
        .unwrap();

    let nested = root.path().join("sub").join("inner.txt");
    std::fs::write(&nested, b"hello").unwrap();

    assert!(!poll_until(
        || has_event(&sink, ChangeType::Created, &nested),
        Duration::from_millis(500)
    ));

    assert!(watcher.close(Duration::from_secs(2)).unwrap());
}

#[test]
fn double_close_fails() {
    let root = tempfile::tempdir().unwrap();
    let sink = RecordingSink::new();
    let watcher = create_watcher(sink, Duration::ZERO);
    watcher
        .start_watching(&[root.path().to_path_buf()])
        .unwrap();

    assert!(watcher.close(Duration::from_secs(2)).unwrap());
    let err = watcher.close(Duration::from_secs(2)).unwrap_err();
    assert!(matches!(err, WatchError::AlreadyClosed));
}

#[test]
fn duplicate_start_fails() {
    let root = tempfile::tempdir().unwrap();
    let sink = RecordingSink::new();
    let watcher = create_watcher(sink, Duration::ZERO);
    watcher
        .start_watching(&[root.path().to_path_buf()])
        .unwrap();

    let err = watcher
        .start_watching(&[root.path().to_path_buf()])
        .unwrap_err();
    assert!(matches!(err, WatchError::AlreadyWatching(_)));

    assert!(watcher.close(Duration::from_secs(2)).unwrap());
}

#[test]
fn callback_panic_is_reported_as_callback_failure() {
    struct PanickingSink;
    impl ChangeSink for PanickingSink {
        fn path_changed(&self, _change: ChangeType, _path: PathBuf) {
            panic!("boom");
        }
        fn report_error(&self, _error: WatchError) {}
    }

    struct RelaySink {
        inner: Arc<PanickingSink>,
        errors: Arc<Mutex<Vec<WatchError>>>,
    }
    impl ChangeSink for RelaySink {
        fn path_changed(&self, change: ChangeType, path: PathBuf) {
            self.inner.path_changed(change, path);
        }
        fn report_error(&self, error: WatchError) {
            self.errors.lock().unwrap().push(error);
        }
    }

    let root = tempfile::tempdir().unwrap();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::new(RelaySink {
        inner: Arc::new(PanickingSink),
        errors: errors.clone(),
    });
    let watcher = create_watcher(sink, Duration::ZERO);
    watcher
        .start_watching(&[root.path().to_path_buf()])
        .unwrap();

    // A plain mkdir yields a single CREATED normalized event (unlike a file
    // write, which also yields a MODIFIED on Linux/Windows and would drive
    // `path_changed` twice, doubling the reported `CallbackFailure` count).
    std::fs::create_dir(root.path().join("trigger-dir")).unwrap();

    assert!(poll_until(
        || !errors.lock().unwrap().is_empty(),
        Duration::from_secs(2)
    ));
    // Let any further (unexpected) dispatch land before asserting the count.
    std::thread::sleep(Duration::from_millis(200));
    let recorded = errors.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(matches!(&recorded[0], WatchError::CallbackFailure(msg) if msg.contains("boom")));
    drop(recorded);

    assert!(watcher.close(Duration::from_secs(2)).unwrap());
}
