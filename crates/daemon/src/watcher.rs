//! Folder watcher: notices new audio files in the drop folder.
//!
//! Only the top level of the folder is watched. For every created audio file
//! a short-lived thread waits for the file to stop growing (see
//! [`crate::stability`]) and then invokes the callback exactly once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use notify::event::CreateKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::scan::{is_audio_file, scan_existing, AudioFile};
use crate::stability::{wait_for_stable_size, StabilityPolicy};

/// Callback invoked with each new, settled audio file.
pub type NewFileCallback = Arc<dyn Fn(AudioFile) + Send + Sync + 'static>;

/// Errors that can occur when starting the watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch folder is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("failed to watch folder: {0}")]
    Notify(#[from] notify::Error),

    #[error("failed to spawn watcher thread: {0}")]
    Spawn(#[source] std::io::Error),
}

struct WatchSession {
    path: PathBuf,
    // Dropping the watcher closes the event channel.
    watcher: Option<RecommendedWatcher>,
    shutdown: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl WatchSession {
    fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        drop(self.watcher.take());
        if let Some(handle) = self.monitor.take() {
            if handle.join().is_err() {
                error!(path = %self.path.display(), "Watcher thread panicked");
            }
        }
    }
}

/// Watches one folder at a time for new audio files.
pub struct FolderWatcher {
    policy: StabilityPolicy,
    session: Option<WatchSession>,
}

impl FolderWatcher {
    pub fn new(policy: StabilityPolicy) -> Self {
        Self {
            policy,
            session: None,
        }
    }

    /// Start watching `path`, replacing any previous session.
    pub fn start<F>(&mut self, path: &Path, on_new_file: F) -> Result<(), WatchError>
    where
        F: Fn(AudioFile) + Send + Sync + 'static,
    {
        self.stop();

        if !path.is_dir() {
            return Err(WatchError::NotADirectory(path.to_path_buf()));
        }

        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(tx)?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let monitor = {
            let shutdown = Arc::clone(&shutdown);
            let policy = self.policy;
            let callback: NewFileCallback = Arc::new(on_new_file);
            std::thread::Builder::new()
                .name("folder-watcher".to_string())
                .spawn(move || monitor_events(rx, shutdown, policy, callback))
                .map_err(WatchError::Spawn)?
        };

        info!(path = %path.display(), "Watching folder");
        self.session = Some(WatchSession {
            path: path.to_path_buf(),
            watcher: Some(watcher),
            shutdown,
            monitor: Some(monitor),
        });
        Ok(())
    }

    /// Stop watching. No-op when not running.
    ///
    /// Files still settling when the watcher stops are dropped.
    pub fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            info!(path = %session.path.display(), "Stopped watching folder");
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Folder currently being watched.
    pub fn watch_path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.path.as_path())
    }

    /// Audio files already present directly inside `path`.
    pub fn scan_existing(path: &Path) -> Vec<AudioFile> {
        scan_existing(path)
    }
}

impl Drop for FolderWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_events(
    rx: mpsc::Receiver<notify::Result<Event>>,
    shutdown: Arc<AtomicBool>,
    policy: StabilityPolicy,
    callback: NewFileCallback,
) {
    // Paths with a stability check in flight; duplicate create events are ignored.
    let settling: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(event)) => {
                for path in created_audio_files(&event) {
                    spawn_settle(path, policy, &shutdown, &settling, &callback);
                }
            }
            Ok(Err(e)) => warn!(error = %e, "Watch error"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("Watcher event loop exited");
}

/// Audio file paths created by `event`.
fn created_audio_files(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter(|p| is_audio_file(p))
            .cloned()
            .collect(),
        _ => Vec::new(),
    }
}

fn spawn_settle(
    path: PathBuf,
    policy: StabilityPolicy,
    shutdown: &Arc<AtomicBool>,
    settling: &Arc<Mutex<HashSet<PathBuf>>>,
    callback: &NewFileCallback,
) {
    {
        let mut in_flight = settling.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(path.clone()) {
            debug!(path = %path.display(), "Already waiting for file to settle");
            return;
        }
    }

    let shutdown = Arc::clone(shutdown);
    let thread_settling = Arc::clone(settling);
    let callback = Arc::clone(callback);
    let thread_path = path.clone();

    let spawned = std::thread::Builder::new()
        .name("file-settle".to_string())
        .spawn(move || {
            let path = thread_path;
            let cancelled = || shutdown.load(Ordering::SeqCst);
            let result = wait_for_stable_size(&path, &policy, &cancelled);

            thread_settling
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&path);

            if cancelled() {
                return;
            }
            match result.ready_size() {
                Some(size) => match AudioFile::from_path(&path) {
                    Some(file) => {
                        debug!(path = %path.display(), size, "File settled");
                        callback(file);
                    }
                    None => debug!(path = %path.display(), "Settled file is not audio"),
                },
                None => debug!(path = %path.display(), ?result, "Dropping file that never settled"),
            }
        });

    if let Err(e) = spawned {
        settling
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path);
        warn!(path = %path.display(), error = %e, "Failed to spawn settle thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{ModifyKind, RemoveKind};
    use std::fs;
    use std::io::Write;
    use std::time::Instant;
    use tempfile::TempDir;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    fn collector() -> (Arc<Mutex<Vec<(AudioFile, Instant)>>>, impl Fn(AudioFile) + Send + Sync + 'static) {
        let seen: Arc<Mutex<Vec<(AudioFile, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |file| sink.lock().unwrap().push((file, Instant::now())))
    }

    fn wait_for<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        check()
    }

    #[test]
    fn test_created_audio_files_filters_kinds_and_extensions() {
        let created = event(
            EventKind::Create(CreateKind::File),
            &["/drop/a.mp3", "/drop/notes.txt"],
        );
        assert_eq!(created_audio_files(&created), vec![PathBuf::from("/drop/a.mp3")]);

        let any = event(EventKind::Create(CreateKind::Any), &["/drop/b.FLAC"]);
        assert_eq!(created_audio_files(&any), vec![PathBuf::from("/drop/b.FLAC")]);

        let folder = event(EventKind::Create(CreateKind::Folder), &["/drop/album.mp3"]);
        assert!(created_audio_files(&folder).is_empty());

        let modified = event(EventKind::Modify(ModifyKind::Any), &["/drop/a.mp3"]);
        assert!(created_audio_files(&modified).is_empty());

        let removed = event(EventKind::Remove(RemoveKind::File), &["/drop/a.mp3"]);
        assert!(created_audio_files(&removed).is_empty());
    }

    #[test]
    fn test_start_rejects_missing_folder() {
        let temp_dir = TempDir::new().unwrap();
        let mut watcher = FolderWatcher::new(StabilityPolicy::default());
        let err = watcher
            .start(&temp_dir.path().join("missing"), |_| {})
            .unwrap_err();
        assert!(matches!(err, WatchError::NotADirectory(_)));
        assert!(!watcher.is_running());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let mut watcher = FolderWatcher::new(StabilityPolicy::default());
        watcher.stop();

        watcher.start(temp_dir.path(), |_| {}).unwrap();
        assert!(watcher.is_running());
        assert_eq!(watcher.watch_path(), Some(temp_dir.path()));

        watcher.stop();
        watcher.stop();
        assert!(!watcher.is_running());
        assert_eq!(watcher.watch_path(), None);
    }

    #[test]
    fn test_restart_switches_folder() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let mut watcher = FolderWatcher::new(StabilityPolicy::default());

        watcher.start(first.path(), |_| {}).unwrap();
        watcher.start(second.path(), |_| {}).unwrap();
        assert_eq!(watcher.watch_path(), Some(second.path()));
    }

    #[test]
    fn test_new_audio_file_fires_once_after_writes_stop() {
        let temp_dir = TempDir::new().unwrap();
        let (seen, callback) = collector();
        let mut watcher = FolderWatcher::new(StabilityPolicy::default());
        watcher.start(temp_dir.path(), callback).unwrap();

        let path = temp_dir.path().join("download.mp3");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&[1u8; 64 * 1024]).unwrap();
        file.flush().unwrap();

        std::thread::sleep(Duration::from_millis(600));
        file.write_all(&[2u8; 64 * 1024]).unwrap();
        file.flush().unwrap();
        let last_write = Instant::now();
        drop(file);

        assert!(wait_for(Duration::from_secs(10), || !seen.lock().unwrap().is_empty()));
        // Give a duplicate a chance to show up.
        std::thread::sleep(Duration::from_millis(1500));
        watcher.stop();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (file, fired_at) = &seen[0];
        assert_eq!(file.filename, "download.mp3");
        assert_eq!(file.extension, "mp3");
        assert_eq!(file.filepath, path);
        assert!(
            fired_at.duration_since(last_write) >= Duration::from_millis(1400),
            "fired {:?} after the last write",
            fired_at.duration_since(last_write)
        );
    }

    #[test]
    fn test_non_audio_files_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let (seen, callback) = collector();
        let policy = StabilityPolicy {
            interval: Duration::from_millis(50),
            ..StabilityPolicy::default()
        };
        let mut watcher = FolderWatcher::new(policy);
        watcher.start(temp_dir.path(), callback).unwrap();

        fs::write(temp_dir.path().join("cover.jpg"), b"jpeg").unwrap();
        fs::write(temp_dir.path().join("track.mp3.part"), b"partial").unwrap();
        fs::create_dir(temp_dir.path().join("album.flac")).unwrap();
        fs::write(temp_dir.path().join("real.flac"), b"flac").unwrap();

        assert!(wait_for(Duration::from_secs(5), || !seen.lock().unwrap().is_empty()));
        std::thread::sleep(Duration::from_millis(500));
        watcher.stop();

        let names: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|(f, _)| f.filename.clone())
            .collect();
        assert_eq!(names, vec!["real.flac".to_string()]);
    }

    #[test]
    fn test_stop_drops_files_still_settling() {
        let temp_dir = TempDir::new().unwrap();
        let (seen, callback) = collector();
        let mut watcher = FolderWatcher::new(StabilityPolicy::default());
        watcher.start(temp_dir.path(), callback).unwrap();

        fs::write(temp_dir.path().join("late.wav"), b"wav").unwrap();
        std::thread::sleep(Duration::from_millis(300));
        watcher.stop();

        std::thread::sleep(Duration::from_millis(2500));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_scan_existing_delegates() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.mp3"), b"a").unwrap();
        fs::write(temp_dir.path().join("b.txt"), b"b").unwrap();
        assert_eq!(FolderWatcher::scan_existing(temp_dir.path()).len(), 1);
    }
}
