//! Daemon: owns the job store, conversion worker and folder watcher and wires
//! them together.
//!
//! There are no globals. The watcher callback gets a shared handle to the
//! intake state (store, worker and current folder settings) and everything
//! else goes through [`Daemon`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError, FolderSettings};
use crate::job_store::{JobStore, StoreError, DEFAULT_LIST_LIMIT};
use crate::jobs::{ConversionJob, DownloadRecord};
use crate::scan::AudioFile;
use crate::stability::StabilityPolicy;
use crate::status::{ScanSummary, ServiceStatus};
use crate::watcher::{FolderWatcher, WatchError};
use crate::worker::{ConversionWorker, WorkerError, WorkerSettings};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Watcher error: {0}")]
    Watch(#[from] WatchError),

    #[error("No watch folder configured")]
    NoWatchFolder,

    #[error("No output folder configured")]
    NoOutputFolder,

    #[error("Download {0} not found")]
    DownloadNotFound(i64),

    #[error("Watch folder is not an existing directory: {0}")]
    InvalidWatchFolder(PathBuf),

    #[error("Cannot create output folder {path}: {source}")]
    OutputFolder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// State shared with the watcher callback.
struct Intake {
    store: Arc<JobStore>,
    worker: ConversionWorker,
    settings: Arc<RwLock<FolderSettings>>,
    /// Runtime the daemon was built on; watcher threads start the worker through it.
    runtime: Option<Handle>,
    closed: AtomicBool,
}

impl Intake {
    fn settings(&self) -> FolderSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Register a file seen in the watch folder; `None` if it was already known.
    fn register(&self, file: &AudioFile) -> Result<Option<i64>, StoreError> {
        let registered = self.store.register_download(file)?;
        match registered {
            Some(download_id) => {
                debug!(download_id, file = %file.filename, "Registered download")
            }
            None => debug!(file = %file.filename, "Already registered, skipping"),
        }
        Ok(registered)
    }

    /// Queue a conversion if auto-convert is on and an output folder is set.
    fn maybe_auto_convert(&self, download_id: i64, file: &AudioFile) -> Result<bool, WorkerError> {
        let settings = self.settings();
        if !settings.auto_convert {
            return Ok(false);
        }
        let Some(output_dir) = settings.output_folder() else {
            return Ok(false);
        };
        self.worker
            .enqueue(Some(download_id), &file.filepath, &file.extension, output_dir)?;
        Ok(true)
    }

    /// Start the worker on the runtime without waiting. Encoder problems are logged.
    fn start_worker_soon(&self) {
        if self.worker.is_running() || self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(runtime) = &self.runtime else {
            warn!("No async runtime available, conversion worker not started");
            return;
        };
        let worker = self.worker.clone();
        runtime.spawn(async move {
            if let Err(e) = worker.start().await {
                warn!(error = %e, "Conversion worker not started");
            }
        });
    }

    fn on_new_file(&self, file: AudioFile) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(file = %file.filename, "Daemon shutting down, ignoring file");
            return;
        }
        info!(file = %file.filename, size_mb = file.size_mb, extension = %file.extension, "Detected new file");
        let download_id = match self.register(&file) {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(e) => {
                error!(file = %file.filename, error = %e, "Failed to register new file");
                return;
            }
        };
        match self.maybe_auto_convert(download_id, &file) {
            Ok(true) => self.start_worker_soon(),
            Ok(false) => {}
            Err(e) => error!(file = %file.filename, error = %e, "Failed to queue conversion"),
        }
    }
}

/// The drop-folder daemon.
pub struct Daemon {
    config: Config,
    config_path: Option<PathBuf>,
    intake: Arc<Intake>,
    watcher: Mutex<FolderWatcher>,
}

impl Daemon {
    /// Open the job store named in `config` and build the worker and watcher.
    ///
    /// Nothing is started; call [`Daemon::restore_on_startup`] for that.
    pub fn open(config: Config) -> Result<Self, DaemonError> {
        let store = Arc::new(JobStore::open(&config.storage.database_path)?);
        Ok(Self::with_store(config, store))
    }

    /// Build a daemon on an already opened store.
    ///
    /// Call from inside a tokio runtime so files picked up by the watcher can
    /// start the worker.
    pub fn with_store(config: Config, store: Arc<JobStore>) -> Self {
        let settings = WorkerSettings::from(&config.encoder);
        Self::with_worker_settings(config, store, settings)
    }

    /// Like [`Daemon::with_store`], with explicit worker settings.
    pub fn with_worker_settings(
        config: Config,
        store: Arc<JobStore>,
        worker_settings: WorkerSettings,
    ) -> Self {
        let worker = ConversionWorker::new(Arc::clone(&store), worker_settings);
        let watcher = FolderWatcher::new(StabilityPolicy::from(&config.watcher));
        let intake = Arc::new(Intake {
            store,
            worker,
            settings: Arc::new(RwLock::new(config.folders.clone())),
            runtime: Handle::try_current().ok(),
            closed: AtomicBool::new(false),
        });

        Self {
            config,
            config_path: None,
            intake,
            watcher: Mutex::new(watcher),
        }
    }

    /// Persist folder settings to `path` whenever they change.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current folder settings.
    pub fn settings(&self) -> FolderSettings {
        self.intake.settings()
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.intake.store
    }

    pub fn worker(&self) -> &ConversionWorker {
        &self.intake.worker
    }

    fn watcher(&self) -> MutexGuard<'_, FolderWatcher> {
        self.watcher.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bring services back after a (re)start and requeue interrupted jobs.
    ///
    /// Recovery runs before the worker or watcher start, so no job is picked
    /// up while an interrupted one is still marked converting.
    pub async fn restore_on_startup(&self) -> Result<(), DaemonError> {
        info!("Restoring state from job store");
        let settings = self.settings();

        if let Some(output_dir) = settings.output_folder() {
            if let Err(e) = std::fs::create_dir_all(output_dir) {
                warn!(path = %output_dir.display(), error = %e, "Cannot create output folder");
            }
            let requeued = self.worker().recover_interrupted(output_dir)?;
            if requeued > 0 {
                info!(requeued, "Re-queued interrupted conversions");
            }
            self.ensure_worker().await;
        } else {
            info!("No output folder configured, worker not started");
        }

        match settings.watch_folder() {
            Some(path) if path.is_dir() => self.start_watcher(path),
            Some(path) => warn!(path = %path.display(), "Watch folder is not a directory, watcher not started"),
            None => info!("No watch folder to restore"),
        }
        Ok(())
    }

    /// Handle a settled file reported by the watcher.
    pub fn on_new_file(&self, file: AudioFile) {
        self.intake.on_new_file(file);
    }

    /// Register every unknown audio file in the watch folder and auto-convert new ones.
    pub async fn scan_now(&self) -> Result<ScanSummary, DaemonError> {
        let settings = self.settings();
        let watch_dir = settings
            .watch_folder()
            .ok_or(DaemonError::NoWatchFolder)?
            .to_path_buf();

        info!(path = %watch_dir.display(), "Scanning folder");
        let files = FolderWatcher::scan_existing(&watch_dir);

        let mut summary = ScanSummary {
            scanned: files.len(),
            ..ScanSummary::default()
        };
        for file in &files {
            if let Some(download_id) = self.intake.register(file)? {
                summary.added += 1;
                if self.intake.maybe_auto_convert(download_id, file)? {
                    summary.queued += 1;
                }
            }
        }

        if summary.queued > 0 {
            self.ensure_worker().await;
        }
        info!(
            scanned = summary.scanned,
            added = summary.added,
            queued = summary.queued,
            "Scan complete"
        );
        Ok(summary)
    }

    /// Manually convert one registered download. Returns the job id.
    pub async fn convert_download(&self, download_id: i64) -> Result<i64, DaemonError> {
        let download = self
            .store()
            .get_download(download_id)?
            .ok_or(DaemonError::DownloadNotFound(download_id))?;
        let output_dir = self.require_output_folder()?;

        self.ensure_worker().await;
        let job_id = self.worker().enqueue(
            Some(download.id),
            &download.filepath,
            &download.extension,
            &output_dir,
        )?;
        Ok(job_id)
    }

    /// Manually retry a failed job.
    pub async fn retry(&self, job_id: i64) -> Result<(), DaemonError> {
        let output_dir = self.require_output_folder()?;
        self.worker().retry(job_id, &output_dir)?;
        self.ensure_worker().await;
        Ok(())
    }

    /// Validate and apply new folder settings, then restart services.
    pub async fn apply_settings(&self, new_settings: FolderSettings) -> Result<(), DaemonError> {
        if let Some(watch) = new_settings.watch_folder() {
            if !watch.is_dir() {
                return Err(DaemonError::InvalidWatchFolder(watch.to_path_buf()));
            }
        }
        if let Some(output) = new_settings.output_folder() {
            std::fs::create_dir_all(output).map_err(|source| DaemonError::OutputFolder {
                path: output.to_path_buf(),
                source,
            })?;
        }

        *self
            .intake
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner()) = new_settings.clone();

        if let Some(path) = &self.config_path {
            let mut config = self.config.clone();
            config.folders = new_settings;
            config.save_to_file(path)?;
            debug!(path = %path.display(), "Saved folder settings");
        }

        self.restart_services().await;
        Ok(())
    }

    async fn restart_services(&self) {
        let settings = self.settings();
        match settings.watch_folder() {
            Some(path) if path.is_dir() => self.start_watcher(path),
            _ => self.watcher().stop(),
        }
        if settings.output_folder().is_some() {
            self.ensure_worker().await;
        }
    }

    fn start_watcher(&self, path: &Path) {
        let intake = Arc::clone(&self.intake);
        let result = self
            .watcher()
            .start(path, move |file| intake.on_new_file(file));
        if let Err(e) = result {
            error!(path = %path.display(), error = %e, "Failed to start watcher");
        }
    }

    /// Start the worker if it is not running. Encoder problems are logged, not fatal.
    async fn ensure_worker(&self) -> bool {
        if self.worker().is_running() {
            return true;
        }
        match self.worker().start().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Conversion worker not started");
                false
            }
        }
    }

    fn require_output_folder(&self) -> Result<PathBuf, DaemonError> {
        self.settings()
            .output_folder()
            .map(Path::to_path_buf)
            .ok_or(DaemonError::NoOutputFolder)
    }

    pub fn status(&self) -> Result<ServiceStatus, DaemonError> {
        let settings = self.settings();
        let encoder = self.worker().encoder();
        let (watcher_active, watch_path) = {
            let watcher = self.watcher();
            (watcher.is_running(), watcher.watch_path().map(Path::to_path_buf))
        };

        Ok(ServiceStatus {
            timestamp: Utc::now(),
            watcher_active,
            watch_path: watch_path.or_else(|| settings.watch_folder().map(Path::to_path_buf)),
            output_path: settings.output_folder().map(Path::to_path_buf),
            auto_convert: settings.auto_convert,
            worker_running: self.worker().is_running(),
            encoder_path: encoder.as_ref().map(|e| e.path.clone()),
            encoder_version: encoder.and_then(|e| e.version),
            current_job: self.worker().current_job(),
            queue_size: self.worker().queue_size(),
            stats: self.store().stats()?,
        })
    }

    /// Most recent jobs, newest first. `None` uses the default cap.
    pub fn list_jobs(&self, limit: Option<usize>) -> Result<Vec<ConversionJob>, DaemonError> {
        Ok(self
            .store()
            .list_recent(limit.unwrap_or(DEFAULT_LIST_LIMIT))?)
    }

    /// Most recently detected downloads, newest first.
    pub fn list_downloads(&self, limit: Option<usize>) -> Result<Vec<DownloadRecord>, DaemonError> {
        Ok(self
            .store()
            .list_downloads(limit.unwrap_or(DEFAULT_LIST_LIMIT))?)
    }

    /// Wait until every queued job has been processed, up to `limit`.
    pub async fn drain(&self, limit: Duration) -> bool {
        self.worker().wait_until_idle(limit).await
    }

    /// Stop the watcher, then the worker (waiting for its current job).
    pub async fn shutdown(&self) {
        self.intake.closed.store(true, Ordering::SeqCst);
        self.watcher().stop();
        self.worker().shutdown().await;
        info!("Daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use std::fs;
    use tempfile::TempDir;

    fn config_for(temp: &Path, watch: Option<&Path>, output: Option<&Path>) -> Config {
        let mut config = Config::default();
        config.folders.watch_folder = watch.map(Path::to_path_buf);
        config.folders.output_folder = output.map(Path::to_path_buf);
        config.storage.database_path = temp.join("state.db");
        config.watcher.poll_interval_ms = 100;
        config
    }

    fn worker_settings(encoder: PathBuf) -> WorkerSettings {
        WorkerSettings {
            encoder_candidates: vec![encoder],
            probe_timeout: Duration::from_secs(5),
            convert_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Daemon over an in-memory store whose encoder never resolves.
    fn daemon_with_store(config: Config, store: Arc<JobStore>) -> Daemon {
        let missing = config.storage.database_path.with_file_name("no-such-encoder");
        Daemon::with_worker_settings(config, store, worker_settings(missing))
    }

    fn daemon(config: Config) -> Daemon {
        daemon_with_store(config, Arc::new(JobStore::in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_scan_requires_watch_folder() {
        let temp = TempDir::new().unwrap();
        let daemon = daemon(config_for(temp.path(), None, None));
        assert!(matches!(
            daemon.scan_now().await,
            Err(DaemonError::NoWatchFolder)
        ));
    }

    #[tokio::test]
    async fn test_scan_registers_audio_files_once() {
        let temp = TempDir::new().unwrap();
        let drop_dir = temp.path().join("drop");
        fs::create_dir_all(&drop_dir).unwrap();
        for name in ["a.mp3", "b.flac", "c.txt", "d.wav", "e.jpg"] {
            fs::write(drop_dir.join(name), name.as_bytes()).unwrap();
        }

        // No output folder: files are registered but nothing is queued.
        let daemon = daemon(config_for(temp.path(), Some(&drop_dir), None));
        let summary = daemon.scan_now().await.unwrap();
        assert_eq!(
            summary,
            ScanSummary {
                scanned: 3,
                added: 3,
                queued: 0
            }
        );

        let again = daemon.scan_now().await.unwrap();
        assert_eq!(again.scanned, 3);
        assert_eq!(again.added, 0);
        assert_eq!(daemon.list_downloads(None).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_scan_queues_when_output_configured() {
        let temp = TempDir::new().unwrap();
        let drop_dir = temp.path().join("drop");
        let out_dir = temp.path().join("out");
        fs::create_dir_all(&drop_dir).unwrap();
        fs::write(drop_dir.join("a.mp3"), b"a").unwrap();
        fs::write(drop_dir.join("b.ogg"), b"b").unwrap();

        let daemon = daemon(config_for(temp.path(), Some(&drop_dir), Some(&out_dir)));
        let summary = daemon.scan_now().await.unwrap();

        assert_eq!(summary.queued, 2);
        // Encoder is missing: jobs wait as pending.
        assert!(!daemon.worker().is_running());
        assert_eq!(daemon.worker().queue_size(), 2);
        assert_eq!(daemon.store().stats().unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_auto_convert_disabled_only_registers() {
        let temp = TempDir::new().unwrap();
        let drop_dir = temp.path().join("drop");
        let out_dir = temp.path().join("out");
        fs::create_dir_all(&drop_dir).unwrap();
        fs::write(drop_dir.join("a.mp3"), b"a").unwrap();

        let mut config = config_for(temp.path(), Some(&drop_dir), Some(&out_dir));
        config.folders.auto_convert = false;
        let daemon = daemon(config);

        let summary = daemon.scan_now().await.unwrap();
        assert_eq!(summary.added, 1);
        assert_eq!(summary.queued, 0);
        assert_eq!(daemon.store().stats().unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_on_new_file_skips_known_paths() {
        let temp = TempDir::new().unwrap();
        let out_dir = temp.path().join("out");
        let source = temp.path().join("song.mp3");
        fs::write(&source, b"mp3").unwrap();

        let daemon = daemon(config_for(temp.path(), None, Some(&out_dir)));
        let file = AudioFile::from_path(&source).unwrap();
        daemon.on_new_file(file.clone());
        daemon.on_new_file(file);

        assert_eq!(daemon.list_downloads(None).unwrap().len(), 1);
        let jobs = daemon.list_jobs(None).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert!(jobs[0].download_id.is_some());
    }

    #[tokio::test]
    async fn test_convert_download_errors() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("song.mp3");
        fs::write(&source, b"mp3").unwrap();

        let daemon = daemon(config_for(temp.path(), None, None));
        assert!(matches!(
            daemon.convert_download(99).await,
            Err(DaemonError::DownloadNotFound(99))
        ));

        let download_id = daemon
            .store()
            .register_download(&AudioFile::from_path(&source).unwrap())
            .unwrap()
            .unwrap();
        assert!(matches!(
            daemon.convert_download(download_id).await,
            Err(DaemonError::NoOutputFolder)
        ));
    }

    #[tokio::test]
    async fn test_convert_download_queues_job() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("song.mp3");
        let out_dir = temp.path().join("out");
        fs::write(&source, b"mp3").unwrap();

        let daemon = daemon(config_for(temp.path(), None, Some(&out_dir)));
        let download_id = daemon
            .store()
            .register_download(&AudioFile::from_path(&source).unwrap())
            .unwrap()
            .unwrap();

        let job_id = daemon.convert_download(download_id).await.unwrap();
        assert_eq!(daemon.convert_download(download_id).await.unwrap(), job_id);
        assert_eq!(daemon.worker().queue_size(), 1);
    }

    #[tokio::test]
    async fn test_retry_requires_output_and_failed_job() {
        let temp = TempDir::new().unwrap();
        let out_dir = temp.path().join("out");

        let no_output = daemon(config_for(temp.path(), None, None));
        assert!(matches!(
            no_output.retry(1).await,
            Err(DaemonError::NoOutputFolder)
        ));

        let daemon = daemon(config_for(temp.path(), None, Some(&out_dir)));
        let job_id = daemon
            .store()
            .create(Path::new("/drop/a.mp3"), "mp3", None)
            .unwrap()
            .id();
        assert!(matches!(
            daemon.retry(job_id).await,
            Err(DaemonError::Worker(WorkerError::Store(
                StoreError::RetryRejected { .. }
            )))
        ));

        daemon.store().mark_converting(job_id).unwrap();
        daemon.store().mark_failed(job_id, "boom").unwrap();
        daemon.retry(job_id).await.unwrap();
        assert_eq!(
            daemon.store().get(job_id).unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert_eq!(daemon.worker().queue_size(), 1);
    }

    #[tokio::test]
    async fn test_apply_settings_validates_and_persists() {
        let temp = TempDir::new().unwrap();
        let config_file = temp.path().join("config.toml");
        let daemon = daemon(config_for(temp.path(), None, None)).with_config_path(&config_file);

        let bad = FolderSettings {
            watch_folder: Some(temp.path().join("missing")),
            output_folder: None,
            auto_convert: true,
        };
        assert!(matches!(
            daemon.apply_settings(bad).await,
            Err(DaemonError::InvalidWatchFolder(_))
        ));

        let drop_dir = temp.path().join("drop");
        let out_dir = temp.path().join("nested").join("out");
        fs::create_dir_all(&drop_dir).unwrap();
        let good = FolderSettings {
            watch_folder: Some(drop_dir.clone()),
            output_folder: Some(out_dir.clone()),
            auto_convert: false,
        };
        daemon.apply_settings(good.clone()).await.unwrap();

        assert!(out_dir.is_dir());
        assert_eq!(daemon.settings(), good);
        let status = daemon.status().unwrap();
        assert!(status.watcher_active);
        assert_eq!(status.watch_path, Some(drop_dir.clone()));
        assert!(!status.auto_convert);
        let saved = Config::load_from_file(&config_file).unwrap();
        assert_eq!(saved.folders, good);

        // Clearing the watch folder stops the watcher.
        daemon
            .apply_settings(FolderSettings {
                watch_folder: None,
                ..good
            })
            .await
            .unwrap();
        assert!(!daemon.status().unwrap().watcher_active);

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_on_startup_requeues_interrupted_jobs() {
        let temp = TempDir::new().unwrap();
        let out_dir = temp.path().join("out");
        let store = Arc::new(JobStore::in_memory().unwrap());
        let a = store.create(Path::new("/drop/a.mp3"), "mp3", None).unwrap().id();
        let b = store.create(Path::new("/drop/b.mp3"), "mp3", None).unwrap().id();
        store.mark_converting(b).unwrap();

        let daemon = daemon_with_store(config_for(temp.path(), None, Some(&out_dir)), store);
        daemon.restore_on_startup().await.unwrap();

        assert!(out_dir.is_dir());
        assert_eq!(daemon.worker().queue_size(), 2);
        for id in [a, b] {
            assert_eq!(
                daemon.store().get(id).unwrap().unwrap().status,
                JobStatus::Pending
            );
        }

        let status = daemon.status().unwrap();
        assert_eq!(status.stats.pending, 2);
        assert!(!status.worker_running);
        assert!(!status.watcher_active);
    }

    #[cfg(unix)]
    async fn wait_for_status(daemon: &Daemon, job_id: i64, status: JobStatus) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(15);
        while std::time::Instant::now() < deadline {
            if daemon.store().get(job_id).unwrap().map(|j| j.status) == Some(status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_file_starts_worker_once_encoder_is_installed() {
        use crate::encode::test_support::fake_encoder;

        let temp = TempDir::new().unwrap();
        let bin_dir = temp.path().join("bin");
        let out_dir = temp.path().join("out");
        fs::create_dir_all(&bin_dir).unwrap();
        let encoder = bin_dir.join("fake-ffmpeg.sh");

        let daemon = Daemon::with_worker_settings(
            config_for(temp.path(), None, Some(&out_dir)),
            Arc::new(JobStore::in_memory().unwrap()),
            worker_settings(encoder.clone()),
        );
        daemon.restore_on_startup().await.unwrap();
        assert!(!daemon.worker().is_running());

        assert_eq!(fake_encoder(&bin_dir), encoder);
        let source = temp.path().join("late.mp3");
        fs::write(&source, b"late arrival").unwrap();
        daemon.on_new_file(AudioFile::from_path(&source).unwrap());

        let job_id = daemon.list_jobs(None).unwrap()[0].id;
        assert!(wait_for_status(&daemon, job_id, JobStatus::Done).await);
        assert!(daemon.worker().is_running());
        assert_eq!(
            fs::read(out_dir.join("late.aiff")).unwrap(),
            b"FORMlate arrival"
        );

        daemon.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interrupted_jobs_finish_after_restart() {
        use crate::encode::test_support::fake_encoder;

        let temp = TempDir::new().unwrap();
        let out_dir = temp.path().join("out");
        let store = Arc::new(JobStore::in_memory().unwrap());
        let mut ids = Vec::new();
        for name in ["a.mp3", "b.mp3"] {
            let source = temp.path().join(name);
            fs::write(&source, name.as_bytes()).unwrap();
            ids.push(store.create(&source, "mp3", None).unwrap().id());
        }
        // The second job was mid-conversion when the process died.
        store.mark_converting(ids[1]).unwrap();

        let daemon = Daemon::with_worker_settings(
            config_for(temp.path(), None, Some(&out_dir)),
            store,
            worker_settings(fake_encoder(temp.path())),
        );
        daemon.restore_on_startup().await.unwrap();

        for id in &ids {
            assert!(wait_for_status(&daemon, *id, JobStatus::Done).await);
        }
        assert!(out_dir.join("a.aiff").exists());
        assert!(out_dir.join("b.aiff").exists());

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_files_after_shutdown_are_ignored() {
        let temp = TempDir::new().unwrap();
        let out_dir = temp.path().join("out");
        let source = temp.path().join("song.mp3");
        fs::write(&source, b"mp3").unwrap();

        let daemon = daemon(config_for(temp.path(), None, Some(&out_dir)));
        daemon.shutdown().await;
        daemon.on_new_file(AudioFile::from_path(&source).unwrap());

        assert!(daemon.list_downloads(None).unwrap().is_empty());
        assert!(daemon.list_jobs(None).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watched_file_is_converted_end_to_end() {
        use crate::archive::ARCHIVE_DIR_NAME;
        use crate::encode::test_support::fake_encoder;

        let temp = TempDir::new().unwrap();
        let drop_dir = temp.path().join("drop");
        let out_dir = temp.path().join("out");
        fs::create_dir_all(&drop_dir).unwrap();

        let config = config_for(temp.path(), Some(&drop_dir), Some(&out_dir));
        let daemon = Daemon::with_worker_settings(
            config,
            Arc::new(JobStore::in_memory().unwrap()),
            worker_settings(fake_encoder(temp.path())),
        );
        daemon.restore_on_startup().await.unwrap();
        assert!(daemon.worker().is_running());

        fs::write(drop_dir.join("fresh.flac"), b"flac bytes").unwrap();

        let output = out_dir.join("fresh.aiff");
        let deadline = std::time::Instant::now() + Duration::from_secs(15);
        loop {
            let done = daemon
                .list_jobs(None)
                .unwrap()
                .iter()
                .any(|j| j.status == JobStatus::Done);
            if done || std::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(output.exists());
        assert!(drop_dir.join(ARCHIVE_DIR_NAME).join("fresh.flac").exists());
        let downloads = daemon.list_downloads(None).unwrap();
        assert_eq!(downloads.len(), 1);
        assert_eq!(
            downloads[0].filepath,
            drop_dir.join(ARCHIVE_DIR_NAME).join("fresh.flac")
        );

        daemon.shutdown().await;
    }
}
