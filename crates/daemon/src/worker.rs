//! Conversion worker: the single background consumer of the conversion queue.
//!
//! The worker processes one job at a time. Each job is recorded in the
//! [`JobStore`] before, during and after conversion, and a converted source is
//! moved into the `_converted` archive next to it.
//!
//! Lifecycle: `start()` probes for an encoder and spawns the consumer task;
//! `stop()` is cooperative and lets the current job finish. Every start bumps a
//! generation counter, and a stop request only addresses the generation that was
//! current when it was issued, so a stale stop can never end a later consumer.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use aiff_drop_daemon_config::EncoderConfig;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::archive::archive_source;
use crate::encode::{self, encoder_candidates, locate_encoder, EncoderInfo};
use crate::job_store::{CreateOutcome, JobStore, StoreError};
use crate::jobs::JobStatus;
use crate::queue::{ConversionQueue, JobDescriptor, QueueItem};
use crate::scan::size_in_mb;

/// Errors surfaced by worker operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("ffmpeg not found; install it or set encoder.binary in the config")]
    EncoderNotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runtime settings for the worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Encoder binaries to probe, in order.
    pub encoder_candidates: Vec<PathBuf>,
    pub probe_timeout: Duration,
    /// Wall-clock limit for a single conversion.
    pub convert_timeout: Duration,
    /// How often the idle consumer re-checks whether it should keep running.
    pub poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&EncoderConfig::default())
    }
}

impl From<&EncoderConfig> for WorkerSettings {
    fn from(cfg: &EncoderConfig) -> Self {
        Self {
            encoder_candidates: encoder_candidates(cfg.binary.as_deref()),
            probe_timeout: Duration::from_secs(cfg.probe_timeout_secs),
            convert_timeout: Duration::from_secs(cfg.timeout_secs),
            poll_interval: Duration::from_secs(1),
        }
    }
}

struct WorkerInner {
    store: Arc<JobStore>,
    queue: ConversionQueue,
    settings: WorkerSettings,
    running: AtomicBool,
    generation: AtomicU64,
    encoder: RwLock<Option<EncoderInfo>>,
    current_job: Mutex<Option<i64>>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes start() calls.
    lifecycle: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl WorkerInner {
    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    fn current_job(&self) -> Option<i64> {
        *lock(&self.current_job)
    }

    fn set_current_job(&self, job_id: Option<i64>) {
        *lock(&self.current_job) = job_id;
    }
}

/// Handle to the conversion worker. Cloning shares the same worker.
#[derive(Clone)]
pub struct ConversionWorker {
    inner: Arc<WorkerInner>,
}

impl ConversionWorker {
    pub fn new(store: Arc<JobStore>, settings: WorkerSettings) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                store,
                queue: ConversionQueue::new(),
                settings,
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                encoder: RwLock::new(None),
                current_job: Mutex::new(None),
                task: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    /// Locate the encoder and start the consumer task.
    ///
    /// Calling `start` on a running worker is a no-op that returns the encoder
    /// already in use.
    pub async fn start(&self) -> Result<EncoderInfo, WorkerError> {
        let _guard = self.inner.lifecycle.lock().await;

        if self.is_running() {
            if let Some(info) = self.encoder() {
                return Ok(info);
            }
        }

        let settings = &self.inner.settings;
        let info = locate_encoder(&settings.encoder_candidates, settings.probe_timeout)
            .await
            .ok_or(WorkerError::EncoderNotFound)?;

        *self
            .inner
            .encoder
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(info.clone());

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(run_consumer(
            Arc::clone(&self.inner),
            generation,
            info.path.clone(),
        ));
        *lock(&self.inner.task) = Some(handle);

        info!(generation, encoder = %info.path.display(), "Conversion worker started");
        Ok(info)
    }

    /// Ask the consumer to exit after its current job. Does not wait.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner.queue.push_stop(generation);
        info!(generation, "Stopping conversion worker");
    }

    /// Stop and wait for the consumer task to finish its current job.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = lock(&self.inner.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Conversion worker task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
            && lock(&self.inner.task)
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of jobs waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.inner.queue.len()
    }

    /// Job currently being converted, if any.
    pub fn current_job(&self) -> Option<i64> {
        self.inner.current_job()
    }

    /// Encoder found by the last successful `start`.
    pub fn encoder(&self) -> Option<EncoderInfo> {
        self.inner
            .encoder
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record a job for `source_path` and queue it.
    ///
    /// Idempotent per source path: when a pending, converting or done job
    /// already exists its id is returned. A stored pending job that is not in
    /// the queue yet is queued; nothing else is pushed twice.
    pub fn enqueue(
        &self,
        download_id: Option<i64>,
        source_path: &Path,
        source_ext: &str,
        output_dir: &Path,
    ) -> Result<i64, WorkerError> {
        let outcome = self
            .inner
            .store
            .create(source_path, source_ext, download_id)?;
        let job_id = outcome.id();
        let descriptor = JobDescriptor {
            job_id,
            source_path: source_path.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
        };

        match outcome {
            CreateOutcome::Created(_) => {
                self.inner.queue.push(descriptor);
                info!(job_id, source = %source_path.display(), "Queued conversion");
            }
            CreateOutcome::Existing {
                status: JobStatus::Pending,
                ..
            } if self.inner.current_job() != Some(job_id) => {
                if self.inner.queue.push(descriptor) {
                    info!(job_id, source = %source_path.display(), "Queued stored pending conversion");
                } else {
                    debug!(job_id, "Conversion already queued");
                }
            }
            CreateOutcome::Existing { status, .. } => {
                debug!(job_id, %status, source = %source_path.display(), "Conversion already exists");
            }
        }

        if !self.is_running() {
            debug!(job_id, "Worker not running; job waits in queue");
        }
        Ok(job_id)
    }

    /// Reset a failed job to pending and queue it again.
    ///
    /// Does not start the worker.
    pub fn retry(&self, job_id: i64, output_dir: &Path) -> Result<(), WorkerError> {
        self.inner.store.retry(job_id)?;
        let job = self
            .inner
            .store
            .get(job_id)?
            .ok_or(StoreError::NotFound(job_id))?;

        self.inner.queue.push(JobDescriptor {
            job_id,
            source_path: job.source_path,
            output_dir: output_dir.to_path_buf(),
        });
        info!(job_id, "Retrying conversion");
        Ok(())
    }

    /// Requeue jobs left pending or converting by a previous run.
    ///
    /// Each job is reset to pending and queued exactly once; calling this again
    /// does not duplicate queue entries. Returns the number of jobs queued.
    pub fn recover_interrupted(&self, output_dir: &Path) -> Result<usize, WorkerError> {
        let jobs = self.inner.store.list_unfinished()?;
        let current = self.inner.current_job();
        let mut queued = 0;

        for job in jobs {
            if Some(job.id) == current {
                continue;
            }
            if let Err(e) = self.inner.store.reset_to_pending(job.id) {
                warn!(job_id = job.id, error = %e, "Could not reset interrupted job");
                continue;
            }
            let pushed = self.inner.queue.push(JobDescriptor {
                job_id: job.id,
                source_path: job.source_path,
                output_dir: output_dir.to_path_buf(),
            });
            if pushed {
                queued += 1;
            }
        }

        if queued > 0 {
            info!(queued, "Requeued interrupted conversions");
        }
        Ok(queued)
    }

    /// Wait until the queue is empty and no job is converting.
    ///
    /// Returns `false` if `limit` elapsed first.
    pub async fn wait_until_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.inner.queue.is_empty() && self.inner.current_job().is_none() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn run_consumer(inner: Arc<WorkerInner>, generation: u64, encoder: PathBuf) {
    let rx = inner.queue.receiver();
    // Held for the whole loop: only one consumer pops at a time.
    let mut rx = rx.lock().await;
    debug!(generation, "Consumer loop running");

    loop {
        if !inner.is_current(generation) {
            break;
        }

        let item = match timeout(inner.settings.poll_interval, rx.recv()).await {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(item)) => item,
        };

        match item {
            QueueItem::Stop { generation: target } if target == generation => break,
            QueueItem::Stop { generation: target } => {
                debug!(generation, target, "Ignoring stale stop request");
            }
            QueueItem::Job(job) => {
                inner.set_current_job(Some(job.job_id));
                inner.queue.mark_popped(job.job_id);
                process_job(&inner, &encoder, job).await;
                inner.set_current_job(None);
            }
        }
    }

    info!(generation, "Conversion worker stopped");
}

async fn process_job(inner: &Arc<WorkerInner>, encoder: &Path, job: JobDescriptor) {
    let job_id = job.job_id;
    let task_inner = Arc::clone(inner);
    let encoder = encoder.to_path_buf();

    run_guarded(inner, job_id, async move {
        convert_one(&task_inner, &encoder, &job).await
    })
    .await;
}

/// Run one job in its own task so that an error or panic is recorded as a
/// failure instead of ending the consumer.
async fn run_guarded<F>(inner: &WorkerInner, job_id: i64, job: F)
where
    F: Future<Output = Result<(), WorkerError>> + Send + 'static,
{
    let failure = match tokio::spawn(job).await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(e) => format!("conversion task panicked: {e}"),
    };

    error!(job_id, error = %failure, "Conversion job failed unexpectedly");
    if let Err(e) = inner.store.mark_failed(job_id, &failure) {
        warn!(job_id, error = %e, "Could not record job failure");
    }
}

async fn convert_one(
    inner: &WorkerInner,
    encoder: &Path,
    job: &JobDescriptor,
) -> Result<(), WorkerError> {
    let job_id = job.job_id;

    if let Err(e) = inner.store.mark_converting(job_id) {
        warn!(job_id, error = %e, "Skipping job that is no longer pending");
        return Ok(());
    }

    info!(job_id, source = %job.source_path.display(), "Converting");
    let started = Instant::now();

    match encode::convert(
        encoder,
        &job.source_path,
        &job.output_dir,
        inner.settings.convert_timeout,
    )
    .await
    {
        Ok(output) => {
            let size_mb = std::fs::metadata(&output)
                .map(|m| size_in_mb(m.len()))
                .unwrap_or(0.0);
            inner.store.mark_done(job_id, &output, size_mb)?;
            info!(
                job_id,
                output = %output.display(),
                size_mb,
                elapsed_secs = started.elapsed().as_secs_f64(),
                "Conversion finished"
            );
            archive_converted(&inner.store, job_id, &job.source_path);
        }
        Err(e) => {
            warn!(
                job_id,
                error = %e,
                elapsed_secs = started.elapsed().as_secs_f64(),
                "Conversion failed"
            );
            inner.store.mark_failed(job_id, &e.to_string())?;
        }
    }

    Ok(())
}

/// Move the converted source into the archive. Failures only warn; the job stays done.
fn archive_converted(store: &JobStore, job_id: i64, source: &Path) {
    let download_id = match store.get(job_id) {
        Ok(job) => job.and_then(|j| j.download_id),
        Err(e) => {
            warn!(job_id, error = %e, "Could not load job before archiving");
            None
        }
    };

    match archive_source(source) {
        Ok(archived) => {
            if let Err(e) = store.relocate_source(job_id, download_id, &archived) {
                warn!(job_id, error = %e, "Archived source but could not record new path");
            } else {
                debug!(job_id, archived = %archived.display(), "Archived source");
            }
        }
        Err(e) => warn!(job_id, source = %source.display(), error = %e, "Could not archive source"),
    }
}
