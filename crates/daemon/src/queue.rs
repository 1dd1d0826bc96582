//! FIFO conversion queue shared by producers and the single worker consumer.
//!
//! Producers push from any thread without blocking. The consumer side is an
//! async receiver behind a mutex; the worker holds that lock for the lifetime
//! of its consumer loop, so at most one consumer ever pops.
//!
//! Membership is tracked by job id: a job already waiting in the queue is
//! never pushed a second time.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Transient work item describing one queued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub job_id: i64,
    pub source_path: PathBuf,
    pub output_dir: PathBuf,
}

/// Item carried by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QueueItem {
    Job(JobDescriptor),
    /// Stop request addressed to the consumer started as `generation`.
    Stop { generation: u64 },
}

pub(crate) type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueItem>>>;

/// Multi-producer, single-consumer job queue.
pub struct ConversionQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
    rx: SharedReceiver,
    queued: Mutex<HashSet<i64>>,
}

impl Default for ConversionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            queued: Mutex::new(HashSet::new()),
        }
    }

    /// Append a job. Returns `false` if the job is already waiting in the queue.
    pub fn push(&self, job: JobDescriptor) -> bool {
        let mut queued = self.queued.lock().unwrap_or_else(|e| e.into_inner());
        if !queued.insert(job.job_id) {
            return false;
        }
        if self.tx.send(QueueItem::Job(job.clone())).is_err() {
            queued.remove(&job.job_id);
            return false;
        }
        true
    }

    pub(crate) fn push_stop(&self, generation: u64) {
        // The receiver lives as long as the queue, so this cannot fail.
        let _ = self.tx.send(QueueItem::Stop { generation });
    }

    /// Called by the consumer once it owns a popped job.
    pub(crate) fn mark_popped(&self, job_id: i64) {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
    }

    pub(crate) fn receiver(&self) -> SharedReceiver {
        Arc::clone(&self.rx)
    }

    /// Number of jobs waiting (stop requests are not counted).
    pub fn len(&self) -> usize {
        self.queued.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
