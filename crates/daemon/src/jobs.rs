//! Conversion job and download record types.
//!
//! A [`ConversionJob`] moves through a small state machine:
//! `pending -> converting -> done | failed`, with `failed -> pending` on retry
//! and `converting -> pending` only during startup recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Status of a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting to be picked up by the worker.
    Pending,
    /// Job is currently being converted.
    Converting,
    /// Conversion finished and the output file exists.
    Done,
    /// Conversion failed; the error text is recorded on the job.
    Failed,
    /// Job was skipped. Never produced by the worker, kept for schema compatibility.
    Skipped,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Converting,
        JobStatus::Done,
        JobStatus::Failed,
        JobStatus::Skipped,
    ];

    /// Column value stored in the job store.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Converting => "converting",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }

    /// Check if the job is active (pending or converting).
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Converting)
    }

    /// Statuses that block a new job for the same source path.
    ///
    /// A `done` job still counts: converting the same file twice would only
    /// produce a `_1` copy of the same output.
    pub fn blocks_duplicates(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Converting | JobStatus::Done
        )
    }

    /// Whether the worker or a manual action may move a job from `self` to `next`.
    ///
    /// Startup recovery (`converting -> pending`) is not listed; the store
    /// handles it in `reset_to_pending`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Converting)
                | (JobStatus::Converting, JobStatus::Done)
                | (JobStatus::Converting, JobStatus::Failed)
                | (JobStatus::Failed, JobStatus::Pending)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status column holds an unknown value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown job status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// One unit of work: convert a source file to AIFF.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionJob {
    pub id: i64,
    /// Download record this job was created for, if any.
    pub download_id: Option<i64>,
    /// Current location of the source file (rewritten after archiving).
    pub source_path: PathBuf,
    /// Lowercase source extension without the dot.
    pub source_ext: String,
    /// Output file, set once the job is done.
    pub output_path: Option<PathBuf>,
    pub status: JobStatus,
    /// Encoder diagnostics, set once the job failed.
    pub error_message: Option<String>,
    /// Output size in MB (two decimals).
    pub size_mb: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One physical file observed in the watch folder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadRecord {
    pub id: i64,
    pub filename: String,
    pub filepath: PathBuf,
    pub extension: String,
    pub size_mb: f64,
    pub detected_at: DateTime<Utc>,
}

/// Job counts grouped by status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionStats {
    pub pending: u64,
    pub converting: u64,
    pub done: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl ConversionStats {
    /// Add `count` jobs with the given status.
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Converting => self.converting += count,
            JobStatus::Done => self.done += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Skipped => self.skipped += count,
        }
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Converting => self.converting,
            JobStatus::Done => self.done,
            JobStatus::Failed => self.failed,
            JobStatus::Skipped => self.skipped,
        }
    }

    pub fn total(&self) -> u64 {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}
