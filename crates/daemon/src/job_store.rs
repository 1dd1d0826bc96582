//! SQLite-backed persistence for download records and conversion jobs.
//!
//! Every mutation is a single statement or a transaction on one connection
//! guarded by a mutex, so concurrent readers never observe a torn row.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use crate::jobs::{ConversionJob, ConversionStats, DownloadRecord, JobStatus};
use crate::scan::AudioFile;

/// Maximum number of characters of error text stored on a failed job.
pub const MAX_ERROR_CHARS: usize = 1000;

/// Default cap for job listings.
pub const DEFAULT_LIST_LIMIT: usize = 500;

/// Errors that can occur in the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("job {0} not found")]
    NotFound(i64),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {job_id} cannot start converting while job {active} is converting")]
    AlreadyConverting { job_id: i64, active: i64 },

    #[error("job {job_id} is {status}, only failed jobs can be retried")]
    RetryRejected { job_id: i64, status: JobStatus },

    #[error("job {job_id} cannot be retried, job {existing} already covers its source")]
    RetrySuperseded { job_id: i64, existing: i64 },

    #[error("job store lock poisoned")]
    LockPoisoned,
}

/// Result of [`JobStore::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new pending job was inserted.
    Created(i64),
    /// A pending, converting or done job already exists for the source path.
    Existing { id: i64, status: JobStatus },
}

impl CreateOutcome {
    pub fn id(&self) -> i64 {
        match self {
            CreateOutcome::Created(id) => *id,
            CreateOutcome::Existing { id, .. } => *id,
        }
    }
}

const JOB_COLUMNS: &str = "id, download_id, source_path, source_ext, output_path, status, \
                           error_msg, size_mb, created_at, started_at, finished_at";

const DOWNLOAD_COLUMNS: &str = "id, filename, filepath, extension, size_mb, detected_at";

/// Durable job store.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Open (or create) the database file at `path` and initialize the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            // Connection::open reports a missing parent as a generic CANTOPEN.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        Self::initialize_schema(&conn)?;
        debug!(path = %path.display(), "Opened job store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL,
                filepath TEXT NOT NULL,
                extension TEXT DEFAULT '',
                size_mb REAL DEFAULT 0,
                detected_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_detected ON downloads(detected_at);
            CREATE INDEX IF NOT EXISTS idx_downloads_filepath ON downloads(filepath);

            CREATE TABLE IF NOT EXISTS conversions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                download_id INTEGER REFERENCES downloads(id) ON DELETE SET NULL,
                source_path TEXT NOT NULL,
                output_path TEXT DEFAULT '',
                source_ext TEXT DEFAULT '',
                status TEXT DEFAULT 'pending'
                    CHECK(status IN ('pending','converting','done','failed','skipped')),
                error_msg TEXT DEFAULT '',
                size_mb REAL DEFAULT 0,
                started_at TEXT,
                finished_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversions_status ON conversions(status);
            CREATE INDEX IF NOT EXISTS idx_conversions_source ON conversions(source_path);
            "#,
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    // ------------------------------------------------------------------
    // Conversion jobs
    // ------------------------------------------------------------------

    /// Create a pending job for `source_path`.
    ///
    /// If a pending, converting or done job already exists for the same path,
    /// no row is inserted and the existing job is returned instead.
    pub fn create(
        &self,
        source_path: &Path,
        source_ext: &str,
        download_id: Option<i64>,
    ) -> Result<CreateOutcome, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let source = path_to_text(source_path);

        let existing = {
            let mut stmt =
                tx.prepare("SELECT id, status FROM conversions WHERE source_path = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![source], |row| {
                Ok((row.get::<_, i64>(0)?, parse_status(1, &row.get::<_, String>(1)?)?))
            })?;
            let mut blocking = None;
            for row in rows {
                let (id, status) = row?;
                if status.blocks_duplicates() {
                    blocking = Some((id, status));
                    break;
                }
            }
            blocking
        };

        if let Some((id, status)) = existing {
            tx.commit()?;
            return Ok(CreateOutcome::Existing { id, status });
        }

        tx.execute(
            "INSERT INTO conversions (download_id, source_path, source_ext, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![
                download_id,
                source,
                source_ext.to_lowercase(),
                now_rfc3339()
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(CreateOutcome::Created(id))
    }

    /// Move a pending job to `converting` and stamp its start time.
    ///
    /// Refused while another job is converting.
    pub fn mark_converting(&self, job_id: i64) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        Self::guard_transition(&tx, job_id, JobStatus::Converting)?;

        let active: Option<i64> = tx
            .query_row(
                "SELECT id FROM conversions WHERE status = 'converting' AND id != ?1 LIMIT 1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(active) = active {
            return Err(StoreError::AlreadyConverting { job_id, active });
        }

        tx.execute(
            "UPDATE conversions SET status = 'converting', started_at = ?2 WHERE id = ?1",
            params![job_id, now_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record a successful conversion.
    pub fn mark_done(
        &self,
        job_id: i64,
        output_path: &Path,
        size_mb: f64,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        Self::guard_transition(&tx, job_id, JobStatus::Done)?;
        tx.execute(
            "UPDATE conversions
             SET status = 'done', output_path = ?2, size_mb = ?3, error_msg = '', finished_at = ?4
             WHERE id = ?1",
            params![job_id, path_to_text(output_path), size_mb, now_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record a failed conversion. The error text is truncated to [`MAX_ERROR_CHARS`].
    pub fn mark_failed(&self, job_id: i64, error: &str) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        Self::guard_transition(&tx, job_id, JobStatus::Failed)?;
        tx.execute(
            "UPDATE conversions SET status = 'failed', error_msg = ?2, finished_at = ?3
             WHERE id = ?1",
            params![job_id, truncate_chars(error, MAX_ERROR_CHARS), now_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Reset a failed job to pending, clearing its error and timestamps.
    pub fn retry(&self, job_id: i64) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let status = Self::status_of(&tx, job_id)?.ok_or(StoreError::NotFound(job_id))?;
        if !status.can_transition_to(JobStatus::Pending) {
            return Err(StoreError::RetryRejected { job_id, status });
        }

        let existing: Option<i64> = tx
            .query_row(
                "SELECT other.id FROM conversions AS job
                 JOIN conversions AS other
                   ON other.source_path = job.source_path AND other.id != job.id
                 WHERE job.id = ?1 AND other.status IN ('pending', 'converting', 'done')
                 ORDER BY other.id LIMIT 1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            return Err(StoreError::RetrySuperseded { job_id, existing });
        }
        tx.execute(
            "UPDATE conversions
             SET status = 'pending', error_msg = '', started_at = NULL, finished_at = NULL
             WHERE id = ?1",
            params![job_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Put an unfinished (pending or converting) job back to pending.
    ///
    /// Used by startup recovery for jobs interrupted by a crash.
    pub fn reset_to_pending(&self, job_id: i64) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let from = Self::status_of(&tx, job_id)?.ok_or(StoreError::NotFound(job_id))?;
        if !from.is_active() {
            return Err(StoreError::InvalidTransition {
                job_id,
                from,
                to: JobStatus::Pending,
            });
        }
        tx.execute(
            "UPDATE conversions SET status = 'pending', started_at = NULL, finished_at = NULL
             WHERE id = ?1",
            params![job_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Point a job (and its download record) at the file's new location.
    ///
    /// The download row is matched by `download_id` when known, otherwise by
    /// the job's previous source path.
    pub fn relocate_source(
        &self,
        job_id: i64,
        download_id: Option<i64>,
        new_path: &Path,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let new_text = path_to_text(new_path);

        let old_source: String = tx
            .query_row(
                "SELECT source_path FROM conversions WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound(job_id))?;

        match download_id {
            Some(download_id) => tx.execute(
                "UPDATE downloads SET filepath = ?2 WHERE id = ?1",
                params![download_id, new_text],
            )?,
            None => tx.execute(
                "UPDATE downloads SET filepath = ?2 WHERE filepath = ?1",
                params![old_source, new_text],
            )?,
        };
        tx.execute(
            "UPDATE conversions SET source_path = ?2 WHERE id = ?1",
            params![job_id, new_text],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, job_id: i64) -> Result<Option<ConversionJob>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM conversions WHERE id = ?1");
        Ok(conn.query_row(&sql, params![job_id], job_from_row).optional()?)
    }

    /// All pending jobs, oldest first.
    pub fn list_pending(&self) -> Result<Vec<ConversionJob>, StoreError> {
        self.list_where("status = 'pending'", "id ASC", None)
    }

    /// All converting jobs, oldest first.
    pub fn list_converting(&self) -> Result<Vec<ConversionJob>, StoreError> {
        self.list_where("status = 'converting'", "id ASC", None)
    }

    /// Pending and converting jobs, oldest first.
    pub fn list_unfinished(&self) -> Result<Vec<ConversionJob>, StoreError> {
        self.list_where("status IN ('pending', 'converting')", "id ASC", None)
    }

    /// Most recent jobs, newest first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<ConversionJob>, StoreError> {
        self.list_where("1 = 1", "id DESC", Some(limit))
    }

    fn list_where(
        &self,
        filter: &str,
        order: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ConversionJob>, StoreError> {
        let conn = self.lock()?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let sql =
            format!("SELECT {JOB_COLUMNS} FROM conversions WHERE {filter} ORDER BY {order} LIMIT ?1");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit], job_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Job counts per status; statuses without jobs report zero.
    pub fn stats(&self) -> Result<ConversionStats, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM conversions GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = ConversionStats::default();
        for row in rows {
            let (status, count) = row?;
            stats.add(parse_status(0, &status)?, count.max(0) as u64);
        }
        Ok(stats)
    }

    fn status_of(conn: &Connection, job_id: i64) -> Result<Option<JobStatus>, StoreError> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM conversions WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.map(|s| parse_status(0, &s)).transpose()?)
    }

    /// Current status of `job_id`, if it may move to `to`.
    fn guard_transition(
        conn: &Connection,
        job_id: i64,
        to: JobStatus,
    ) -> Result<JobStatus, StoreError> {
        let from = Self::status_of(conn, job_id)?.ok_or(StoreError::NotFound(job_id))?;
        if from.can_transition_to(to) {
            Ok(from)
        } else {
            Err(StoreError::InvalidTransition { job_id, from, to })
        }
    }

    // ------------------------------------------------------------------
    // Download records
    // ------------------------------------------------------------------

    /// Register a file seen in the watch folder.
    pub fn insert_download(&self, file: &AudioFile) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO downloads (filename, filepath, extension, size_mb, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                file.filename,
                path_to_text(&file.filepath),
                file.extension,
                file.size_mb,
                now_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Register `file` unless a download with the same path already exists.
    ///
    /// Returns the new id, or `None` when the path was already known.
    pub fn register_download(&self, file: &AudioFile) -> Result<Option<i64>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let known = tx
            .query_row(
                "SELECT 1 FROM downloads WHERE filepath = ?1 LIMIT 1",
                params![path_to_text(&file.filepath)],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if known {
            tx.commit()?;
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO downloads (filename, filepath, extension, size_mb, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                file.filename,
                path_to_text(&file.filepath),
                file.extension,
                file.size_mb,
                now_rfc3339()
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Some(id))
    }

    pub fn find_download_by_path(&self, path: &Path) -> Result<Option<DownloadRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM downloads WHERE filepath = ?1 ORDER BY id LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, params![path_to_text(path)], download_from_row)
            .optional()?)
    }

    pub fn get_download(&self, download_id: i64) -> Result<Option<DownloadRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {DOWNLOAD_COLUMNS} FROM downloads WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![download_id], download_from_row)
            .optional()?)
    }

    /// Most recently detected downloads, newest first.
    pub fn list_downloads(&self, limit: usize) -> Result<Vec<DownloadRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {DOWNLOAD_COLUMNS} FROM downloads ORDER BY id DESC LIMIT ?1");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], download_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn path_to_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_timestamp(column: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_status(column: usize, text: &str) -> rusqlite::Result<JobStatus> {
    text.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Truncate `text` to at most `max` characters without splitting a code point.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.filter(|s| !s.is_empty())
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ConversionJob> {
    let status: String = row.get(5)?;
    let created_at: String = row.get(8)?;
    let started_at: Option<String> = row.get(9)?;
    let finished_at: Option<String> = row.get(10)?;
    let output_path: Option<String> = row.get(4)?;
    let source_ext: Option<String> = row.get(3)?;

    Ok(ConversionJob {
        id: row.get(0)?,
        download_id: row.get(1)?,
        source_path: PathBuf::from(row.get::<_, String>(2)?),
        source_ext: source_ext.unwrap_or_default(),
        output_path: non_empty(output_path).map(PathBuf::from),
        status: parse_status(5, &status)?,
        error_message: non_empty(row.get(6)?),
        size_mb: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
        created_at: parse_timestamp(8, &created_at)?,
        started_at: started_at
            .as_deref()
            .map(|t| parse_timestamp(9, t))
            .transpose()?,
        finished_at: finished_at
            .as_deref()
            .map(|t| parse_timestamp(10, t))
            .transpose()?,
    })
}

fn download_from_row(row: &Row<'_>) -> rusqlite::Result<DownloadRecord> {
    let detected_at: String = row.get(5)?;
    let extension: Option<String> = row.get(3)?;
    Ok(DownloadRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        filepath: PathBuf::from(row.get::<_, String>(2)?),
        extension: extension.unwrap_or_default(),
        size_mb: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
        detected_at: parse_timestamp(5, &detected_at)?,
    })
}
