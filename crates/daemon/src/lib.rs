//! AIFF Drop Daemon
//!
//! Background service that watches a drop folder for audio files, records them
//! in a job store and converts them to AIFF with ffmpeg, one at a time.

pub mod archive;
pub mod daemon;
pub mod encode;
pub mod job_store;
pub mod jobs;
pub mod logging;
pub mod queue;
pub mod scan;
pub mod stability;
pub mod status;
pub mod watcher;
pub mod worker;

pub use aiff_drop_daemon_config as config;
pub use aiff_drop_daemon_config::Config;
pub use archive::{archive_source, ArchiveError, ARCHIVE_DIR_NAME};
pub use daemon::{Daemon, DaemonError};
pub use encode::{convert, locate_encoder, EncodeError, EncoderInfo};
pub use job_store::{CreateOutcome, JobStore, StoreError};
pub use jobs::{ConversionJob, ConversionStats, DownloadRecord, JobStatus};
pub use logging::{init_logging, LoggingError};
pub use queue::{ConversionQueue, JobDescriptor};
pub use scan::{is_audio_file, scan_existing, AudioFile, AUDIO_EXTENSIONS};
pub use stability::{StabilityPolicy, StabilityResult};
pub use status::{ScanSummary, ServiceStatus};
pub use watcher::{FolderWatcher, WatchError};
pub use worker::{ConversionWorker, WorkerError, WorkerSettings};
