//! Service status snapshot with JSON serialization support.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::jobs::ConversionStats;

/// Point-in-time view of the watcher, worker and job counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceStatus {
    pub timestamp: DateTime<Utc>,
    pub watcher_active: bool,
    pub watch_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub auto_convert: bool,
    pub worker_running: bool,
    pub encoder_path: Option<PathBuf>,
    pub encoder_version: Option<String>,
    pub current_job: Option<i64>,
    pub queue_size: usize,
    pub stats: ConversionStats,
}

impl ServiceStatus {
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Result of a manual scan of the watch folder.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanSummary {
    /// Audio files found in the folder.
    pub scanned: usize,
    /// Files not seen before, now registered as downloads.
    pub added: usize,
    /// Jobs queued for the newly registered files.
    pub queued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;

    #[test]
    fn test_status_json_shape() {
        let mut stats = ConversionStats::default();
        stats.add(JobStatus::Done, 3);
        let status = ServiceStatus {
            timestamp: Utc::now(),
            watcher_active: true,
            watch_path: Some(PathBuf::from("/drop")),
            output_path: Some(PathBuf::from("/out")),
            auto_convert: true,
            worker_running: false,
            encoder_path: None,
            encoder_version: None,
            current_job: None,
            queue_size: 2,
            stats,
        };

        let json: serde_json::Value =
            serde_json::from_str(&status.to_json_pretty().unwrap()).unwrap();
        assert_eq!(json["watcher_active"], true);
        assert_eq!(json["watch_path"], "/drop");
        assert_eq!(json["queue_size"], 2);
        assert_eq!(json["stats"]["done"], 3);
        assert!(json["encoder_path"].is_null());

        let back: ServiceStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }
}
