//! Scanner module for discovering audio files in the watch folder.
//!
//! Only the top level of the folder is considered. Subfolders (including the
//! `_converted` archive) are never descended into.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Audio file extensions accepted by the watcher (case-insensitive, without dot).
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "wav", "aiff", "aif", "ogg", "m4a", "wma", "alac",
];

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// An audio file discovered in the watch folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFile {
    /// File name including extension.
    pub filename: String,
    /// Full path to the file.
    pub filepath: PathBuf,
    /// Lowercase extension without the dot.
    pub extension: String,
    /// Size in MB, rounded to two decimals.
    pub size_mb: f64,
}

impl AudioFile {
    /// Build a descriptor for `path`, or `None` if it is not an audio file.
    ///
    /// The size is read from disk; a file that vanished reports 0.
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = audio_extension(path)?;
        let filename = path.file_name()?.to_string_lossy().into_owned();
        let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        Some(Self {
            filename,
            filepath: path.to_path_buf(),
            extension,
            size_mb: size_in_mb(size_bytes),
        })
    }
}

/// Returns the lowercase extension of `path` if it is an accepted audio extension.
pub fn audio_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    AUDIO_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Checks if a file has an audio extension (case-insensitive).
pub fn is_audio_file(path: &Path) -> bool {
    audio_extension(path).is_some()
}

/// Convert a byte count to MB rounded to two decimals.
pub fn size_in_mb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0
}

/// List audio files directly inside `dir`, sorted by file name.
///
/// Returns an empty list when `dir` does not exist or is not a directory.
pub fn scan_existing(dir: &Path) -> Vec<AudioFile> {
    use walkdir::WalkDir;

    if !dir.is_dir() {
        return Vec::new();
    }

    let mut files: Vec<AudioFile> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| AudioFile::from_path(entry.path()))
        .collect();

    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    files
}
