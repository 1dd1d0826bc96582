//! Moving converted sources into the `_converted` archive folder.
//!
//! The archive sits next to the source, so a converted file leaves the top
//! level of the watch folder and is never scanned again.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::encode::unique_path;

/// Name of the archive subfolder created next to each converted source.
pub const ARCHIVE_DIR_NAME: &str = "_converted";

/// Errors that can occur while archiving a source file.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("source file not found: {0}")]
    SourceMissing(PathBuf),

    #[error("failed to create archive folder {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to move source into archive: {0}")]
    MoveFailed(#[source] std::io::Error),
}

/// Archive folder for a source file: `<source parent>/_converted`.
pub fn archive_dir(source: &Path) -> PathBuf {
    source
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(ARCHIVE_DIR_NAME)
}

/// Move `source` into its archive folder and return the new path.
///
/// An existing archived file with the same name is never overwritten; the
/// moved file gets a `_1`, `_2`, ... suffix instead.
pub fn archive_source(source: &Path) -> Result<PathBuf, ArchiveError> {
    if !source.is_file() {
        return Err(ArchiveError::SourceMissing(source.to_path_buf()));
    }

    let dir = archive_dir(source);
    fs::create_dir_all(&dir).map_err(|e| ArchiveError::CreateDir {
        path: dir.clone(),
        source: e,
    })?;

    let destination = archive_destination(source, &dir);

    // Try to rename first (same filesystem), fall back to copy + remove
    if fs::rename(source, &destination).is_err() {
        fs::copy(source, &destination).map_err(ArchiveError::MoveFailed)?;
        if let Err(e) = fs::remove_file(source) {
            // Keep exactly one copy: drop the archived duplicate.
            let _ = fs::remove_file(&destination);
            return Err(ArchiveError::MoveFailed(e));
        }
    }

    Ok(destination)
}

fn archive_destination(source: &Path, dir: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match source.extension() {
        Some(ext) => unique_path(dir, &stem, &ext.to_string_lossy()),
        None => {
            let candidate = dir.join(&stem);
            if candidate.exists() {
                (1u32..)
                    .map(|n| dir.join(format!("{stem}_{n}")))
                    .find(|p| !p.exists())
                    .unwrap_or(candidate)
            } else {
                candidate
            }
        }
    }
}
