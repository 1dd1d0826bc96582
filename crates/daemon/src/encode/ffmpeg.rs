//! ffmpeg-backed conversion to 16-bit big-endian PCM AIFF.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Extension of every produced file.
pub const TARGET_EXTENSION: &str = "aiff";

/// Sources with these extensions are already AIFF and are copied as-is.
const PASSTHROUGH_EXTENSIONS: &[&str] = &["aiff", "aif"];

const AUDIO_CODEC: &str = "pcm_s16be";
const CONTAINER_FORMAT: &str = "aiff";

/// Maximum characters of encoder diagnostics kept on failure.
pub const STDERR_TAIL_CHARS: usize = 500;

/// Default wall-clock limit for one conversion.
pub const DEFAULT_CONVERT_TIMEOUT: Duration = Duration::from_secs(600);

/// Error type for conversion operations
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("source file not found: {0}")]
    SourceMissing(PathBuf),

    #[error("cannot create output folder {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Encoder exited unsuccessfully; carries the tail of its diagnostics.
    #[error("{}", failure_message(.code, .stderr))]
    Failed { code: Option<i32>, stderr: String },

    #[error("conversion timed out ({} min limit)", limit_minutes(.limit))]
    TimedOut { limit: Duration },

    #[error("failed to copy AIFF source: {0}")]
    Copy(#[source] std::io::Error),

    #[error("failed to run encoder: {0}")]
    Io(#[from] std::io::Error),
}

fn limit_minutes(limit: &Duration) -> u64 {
    limit.as_secs() / 60
}

fn failure_message(code: &Option<i32>, stderr: &str) -> String {
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    match code {
        Some(code) => format!("encoder exited with code {code}"),
        None => "encoder was terminated by a signal".to_string(),
    }
}

/// Whether `path` is already in the target format.
pub fn is_target_format(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| PASSTHROUGH_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// First free path `<dir>/<stem>.<ext>`, then `<stem>_1.<ext>`, `<stem>_2.<ext>`, ...
pub fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.{ext}"));
    if !candidate.exists() {
        return candidate;
    }
    (1u32..)
        .map(|n| dir.join(format!("{stem}_{n}.{ext}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

/// Output path for `source` inside `output_dir`, never overwriting an existing file.
pub fn unique_output_path(source: &Path, output_dir: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    unique_path(output_dir, &stem, TARGET_EXTENSION)
}

/// Build the ffmpeg command for one conversion.
///
/// `-y` is passed because the output path was chosen to be free; a file
/// appearing there in the meantime is overwritten rather than hanging on a prompt.
pub fn build_ffmpeg_command(encoder: &Path, input: &Path, output: &Path) -> std::process::Command {
    let mut cmd = std::process::Command::new(encoder);

    cmd.arg("-i").arg(input);
    cmd.arg("-c:a").arg(AUDIO_CODEC);
    cmd.arg("-f").arg(CONTAINER_FORMAT);
    cmd.arg("-y");
    cmd.arg(output);

    cmd
}

/// Keep the last [`STDERR_TAIL_CHARS`] characters of encoder diagnostics.
pub fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let count = text.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return text.to_string();
    }
    text.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

/// Convert `source` into a new AIFF file inside `output_dir`.
///
/// AIFF sources are copied byte-for-byte. On any failure the partially
/// written output is removed.
pub async fn convert(
    encoder: &Path,
    source: &Path,
    output_dir: &Path,
    limit: Duration,
) -> Result<PathBuf, EncodeError> {
    if !source.is_file() {
        return Err(EncodeError::SourceMissing(source.to_path_buf()));
    }

    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|source| EncodeError::OutputDir {
            path: output_dir.to_path_buf(),
            source,
        })?;

    let output = unique_output_path(source, output_dir);

    if is_target_format(source) {
        debug!(source = %source.display(), output = %output.display(), "Source is already AIFF, copying");
        if let Err(e) = tokio::fs::copy(source, &output).await {
            remove_partial(&output).await;
            return Err(EncodeError::Copy(e));
        }
        return Ok(output);
    }

    let mut cmd = Command::from(build_ffmpeg_command(encoder, source, &output));
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(source = %source.display(), output = %output.display(), "Running encoder");

    let child = cmd.spawn()?;

    // Dropping the wait future on timeout kills the child (kill_on_drop).
    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(result)) if result.status.success() => Ok(output),
        Ok(Ok(result)) => {
            remove_partial(&output).await;
            Err(EncodeError::Failed {
                code: result.status.code(),
                stderr: stderr_tail(&result.stderr),
            })
        }
        Ok(Err(e)) => {
            remove_partial(&output).await;
            Err(EncodeError::Io(e))
        }
        Err(_) => {
            remove_partial(&output).await;
            Err(EncodeError::TimedOut { limit })
        }
    }
}

async fn remove_partial(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => debug!(output = %output.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(output = %output.display(), error = %e, "Failed to remove partial output"),
    }
}
