//! Locating a working ffmpeg binary.
//!
//! Candidates are probed in order with `-version`; the first one that exits
//! successfully within the probe timeout wins.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

/// Name of the encoder executable looked up on the search path.
#[cfg(windows)]
pub const ENCODER_COMMAND: &str = "ffmpeg.exe";
#[cfg(not(windows))]
pub const ENCODER_COMMAND: &str = "ffmpeg";

/// Default time allowed for a `-version` probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A probed, working encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub path: PathBuf,
    /// Version token reported by `-version`, if it could be parsed.
    pub version: Option<String>,
}

/// Ordered list of encoder candidates.
///
/// An explicitly configured binary comes first, then the bare command name
/// (resolved through `PATH`), then well-known install locations.
pub fn encoder_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(path.to_path_buf());
    }
    candidates.push(PathBuf::from(ENCODER_COMMAND));
    candidates.extend(platform_candidates());
    candidates
}

#[cfg(windows)]
fn platform_candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(r"C:\ProgramData\chocolatey\bin\ffmpeg.exe")];
    if let Some(local) = std::env::var_os("LOCALAPPDATA") {
        paths.push(
            PathBuf::from(local)
                .join("Microsoft")
                .join("WinGet")
                .join("Links")
                .join("ffmpeg.exe"),
        );
    }
    paths
}

#[cfg(target_os = "macos")]
fn platform_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/opt/homebrew/bin/ffmpeg"),
        PathBuf::from("/usr/local/bin/ffmpeg"),
    ]
}

#[cfg(not(any(windows, target_os = "macos")))]
fn platform_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/bin/ffmpeg"),
        PathBuf::from("/usr/local/bin/ffmpeg"),
    ]
}

/// Run `<candidate> -version` and report whether it works.
pub async fn probe_encoder(candidate: &Path, probe_timeout: Duration) -> Option<EncoderInfo> {
    let child = Command::new(candidate)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            debug!(candidate = %candidate.display(), error = %e, "Encoder candidate not runnable");
            return None;
        }
    };

    match timeout(probe_timeout, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => Some(EncoderInfo {
            path: candidate.to_path_buf(),
            version: parse_ffmpeg_version(&String::from_utf8_lossy(&output.stdout)),
        }),
        Ok(Ok(output)) => {
            debug!(candidate = %candidate.display(), status = %output.status, "Encoder probe failed");
            None
        }
        Ok(Err(e)) => {
            debug!(candidate = %candidate.display(), error = %e, "Encoder probe failed");
            None
        }
        Err(_) => {
            debug!(candidate = %candidate.display(), "Encoder probe timed out");
            None
        }
    }
}

/// Probe `candidates` in order and return the first working encoder.
pub async fn locate_encoder(candidates: &[PathBuf], probe_timeout: Duration) -> Option<EncoderInfo> {
    for candidate in candidates {
        if let Some(info) = probe_encoder(candidate, probe_timeout).await {
            info!(
                path = %info.path.display(),
                version = info.version.as_deref().unwrap_or("unknown"),
                "Found encoder"
            );
            return Some(info);
        }
    }
    None
}

/// Extract the version token from `ffmpeg -version` output.
///
/// Handles both release (`ffmpeg version 7.1 ...`) and git builds
/// (`ffmpeg version n8.0-3-g1234 ...`).
pub fn parse_ffmpeg_version(version_output: &str) -> Option<String> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let token = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let token = token.strip_prefix('n').unwrap_or(&token);
    if token.starts_with(|c: char| c.is_ascii_digit()) {
        Some(token.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing(
            major in 2u32..20,
            minor in 0u32..10,
            prefixed in any::<bool>(),
        ) {
            let prefix = if prefixed { "n" } else { "" };
            let output = format!(
                "ffmpeg version {prefix}{major}.{minor} Copyright (c) 2000-2025 the FFmpeg developers\nbuilt with gcc 13"
            );
            prop_assert_eq!(parse_ffmpeg_version(&output), Some(format!("{major}.{minor}")));
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_git_build() {
        let output = "ffmpeg version n8.0-3-gabcdef Copyright (c) 2000-2025";
        assert_eq!(parse_ffmpeg_version(output), Some("8.0-3-gabcdef".to_string()));
    }

    #[test]
    fn test_parse_ffmpeg_version_multiline() {
        let output = "some banner\nffmpeg version 6.1.1 Copyright\nconfiguration: --enable-gpl";
        assert_eq!(parse_ffmpeg_version(output), Some("6.1.1".to_string()));
    }

    #[test]
    fn test_parse_ffmpeg_version_invalid() {
        assert_eq!(parse_ffmpeg_version(""), None);
        assert_eq!(parse_ffmpeg_version("lame 3.100"), None);
        assert_eq!(parse_ffmpeg_version("ffmpeg version git-master"), None);
    }

    #[test]
    fn test_candidates_order() {
        let explicit = PathBuf::from("/opt/tools/ffmpeg");
        let candidates = encoder_candidates(Some(&explicit));
        assert_eq!(candidates[0], explicit);
        assert_eq!(candidates[1], PathBuf::from(ENCODER_COMMAND));
        assert!(candidates.len() > 2);
    }

    #[test]
    fn test_candidates_ignore_empty_explicit_path() {
        let candidates = encoder_candidates(Some(Path::new("")));
        assert_eq!(candidates[0], PathBuf::from(ENCODER_COMMAND));
        assert_eq!(candidates, encoder_candidates(None));
    }

    #[tokio::test]
    async fn test_locate_encoder_missing_binary() {
        let candidates = vec![PathBuf::from("/nonexistent/bin/ffmpeg-does-not-exist")];
        assert!(locate_encoder(&candidates, DEFAULT_PROBE_TIMEOUT).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_locate_encoder_skips_broken_candidates() {
        use crate::encode::test_support::fake_encoder;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let good = fake_encoder(temp_dir.path());
        let broken = temp_dir.path().join("broken.sh");
        std::fs::write(&broken, "#!/bin/sh\nexit 3\n").unwrap();
        crate::encode::test_support::make_executable(&broken);

        let candidates = vec![PathBuf::from("/nonexistent/ffmpeg"), broken, good.clone()];
        let info = locate_encoder(&candidates, DEFAULT_PROBE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(info.path, good);
        assert_eq!(info.version.as_deref(), Some("7.1-fake"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_times_out_on_hanging_binary() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let hanging = temp_dir.path().join("hang.sh");
        std::fs::write(&hanging, "#!/bin/sh\nsleep 10\n").unwrap();
        crate::encode::test_support::make_executable(&hanging);

        let started = std::time::Instant::now();
        assert!(probe_encoder(&hanging, Duration::from_millis(300)).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
