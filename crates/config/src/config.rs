//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// TOML serialization error
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

/// Watch/output folder settings.
///
/// This is the part of the configuration that may change at runtime; the
/// daemon restarts its watcher and worker when it is re-applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FolderSettings {
    /// Directory watched for newly downloaded audio files
    #[serde(default)]
    pub watch_folder: Option<PathBuf>,
    /// Directory receiving converted AIFF files
    #[serde(default)]
    pub output_folder: Option<PathBuf>,
    /// Automatically enqueue newly detected files (default true)
    #[serde(default = "default_auto_convert")]
    pub auto_convert: bool,
}

fn default_auto_convert() -> bool {
    true
}

impl Default for FolderSettings {
    fn default() -> Self {
        Self {
            watch_folder: None,
            output_folder: None,
            auto_convert: default_auto_convert(),
        }
    }
}

impl FolderSettings {
    /// Configured watch folder, treating an empty path as unset.
    pub fn watch_folder(&self) -> Option<&Path> {
        non_empty(self.watch_folder.as_deref())
    }

    /// Configured output folder, treating an empty path as unset.
    pub fn output_folder(&self) -> Option<&Path> {
        non_empty(self.output_folder.as_deref())
    }
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Explicit encoder binary; probed before the built-in candidates
    #[serde(default)]
    pub binary: Option<PathBuf>,
    /// Wall-clock limit for a single conversion (default 600)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Limit for the `-version` probe of each candidate (default 5)
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_probe_timeout_secs() -> u64 {
    5
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: None,
            timeout_secs: default_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// Folder watcher stability settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatcherConfig {
    /// Interval between file size samples (default 500ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive unchanged non-zero samples required (default 3)
    #[serde(default = "default_stable_samples")]
    pub stable_samples: u32,
    /// Total time spent waiting for a file to settle (default 30s)
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_stable_samples() -> u32 {
    3
}

fn default_budget_secs() -> u64 {
    30
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stable_samples: default_stable_samples(),
            budget_secs: default_budget_secs(),
        }
    }
}

/// Job store location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// SQLite database file (default `aiff-drop.db`)
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("aiff-drop.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Directory for rolling log files (default `logs`)
    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,
    /// Default filter level when RUST_LOG is not set (default `info`)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub folders: FolderSettings,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Write the configuration back as TOML.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - AIFF_DROP_WATCH_FOLDER -> folders.watch_folder
    /// - AIFF_DROP_OUTPUT_FOLDER -> folders.output_folder
    /// - AIFF_DROP_AUTO_CONVERT -> folders.auto_convert
    /// - AIFF_DROP_ENCODER -> encoder.binary
    /// - AIFF_DROP_ENCODER_TIMEOUT_SECS -> encoder.timeout_secs
    /// - AIFF_DROP_DATABASE -> storage.database_path
    /// - AIFF_DROP_LOG_DIR -> logging.directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("AIFF_DROP_WATCH_FOLDER") {
            self.folders.watch_folder = Some(PathBuf::from(val));
        }

        if let Ok(val) = env::var("AIFF_DROP_OUTPUT_FOLDER") {
            self.folders.output_folder = Some(PathBuf::from(val));
        }

        if let Ok(val) = env::var("AIFF_DROP_AUTO_CONVERT") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.folders.auto_convert = true,
                "false" | "0" | "no" => self.folders.auto_convert = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("AIFF_DROP_ENCODER") {
            if !val.is_empty() {
                self.encoder.binary = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("AIFF_DROP_ENCODER_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.encoder.timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("AIFF_DROP_DATABASE") {
            if !val.is_empty() {
                self.storage.database_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("AIFF_DROP_LOG_DIR") {
            if !val.is_empty() {
                self.logging.directory = PathBuf::from(val);
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(&path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("AIFF_DROP_WATCH_FOLDER");
        env::remove_var("AIFF_DROP_OUTPUT_FOLDER");
        env::remove_var("AIFF_DROP_AUTO_CONVERT");
        env::remove_var("AIFF_DROP_ENCODER");
        env::remove_var("AIFF_DROP_ENCODER_TIMEOUT_SECS");
        env::remove_var("AIFF_DROP_DATABASE");
        env::remove_var("AIFF_DROP_LOG_DIR");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            watch in "[a-z]{1,12}",
            output in "[a-z]{1,12}",
            auto_convert in proptest::bool::ANY,
            timeout in 1u64..10_000,
            interval in 1u64..5_000,
            samples in 1u32..10,
            budget in 1u64..120,
        ) {
            let toml_str = format!(
                r#"
[folders]
watch_folder = "/downloads/{}"
output_folder = "/music/{}"
auto_convert = {}

[encoder]
timeout_secs = {}

[watcher]
poll_interval_ms = {}
stable_samples = {}
budget_secs = {}
"#,
                watch, output, auto_convert, timeout, interval, samples, budget
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.folders.watch_folder, Some(PathBuf::from(format!("/downloads/{}", watch))));
            prop_assert_eq!(config.folders.output_folder, Some(PathBuf::from(format!("/music/{}", output))));
            prop_assert_eq!(config.folders.auto_convert, auto_convert);
            prop_assert_eq!(config.encoder.timeout_secs, timeout);
            prop_assert_eq!(config.watcher.poll_interval_ms, interval);
            prop_assert_eq!(config.watcher.stable_samples, samples);
            prop_assert_eq!(config.watcher.budget_secs, budget);
        }

        #[test]
        fn prop_env_overrides_auto_convert(
            initial in proptest::bool::ANY,
            override_value in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[folders]\nauto_convert = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("AIFF_DROP_AUTO_CONVERT", if override_value { "yes" } else { "0" });
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.folders.auto_convert, override_value);
        }

        #[test]
        fn prop_env_overrides_encoder_timeout(
            initial in 1u64..1000,
            override_secs in 1u64..100_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[encoder]\ntimeout_secs = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("AIFF_DROP_ENCODER_TIMEOUT_SECS", override_secs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.encoder.timeout_secs, override_secs);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.folders.watch_folder, None);
        assert_eq!(config.folders.output_folder, None);
        assert!(config.folders.auto_convert);
        assert_eq!(config.encoder.binary, None);
        assert_eq!(config.encoder.timeout_secs, 600);
        assert_eq!(config.encoder.probe_timeout_secs, 5);
        assert_eq!(config.watcher.poll_interval_ms, 500);
        assert_eq!(config.watcher.stable_samples, 3);
        assert_eq!(config.watcher.budget_secs, 30);
        assert_eq!(config.storage.database_path, PathBuf::from("aiff-drop.db"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_overrides_folders() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("AIFF_DROP_WATCH_FOLDER", "/srv/downloads");
        env::set_var("AIFF_DROP_OUTPUT_FOLDER", "/srv/aiff");
        env::set_var("AIFF_DROP_DATABASE", "/var/lib/aiff-drop/jobs.db");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.folders.watch_folder(), Some(Path::new("/srv/downloads")));
        assert_eq!(config.folders.output_folder(), Some(Path::new("/srv/aiff")));
        assert_eq!(
            config.storage.database_path,
            PathBuf::from("/var/lib/aiff-drop/jobs.db")
        );
    }

    #[test]
    fn test_invalid_auto_convert_env_keeps_value() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        config.folders.auto_convert = false;
        env::set_var("AIFF_DROP_AUTO_CONVERT", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(!config.folders.auto_convert);
    }

    #[test]
    fn test_empty_folder_is_unset() {
        let toml_str = r#"
[folders]
watch_folder = ""
output_folder = "/music/aiff"
"#;
        let config = Config::parse_toml(toml_str).expect("Valid TOML");

        assert_eq!(config.folders.watch_folder(), None);
        assert_eq!(config.folders.output_folder(), Some(Path::new("/music/aiff")));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("aiff-drop-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let mut config = Config::default();
        config.folders.watch_folder = Some(PathBuf::from("/downloads"));
        config.folders.auto_convert = false;
        config.encoder.timeout_secs = 120;
        config.save_to_file(&path).expect("Should save config");

        let reloaded = Config::load_from_file(&path).expect("Should reload config");
        assert_eq!(reloaded, config);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::load_or_default("/nonexistent/aiff-drop/config.toml")
            .expect("Missing file should yield defaults");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let result = Config::parse_toml("[folders\nwatch_folder = 1");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
