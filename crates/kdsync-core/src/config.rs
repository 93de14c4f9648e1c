//! Configuration module for kdsync.
//!
//! Provides typed configuration structs that map to the YAML configuration
//! file, with loading, validation and defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration for one sync profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub parameters: ParametersConfig,
    pub exclusions: ExclusionsConfig,
    pub drive: DriveConfig,
    pub logging: LoggingConfig,
}

/// Sync profile settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory of the local replica.
    pub local_root: PathBuf,
    /// Identifier of the sync profile (one sync database per profile).
    pub sync_db_id: i64,
    /// Remote drive identifier.
    pub drive_id: i64,
    /// Remote id of the synchronized root directory.
    pub root_remote_id: String,
    /// Synchronize dot-files and OS-hidden files.
    pub sync_hidden_files: bool,
    /// Idle sleep of the remote observer loop, in milliseconds.
    pub loop_sleep_ms: u64,
    /// Polling interval while a worker is paused, in milliseconds.
    pub pause_sleep_ms: u64,
}

/// Engine parameters shared by all profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParametersConfig {
    /// Ask before syncing remote folders larger than the limit.
    pub use_big_folder_size_limit: bool,
    /// Big-folder limit, in MiB.
    pub big_folder_size_limit_mb: i64,
    /// Per-item debug logging.
    pub extended_log: bool,
    /// Longest relative path accepted on the local platform.
    pub max_path_length: usize,
    /// Detect files whose size differs between replicas despite equal timestamps.
    pub file_size_mismatch_detection: bool,
}

/// One exclusion template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Glob-like pattern; `*` matches any run of characters.
    pub pattern: String,
    /// Report matches to the user instead of excluding silently.
    #[serde(default)]
    pub warning: bool,
    /// Marked for removal by the user; ignored when compiling.
    #[serde(default)]
    pub deleted: bool,
}

/// User-defined exclusion templates (defaults ship with the engine).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionsConfig {
    pub user_templates: Vec<TemplateConfig>,
}

/// Remote drive API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Base URL of the drive API, including the drive id.
    pub base_url: String,
    /// Bearer token.
    pub access_token: String,
    /// Timeout for full listings, in seconds.
    pub listing_timeout_secs: u64,
    /// Timeout for ordinary API calls, in seconds.
    pub request_timeout_secs: u64,
    /// Long-poll timeout, in seconds.
    pub long_poll_timeout_secs: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/kdsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("kdsync")
            .join("config.yaml")
    }
}

impl ParametersConfig {
    /// Big-folder limit in bytes.
    #[must_use]
    pub fn big_folder_size_limit_bytes(&self) -> i64 {
        self.big_folder_size_limit_mb.saturating_mul(1024 * 1024)
    }
}

/// Longest relative path the local platform accepts.
#[must_use]
pub fn platform_max_path_length() -> usize {
    if cfg!(target_os = "windows") {
        // MAX_PATH minus the drive prefix and terminator
        259
    } else if cfg!(target_os = "macos") {
        1023
    } else {
        4096
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("kDrive"),
            sync_db_id: 1,
            drive_id: 0,
            root_remote_id: "1".to_string(),
            sync_hidden_files: false,
            loop_sleep_ms: 1000,
            pause_sleep_ms: 200,
        }
    }
}

impl Default for ParametersConfig {
    fn default() -> Self {
        Self {
            use_big_folder_size_limit: true,
            big_folder_size_limit_mb: 500,
            extended_log: false,
            max_path_length: platform_max_path_length(),
            file_size_mismatch_detection: true,
        }
    }
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.infomaniak.com/2/drive/0".to_string(),
            access_token: String::new(),
            listing_timeout_secs: 915,
            request_timeout_secs: 60,
            long_poll_timeout_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.loop_sleep_ms"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ValidationError {
                field: field.into(),
                message,
            })
        };

        // --- sync ---
        if self.sync.loop_sleep_ms == 0 {
            push("sync.loop_sleep_ms", "must be greater than 0".into());
        }
        if self.sync.pause_sleep_ms == 0 {
            push("sync.pause_sleep_ms", "must be greater than 0".into());
        }
        if self.sync.root_remote_id.is_empty() {
            push("sync.root_remote_id", "must not be empty".into());
        }
        if !self.sync.local_root.exists() {
            push(
                "sync.local_root",
                format!(
                    "directory does not exist: {}",
                    self.sync.local_root.display()
                ),
            );
        }

        // --- parameters ---
        if self.parameters.use_big_folder_size_limit && self.parameters.big_folder_size_limit_mb <= 0
        {
            push(
                "parameters.big_folder_size_limit_mb",
                "must be greater than 0 when the limit is enabled".into(),
            );
        }
        if self.parameters.max_path_length == 0 {
            push("parameters.max_path_length", "must be greater than 0".into());
        }

        // --- exclusions ---
        for (i, template) in self.exclusions.user_templates.iter().enumerate() {
            if template.pattern.is_empty() {
                push(
                    &format!("exclusions.user_templates[{i}].pattern"),
                    "must not be empty".into(),
                );
            }
        }

        // --- drive ---
        if url_scheme_ok(&self.drive.base_url).is_none() {
            push(
                "drive.base_url",
                format!("must be an http(s) URL, got {:?}", self.drive.base_url),
            );
        }
        if self.drive.request_timeout_secs == 0 {
            push("drive.request_timeout_secs", "must be greater than 0".into());
        }
        if self.drive.listing_timeout_secs == 0 {
            push("drive.listing_timeout_secs", "must be greater than 0".into());
        }
        if self.drive.long_poll_timeout_secs == 0 {
            push("drive.long_poll_timeout_secs", "must be greater than 0".into());
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            push(
                "logging.level",
                format!(
                    "must be one of {VALID_LOG_LEVELS:?}, got {:?}",
                    self.logging.level
                ),
            );
        }

        errors
    }
}

fn url_scheme_ok(url: &str) -> Option<()> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    (!rest.is_empty()).then_some(())
}
