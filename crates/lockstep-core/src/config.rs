//! Configuration module for Lockstep.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for Lockstep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sync: SyncConfig,
    pub recovery: RecoveryConfig,
    pub conflicts: ConflictsConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
}

/// Sync server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL; each operation is posted to `{url}/{Operation}`.
    pub url: String,
    /// Bearer token sent with every request.
    pub auth_token: Option<String>,
    /// Identifier of this device. Generated and stored on first use when unset.
    pub device_id: Option<String>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Retries for rate-limited (HTTP 429) requests.
    pub max_retries: u32,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Where downloads and in-memory uploads are staged.
    pub staging_dir: PathBuf,
    /// Where the daemon places delivered files.
    pub deliver_dir: PathBuf,
    /// Seconds between `CheckOperationStatus` polls.
    pub poll_interval_secs: u64,
    /// Seconds between periodic sync triggers in the daemon.
    pub trigger_interval_secs: u64,
    /// Size of one transfer block (in KiB).
    pub block_size_kb: u64,
}

/// Recovery and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Attempts per recovery category before giving up.
    pub max_attempts: u32,
    /// First backoff delay; doubled on every further attempt.
    pub base_delay_ms: u64,
    /// Status polls before a running operation counts as failed.
    pub max_poll_attempts: u32,
}

/// Conflict resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictsConfig {
    /// How the daemon answers conflicts: `manual`, `keep_local`, or `accept_remote`.
    pub default_resolution: String,
    /// Per-name overrides, first match wins.
    pub rules: Vec<ConflictRule>,
}

/// A conflict rule matching remote file names by glob pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRule {
    /// Glob pattern, e.g. `"*.json"`.
    pub pattern: String,
    /// Same values as `conflicts.default_resolution`.
    pub resolution: String,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `text` or `json`.
    pub format: String,
}

/// Persistent storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding the engine state.
    pub database: PathBuf,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

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
    /// Typically `$XDG_CONFIG_HOME/lockstep/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("lockstep")
            .join("config.yaml")
    }

    /// Transfer block size in bytes.
    pub fn block_size_bytes(&self) -> u64 {
        self.sync.block_size_kb * 1024
    }

    /// Returns the configured device id, or the one stored next to the
    /// database, generating and storing it on first use.
    pub fn resolve_device_id(&self) -> anyhow::Result<String> {
        if let Some(id) = &self.server.device_id {
            return Ok(id.clone());
        }

        let path = self.device_id_path();
        if let Ok(existing) = std::fs::read_to_string(&path) {
            let existing = existing.trim();
            if !existing.is_empty() {
                return Ok(existing.to_string());
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &id)?;
        Ok(id)
    }

    fn device_id_path(&self) -> PathBuf {
        self.storage
            .database
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
            .join("device_id")
    }
}

// ---------------------------------------------------------------------------
// Config::default()
// ---------------------------------------------------------------------------

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("lockstep")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/api".to_string(),
            auth_token: None,
            device_id: None,
            request_timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            staging_dir: data_dir().join("staging"),
            deliver_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("Lockstep"),
            poll_interval_secs: 5,
            trigger_interval_secs: 60,
            block_size_kb: 100,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_poll_attempts: 120,
        }
    }
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            default_resolution: "manual".to_string(),
            rules: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: data_dir().join("lockstep.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.poll_interval_secs"`.
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

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

/// Valid values for `conflicts.default_resolution`.
const VALID_CONFLICT_RESOLUTIONS: &[&str] = &["manual", "keep_local", "accept_remote"];

fn must_be_positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- server ---
        if !(self.server.url.starts_with("http://") || self.server.url.starts_with("https://")) {
            errors.push(ValidationError {
                field: "server.url".into(),
                message: format!("must be an http(s) URL, got '{}'", self.server.url),
            });
        }
        if let Some(id) = &self.server.device_id {
            if id.trim().is_empty() {
                errors.push(ValidationError {
                    field: "server.device_id".into(),
                    message: "must not be empty when set".into(),
                });
            }
        }
        must_be_positive(
            &mut errors,
            "server.request_timeout_secs",
            self.server.request_timeout_secs,
        );

        // --- sync ---
        must_be_positive(&mut errors, "sync.poll_interval_secs", self.sync.poll_interval_secs);
        must_be_positive(
            &mut errors,
            "sync.trigger_interval_secs",
            self.sync.trigger_interval_secs,
        );
        must_be_positive(&mut errors, "sync.block_size_kb", self.sync.block_size_kb);
        if self.sync.staging_dir == self.sync.deliver_dir {
            errors.push(ValidationError {
                field: "sync.deliver_dir".into(),
                message: "must differ from sync.staging_dir".into(),
            });
        }

        // --- recovery ---
        must_be_positive(
            &mut errors,
            "recovery.max_attempts",
            u64::from(self.recovery.max_attempts),
        );
        must_be_positive(
            &mut errors,
            "recovery.max_poll_attempts",
            u64::from(self.recovery.max_poll_attempts),
        );

        // --- conflicts ---
        if !VALID_CONFLICT_RESOLUTIONS.contains(&self.conflicts.default_resolution.as_str()) {
            errors.push(ValidationError {
                field: "conflicts.default_resolution".into(),
                message: format!(
                    "invalid resolution '{}'; valid options: {}",
                    self.conflicts.default_resolution,
                    VALID_CONFLICT_RESOLUTIONS.join(", ")
                ),
            });
        }

        for (i, rule) in self.conflicts.rules.iter().enumerate() {
            if !VALID_CONFLICT_RESOLUTIONS.contains(&rule.resolution.as_str()) {
                errors.push(ValidationError {
                    field: format!("conflicts.rules[{i}].resolution"),
                    message: format!("invalid resolution '{}'", rule.resolution),
                });
            }
            if rule.pattern.is_empty() {
                errors.push(ValidationError {
                    field: format!("conflicts.rules[{i}].pattern"),
                    message: "must not be empty".into(),
                });
            }
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}'; valid options: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        // --- storage ---
        if self.storage.database.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.database".into(),
                message: "must not be empty".into(),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use lockstep_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .server_url("https://sync.example.com/api")
///     .sync_poll_interval_secs(2)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- server ---

    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server.url = url.into();
        self
    }

    pub fn server_auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.server.auth_token = Some(token.into());
        self
    }

    pub fn server_device_id(mut self, id: impl Into<String>) -> Self {
        self.config.server.device_id = Some(id.into());
        self
    }

    pub fn server_request_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.server.request_timeout_secs = seconds;
        self
    }

    pub fn server_max_retries(mut self, n: u32) -> Self {
        self.config.server.max_retries = n;
        self
    }

    // --- sync ---

    pub fn sync_staging_dir(mut self, dir: PathBuf) -> Self {
        self.config.sync.staging_dir = dir;
        self
    }

    pub fn sync_deliver_dir(mut self, dir: PathBuf) -> Self {
        self.config.sync.deliver_dir = dir;
        self
    }

    pub fn sync_poll_interval_secs(mut self, seconds: u64) -> Self {
        self.config.sync.poll_interval_secs = seconds;
        self
    }

    pub fn sync_trigger_interval_secs(mut self, seconds: u64) -> Self {
        self.config.sync.trigger_interval_secs = seconds;
        self
    }

    pub fn sync_block_size_kb(mut self, kb: u64) -> Self {
        self.config.sync.block_size_kb = kb;
        self
    }

    // --- recovery ---

    pub fn recovery_max_attempts(mut self, n: u32) -> Self {
        self.config.recovery.max_attempts = n;
        self
    }

    pub fn recovery_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.recovery.base_delay_ms = ms;
        self
    }

    pub fn recovery_max_poll_attempts(mut self, n: u32) -> Self {
        self.config.recovery.max_poll_attempts = n;
        self
    }

    // --- conflicts ---

    pub fn conflicts_default_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.config.conflicts.default_resolution = resolution.into();
        self
    }

    pub fn conflicts_rule(mut self, pattern: impl Into<String>, resolution: impl Into<String>) -> Self {
        self.config.conflicts.rules.push(ConflictRule {
            pattern: pattern.into(),
            resolution: resolution.into(),
        });
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    // --- storage ---

    pub fn storage_database(mut self, path: PathBuf) -> Self {
        self.config.storage.database = path;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
