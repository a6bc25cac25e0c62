//! TOML Configuration File Support
//!
//! Centralized configuration loading for tether, supporting a TOML
//! configuration file at `~/.config/tether/tether.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (when applicable)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [parser]
//! heartbeat_timeout_secs = 45
//! max_line_bytes = 1048576
//!
//! [registry]
//! max_attempts = 3
//! base_delay_ms = 2000
//! max_delay_ms = 30000
//! max_jitter_ms = 250
//! inactivity_secs = 120
//! monitor_interval_secs = 15
//!
//! [recovery]
//! stale_threshold_secs = 3600
//!
//! [poller]
//! interval_ms = 900
//! timeout_secs = 180
//! stable_ticks = 3
//! role = "assistant"
//!
//! [upload]
//! tick_interval_secs = 10
//! max_attempts = 4
//! base_delay_ms = 2000
//! max_delay_ms = 60000
//! max_jitter_ms = 1000
//!
//! [storage]
//! state_dir = "/var/lib/tether"
//! connect_timeout_ms = 10000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ClientConfig;
use crate::poller::PollerConfig;
use crate::recovery::RecoveryConfig;
use crate::registry::RegistryConfig;
use crate::retry::RetryPolicy;
use crate::sse::ParserConfig;
use crate::storage::FileStorage;
use crate::upload::UploadConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Parser section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserToml {
    /// Silence in seconds before a push stream is declared stale
    pub heartbeat_timeout_secs: Option<u64>,

    /// Largest unterminated line buffered, in bytes
    pub max_line_bytes: Option<usize>,
}

/// Backoff fields shared by the registry and upload sections
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Failures tolerated before giving up
    pub max_attempts: Option<u32>,

    /// Delay after the first failure in milliseconds
    pub base_delay_ms: Option<u64>,

    /// Backoff ceiling in milliseconds
    pub max_delay_ms: Option<u64>,

    /// Upper bound of the random jitter in milliseconds
    pub max_jitter_ms: Option<u64>,
}

/// Registry section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryToml {
    /// Recovery backoff
    #[serde(flatten)]
    pub retry: RetryToml,

    /// Seconds without progress before an active stream counts as stalled
    pub inactivity_secs: Option<u64>,

    /// Seconds between inactivity checks
    pub monitor_interval_secs: Option<u64>,
}

/// Recovery store section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryToml {
    /// Age in seconds after which persisted snapshots are ignored
    pub stale_threshold_secs: Option<u64>,
}

/// Poller section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerToml {
    /// Milliseconds between fetches
    pub interval_ms: Option<u64>,

    /// Overall poll deadline in seconds
    pub timeout_secs: Option<u64>,

    /// Unchanged observations treated as completion
    pub stable_ticks: Option<u32>,

    /// Role used when no message id matches
    pub role: Option<String>,
}

/// Upload section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadToml {
    /// Seconds between scheduler drains
    pub tick_interval_secs: Option<u64>,

    /// Per-item backoff
    #[serde(flatten)]
    pub retry: RetryToml,
}

/// Storage and network section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageToml {
    /// Directory for persisted recovery snapshots and the upload queue
    pub state_dir: Option<String>,

    /// HTTP connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,

    /// Chunks buffered per stream consumer
    pub chunk_buffer: Option<usize>,
}

/// Root TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherToml {
    /// Parser configuration
    pub parser: ParserToml,

    /// Registry configuration
    pub registry: RegistryToml,

    /// Recovery store configuration
    pub recovery: RecoveryToml,

    /// Poller configuration
    pub poller: PollerToml,

    /// Upload queue configuration
    pub upload: UploadToml,

    /// Storage configuration
    pub storage: StorageToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Resolved configuration for every component
#[derive(Clone, Debug)]
pub struct TetherConfig {
    /// SSE parser settings
    pub parser: ParserConfig,

    /// Session registry settings
    pub registry: RegistryConfig,

    /// Recovery store settings
    pub recovery: RecoveryConfig,

    /// Delta poller settings
    pub poller: PollerConfig,

    /// Upload queue settings
    pub upload: UploadConfig,

    /// State directory, `None` when no data directory is known
    pub state_dir: Option<PathBuf>,

    /// HTTP connect timeout
    pub connect_timeout: Duration,

    /// Chunks buffered per stream consumer
    pub chunk_buffer: usize,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for TetherConfig {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            parser: ParserConfig::default(),
            registry: RegistryConfig::default(),
            recovery: RecoveryConfig::default(),
            poller: PollerConfig::default(),
            upload: UploadConfig::default(),
            state_dir: FileStorage::default_dir(),
            connect_timeout: Duration::from_secs(10),
            chunk_buffer: client.chunk_buffer,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl TetherConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Settings for [`crate::client::StreamClient`]
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            parser: self.parser.clone(),
            poller: self.poller.clone(),
            chunk_buffer: self.chunk_buffer,
        }
    }

    /// Reject values the components cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the offending section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.parser.heartbeat_timeout.is_zero() {
            return invalid("parser.heartbeat_timeout_secs must be > 0".into());
        }
        if self.parser.max_line_bytes == 0 {
            return invalid("parser.max_line_bytes must be > 0".into());
        }
        if let Err(e) = self.registry.retry.validate() {
            return invalid(format!("registry: {e}"));
        }
        if self.registry.inactivity_threshold.is_zero() {
            return invalid("registry.inactivity_secs must be > 0".into());
        }
        if self.registry.monitor_interval.is_zero() {
            return invalid("registry.monitor_interval_secs must be > 0".into());
        }
        if self.poller.interval.is_zero() {
            return invalid("poller.interval_ms must be > 0".into());
        }
        if self.poller.timeout < self.poller.interval {
            return invalid("poller.timeout_secs must cover at least one interval".into());
        }
        if self.poller.stable_ticks == 0 {
            return invalid("poller.stable_ticks must be > 0".into());
        }
        if self.upload.tick_interval.is_zero() {
            return invalid("upload.tick_interval_secs must be > 0".into());
        }
        if let Err(e) = self.upload.retry.validate() {
            return invalid(format!("upload: {e}"));
        }
        if self.chunk_buffer == 0 {
            return invalid("storage.chunk_buffer must be > 0".into());
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/tether/tether.toml` or
/// `~/.config/tether/tether.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tether").join("tether.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// merged values fail [`TetherConfig::validate`]. A missing config file is not
/// an error (defaults are used).
pub fn load_config() -> Result<TetherConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed, or
/// if the result is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<TetherConfig, ConfigError> {
    let mut config = TetherConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: TetherToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

fn apply_retry_toml(policy: &mut RetryPolicy, toml: &RetryToml) {
    if let Some(attempts) = toml.max_attempts {
        policy.max_attempts = attempts;
    }
    if let Some(ms) = toml.base_delay_ms {
        policy.base_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.max_delay_ms {
        policy.max_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.max_jitter_ms {
        policy.max_jitter = Duration::from_millis(ms);
    }
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut TetherConfig, toml: &TetherToml) {
    // Parser settings
    if let Some(secs) = toml.parser.heartbeat_timeout_secs {
        config.parser.heartbeat_timeout = Duration::from_secs(secs);
    }
    if let Some(bytes) = toml.parser.max_line_bytes {
        config.parser.max_line_bytes = bytes;
    }

    // Registry settings
    apply_retry_toml(&mut config.registry.retry, &toml.registry.retry);
    if let Some(secs) = toml.registry.inactivity_secs {
        config.registry.inactivity_threshold = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.registry.monitor_interval_secs {
        config.registry.monitor_interval = Duration::from_secs(secs);
    }

    // Recovery settings
    if let Some(secs) = toml.recovery.stale_threshold_secs {
        config.recovery.stale_threshold = Duration::from_secs(secs);
    }

    // Poller settings
    if let Some(ms) = toml.poller.interval_ms {
        config.poller.interval = Duration::from_millis(ms);
    }
    if let Some(secs) = toml.poller.timeout_secs {
        config.poller.timeout = Duration::from_secs(secs);
    }
    if let Some(ticks) = toml.poller.stable_ticks {
        config.poller.stable_ticks = ticks;
    }
    if let Some(ref role) = toml.poller.role {
        config.poller.role = role.clone();
    }

    // Upload settings
    if let Some(secs) = toml.upload.tick_interval_secs {
        config.upload.tick_interval = Duration::from_secs(secs);
    }
    apply_retry_toml(&mut config.upload.retry, &toml.upload.retry);

    // Storage settings
    if let Some(ref dir) = toml.storage.state_dir {
        config.state_dir = Some(PathBuf::from(dir));
    }
    if let Some(ms) = toml.storage.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(buffer) = toml.storage.chunk_buffer {
        config.chunk_buffer = buffer;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut TetherConfig) {
    if let Some(secs) = env_parse::<u64>("TETHER_HEARTBEAT_SECS") {
        config.parser.heartbeat_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(n) = env_parse::<u32>("TETHER_MAX_RECOVERY_ATTEMPTS") {
        config.registry.retry.max_attempts = n;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("TETHER_INACTIVITY_SECS") {
        config.registry.inactivity_threshold = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("TETHER_STALE_SECS") {
        config.recovery.stale_threshold = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env_parse::<u64>("TETHER_POLL_INTERVAL_MS") {
        config.poller.interval = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("TETHER_POLL_TIMEOUT_SECS") {
        config.poller.timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(n) = env_parse::<u32>("TETHER_UPLOAD_MAX_ATTEMPTS") {
        config.upload.retry.max_attempts = n;
        config.source = ConfigSource::Env;
    }
    if let Ok(dir) = std::env::var("TETHER_STATE_DIR") {
        if !dir.is_empty() {
            config.state_dir = Some(PathBuf::from(dir));
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// CLI overrides applied on top of file and environment values
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Heartbeat timeout in seconds
    pub heartbeat_secs: Option<u64>,

    /// Recovery attempts before a stream fails
    pub max_recovery_attempts: Option<u32>,

    /// Poll interval in milliseconds
    pub poll_interval_ms: Option<u64>,

    /// Poll deadline in seconds
    pub poll_timeout_secs: Option<u64>,

    /// State directory
    pub state_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create empty overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the heartbeat timeout
    #[must_use]
    pub fn with_heartbeat_secs(mut self, secs: u64) -> Self {
        self.heartbeat_secs = Some(secs);
        self
    }

    /// Override the recovery attempt limit
    #[must_use]
    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = Some(attempts);
        self
    }

    /// Override the poll interval
    #[must_use]
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = Some(ms);
        self
    }

    /// Override the poll deadline
    #[must_use]
    pub fn with_poll_timeout_secs(mut self, secs: u64) -> Self {
        self.poll_timeout_secs = Some(secs);
        self
    }

    /// Override the state directory
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the overridden values are invalid.
    pub fn apply(&self, config: &mut TetherConfig) -> Result<(), ConfigError> {
        if self.heartbeat_secs.is_some()
            || self.max_recovery_attempts.is_some()
            || self.poll_interval_ms.is_some()
            || self.poll_timeout_secs.is_some()
            || self.state_dir.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(secs) = self.heartbeat_secs {
            config.parser.heartbeat_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = self.max_recovery_attempts {
            config.registry.retry.max_attempts = attempts;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poller.interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.poll_timeout_secs {
            config.poller.timeout = Duration::from_secs(secs);
        }
        if let Some(ref dir) = self.state_dir {
            config.state_dir = Some(dir.clone());
        }

        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
