//! Configuration
//!
//! Tunables for the connection manager and the stream assembler, with
//! loading from a TOML file at `~/.config/relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`RELAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [connection]
//! url = "wss://assistant.example/ws"
//! connect_timeout_ms = 5000
//! reconnect_base_delay_ms = 1000
//! backoff_ceiling_ms = 30000
//! ping_interval_ms = 30000
//! max_reconnect_attempts = 10
//! outbound_queue_capacity = 1000
//! overflow_policy = "drop_oldest"
//!
//! [assembler]
//! dedup_window_ms = 50
//! max_fingerprints = 64
//! reasoning_open_tag = "<think>"
//! reasoning_close_tag = "</think>"
//! retired_capacity = 256
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

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

/// Tracks where the effective configuration came from
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
// Runtime Configuration
// =============================================================================

/// What to do when the outbound queue is full
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued payload (default, keeps recent input)
    #[default]
    DropOldest,
    /// Discard the payload being queued (keeps earliest input)
    DropNewest,
}

/// Connection manager settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Backend endpoint (used by network transports)
    pub url: String,
    /// How long a single transport open may take
    pub connect_timeout: Duration,
    /// Delay before the first reconnect attempt
    pub reconnect_base_delay: Duration,
    /// Upper bound for the reconnect delay
    pub backoff_ceiling: Duration,
    /// Heartbeat period; a link silent for twice this is stale
    pub ping_interval: Duration,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Payloads held while disconnected
    pub outbound_queue_capacity: usize,
    /// Behavior when the queue is full
    pub overflow_policy: OverflowPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/ws".to_string(),
            connect_timeout: Duration::from_millis(5000),
            reconnect_base_delay: Duration::from_millis(1000),
            backoff_ceiling: Duration::from_millis(30_000),
            ping_interval: Duration::from_millis(30_000),
            max_reconnect_attempts: 10,
            outbound_queue_capacity: 1000,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

impl ConnectionConfig {
    /// Create a config suitable for testing (short timers)
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            reconnect_base_delay: Duration::from_millis(100),
            backoff_ceiling: Duration::from_millis(1600),
            ping_interval: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            ..Default::default()
        }
    }

    /// Set the endpoint
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set base delay and ceiling of the reconnect backoff
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, ceiling: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.backoff_ceiling = ceiling;
        self
    }

    /// Set the heartbeat period
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the reconnect attempt limit
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the queue capacity and overflow behavior
    #[must_use]
    pub fn with_queue(mut self, capacity: usize, policy: OverflowPolicy) -> Self {
        self.outbound_queue_capacity = capacity;
        self.overflow_policy = policy;
        self
    }

    /// Check the values are usable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for zero intervals, a ceiling
    /// below the base delay, or a zero queue capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect_base_delay.is_zero() {
            return Err(ConfigError::ValidationError(
                "reconnect base delay must be greater than zero".into(),
            ));
        }
        if self.backoff_ceiling < self.reconnect_base_delay {
            return Err(ConfigError::ValidationError(format!(
                "backoff ceiling ({:?}) is below the base delay ({:?})",
                self.backoff_ceiling, self.reconnect_base_delay
            )));
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "ping interval must be greater than zero".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "connect timeout must be greater than zero".into(),
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "outbound queue capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Stream assembler settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssemblerConfig {
    /// Repeats inside this window are expected network duplicates
    pub dedup_window: Duration,
    /// Fingerprints remembered per stream
    pub max_fingerprints: usize,
    /// Opening delimiter of reasoning text
    pub reasoning_open_tag: String,
    /// Closing delimiter of reasoning text
    pub reasoning_close_tag: String,
    /// Finalized request ids remembered to reject late chunks
    pub retired_capacity: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_millis(50),
            max_fingerprints: 64,
            reasoning_open_tag: "<think>".to_string(),
            reasoning_close_tag: "</think>".to_string(),
            retired_capacity: 256,
        }
    }
}

impl AssemblerConfig {
    /// Set the reasoning delimiters
    #[must_use]
    pub fn with_reasoning_tags(mut self, open: impl Into<String>, close: impl Into<String>) -> Self {
        self.reasoning_open_tag = open.into();
        self.reasoning_close_tag = close.into();
        self
    }

    /// Set the dedup window
    #[must_use]
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Check the values are usable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for empty or identical tags and
    /// zero capacities.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reasoning_open_tag.is_empty() || self.reasoning_close_tag.is_empty() {
            return Err(ConfigError::ValidationError(
                "reasoning tags must not be empty".into(),
            ));
        }
        if self.reasoning_open_tag == self.reasoning_close_tag {
            return Err(ConfigError::ValidationError(
                "reasoning open and close tags must differ".into(),
            ));
        }
        if self.max_fingerprints == 0 {
            return Err(ConfigError::ValidationError(
                "max fingerprints must be greater than zero".into(),
            ));
        }
        if self.retired_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "retired capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[connection]` section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionToml {
    /// Backend endpoint
    pub url: Option<String>,
    /// Transport open timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// First reconnect delay in milliseconds
    pub reconnect_base_delay_ms: Option<u64>,
    /// Reconnect delay ceiling in milliseconds
    pub backoff_ceiling_ms: Option<u64>,
    /// Heartbeat period in milliseconds
    pub ping_interval_ms: Option<u64>,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: Option<u32>,
    /// Outbound queue capacity
    pub outbound_queue_capacity: Option<usize>,
    /// Outbound queue overflow behavior
    pub overflow_policy: Option<OverflowPolicy>,
}

/// `[assembler]` section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerToml {
    /// Duplicate window in milliseconds
    pub dedup_window_ms: Option<u64>,
    /// Fingerprints remembered per stream
    pub max_fingerprints: Option<usize>,
    /// Opening reasoning delimiter
    pub reasoning_open_tag: Option<String>,
    /// Closing reasoning delimiter
    pub reasoning_close_tag: Option<String>,
    /// Finalized request ids remembered
    pub retired_capacity: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Connection section
    pub connection: ConnectionToml,
    /// Assembler section
    pub assembler: AssemblerToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Effective configuration after all sources were applied
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Connection manager settings
    pub connection: ConnectionConfig,
    /// Stream assembler settings
    pub assembler: AssemblerConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            assembler: AssemblerConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Get the highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Validate both sections
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        self.assembler.validate()
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay/relay.toml` or `~/.config/relay/relay.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting configuration is invalid. A missing file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from a specific file and the process environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the resulting
/// configuration is invalid.
pub fn load_config_from_path(path: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env<F>(path: Option<&Path>, env: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = RelayConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.to_path_buf());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    let conn = &toml.connection;
    if let Some(ref url) = conn.url {
        config.connection.url = url.clone();
    }
    if let Some(ms) = conn.connect_timeout_ms {
        config.connection.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = conn.reconnect_base_delay_ms {
        config.connection.reconnect_base_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = conn.backoff_ceiling_ms {
        config.connection.backoff_ceiling = Duration::from_millis(ms);
    }
    if let Some(ms) = conn.ping_interval_ms {
        config.connection.ping_interval = Duration::from_millis(ms);
    }
    if let Some(attempts) = conn.max_reconnect_attempts {
        config.connection.max_reconnect_attempts = attempts;
    }
    if let Some(capacity) = conn.outbound_queue_capacity {
        config.connection.outbound_queue_capacity = capacity;
    }
    if let Some(policy) = conn.overflow_policy {
        config.connection.overflow_policy = policy;
    }

    let asm = &toml.assembler;
    if let Some(ms) = asm.dedup_window_ms {
        config.assembler.dedup_window = Duration::from_millis(ms);
    }
    if let Some(max) = asm.max_fingerprints {
        config.assembler.max_fingerprints = max;
    }
    if let Some(ref tag) = asm.reasoning_open_tag {
        config.assembler.reasoning_open_tag = tag.clone();
    }
    if let Some(ref tag) = asm.reasoning_close_tag {
        config.assembler.reasoning_close_tag = tag.clone();
    }
    if let Some(capacity) = asm.retired_capacity {
        config.assembler.retired_capacity = capacity;
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut RelayConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let millis = |key: &str| env(key).and_then(|v| v.parse::<u64>().ok());

    if let Some(url) = env("RELAY_URL") {
        config.connection.url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = millis("RELAY_CONNECT_TIMEOUT_MS") {
        config.connection.connect_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = millis("RELAY_RECONNECT_BASE_MS") {
        config.connection.reconnect_base_delay = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = millis("RELAY_BACKOFF_CEILING_MS") {
        config.connection.backoff_ceiling = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = millis("RELAY_PING_INTERVAL_MS") {
        config.connection.ping_interval = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(attempts) = env("RELAY_MAX_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
        config.connection.max_reconnect_attempts = attempts;
        config.source = ConfigSource::Env;
    }
    if let Some(capacity) = env("RELAY_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
        config.connection.outbound_queue_capacity = capacity;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = millis("RELAY_DEDUP_WINDOW_MS") {
        config.assembler.dedup_window = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Endpoint override
    pub url: Option<String>,
    /// Reconnect attempt limit override
    pub max_reconnect_attempts: Option<u32>,
    /// Heartbeat period override (milliseconds)
    pub ping_interval_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set endpoint override
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set reconnect attempt limit override
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    /// Set heartbeat period override
    #[must_use]
    pub fn with_ping_interval_ms(mut self, ms: u64) -> Self {
        self.ping_interval_ms = Some(ms);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns a validation error if the overrides make the config unusable.
    pub fn apply(&self, config: &mut RelayConfig) -> Result<(), ConfigError> {
        if self.url.is_some() || self.max_reconnect_attempts.is_some() || self.ping_interval_ms.is_some()
        {
            config.source = ConfigSource::Cli;
        }
        if let Some(ref url) = self.url {
            config.connection.url = url.clone();
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            config.connection.max_reconnect_attempts = attempts;
        }
        if let Some(ms) = self.ping_interval_ms {
            config.connection.ping_interval = Duration::from_millis(ms);
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
