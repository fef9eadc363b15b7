//! Driver Configuration
//!
//! Centralized configuration for the driver, read from
//! `~/.config/drum-driver/driver.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. Environment variables (`DRUM_DRIVER_*`)
//! 2. TOML configuration file
//! 3. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [transport]
//! channel_capacity = 256
//! runstate_poll_ms = 50
//!
//! [execution]
//! run_quantum = 10000
//! register_stream_stride = 50000
//! default_yield_steps = 1000
//! memory_size = "2K"
//!
//! [state]
//! suppression_window_ms = 250
//! debug_flush_ms = 100
//! preferences_path = "/home/me/.config/drum-driver/preferences.toml"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the per-user configuration directory
pub const APP_DIR: &str = "drum-driver";

const VALID_MEMORY_SIZES: [&str; 3] = ["1K", "2K", "4K"];

// =============================================================================
// Error Types
// =============================================================================

/// Why a configuration could not be produced
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read
    #[error("cannot read {path}: {source}")]
    ReadError {
        /// File that was opened
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// The file is not valid TOML for [`DriverToml`]
    #[error("malformed driver.toml: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A merged value is out of range
    #[error("invalid driver configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Highest-priority layer that contributed a value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// A `DRUM_DRIVER_*` variable
    Env,
    /// `driver.toml`
    File,
    /// Built-in defaults only
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => f.write_str("env"),
            Self::File => f.write_str("driver.toml"),
            Self::Default => f.write_str("defaults"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[transport]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// Bound of the caller-to-worker frame channel
    pub channel_capacity: Option<usize>,

    /// Busy-flag poll interval in milliseconds
    pub runstate_poll_ms: Option<u64>,
}

/// `[execution]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionToml {
    /// Steps per run-loop quantum
    pub run_quantum: Option<u32>,

    /// Steps between streamed register samples
    pub register_stream_stride: Option<u64>,

    /// Yield steps used when no valid preference exists
    pub default_yield_steps: Option<u32>,

    /// Drum size passed to `SET CPU`
    pub memory_size: Option<String>,
}

/// `[state]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateToml {
    /// Run-command "stopped" masking window in milliseconds
    pub suppression_window_ms: Option<u64>,

    /// Debug-line patch coalescing interval in milliseconds
    pub debug_flush_ms: Option<u64>,

    /// Where the yield-step preference is stored
    pub preferences_path: Option<PathBuf>,
}

/// Shape of `driver.toml`; every key is optional
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverToml {
    /// Worker channel and poller
    pub transport: TransportToml,

    /// Run loop and initialization
    pub execution: ExecutionToml,

    /// Snapshot service timing and preferences
    pub state: StateToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the driver
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// Bound of the caller-to-worker frame channel
    pub channel_capacity: usize,

    /// Busy-flag poll interval in milliseconds
    pub runstate_poll_ms: u64,

    /// Steps per run-loop quantum
    pub run_quantum: u32,

    /// Steps between streamed register samples
    pub register_stream_stride: u64,

    /// Run-command "stopped" masking window in milliseconds
    pub suppression_window_ms: u64,

    /// Debug-line patch coalescing interval in milliseconds
    pub debug_flush_ms: u64,

    /// Yield steps used when no valid preference exists
    pub default_yield_steps: u32,

    /// Drum size passed to `SET CPU` on initialization
    pub memory_size: String,

    /// Where the yield-step preference is stored (`None` disables persistence)
    pub preferences_path: Option<PathBuf>,

    /// `driver.toml` that contributed values, if one was found
    pub config_file_path: Option<PathBuf>,

    pub(crate) source: ConfigSource,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            runstate_poll_ms: 50,
            run_quantum: 10_000,
            register_stream_stride: 50_000,
            suppression_window_ms: 250,
            debug_flush_ms: 100,
            default_yield_steps: 1000,
            memory_size: "2K".to_string(),
            preferences_path: default_preferences_path(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl DriverConfig {
    /// Built-in defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest layer that set a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Busy-flag poll interval
    #[must_use]
    pub fn runstate_poll_interval(&self) -> Duration {
        Duration::from_millis(self.runstate_poll_ms.max(1))
    }

    /// Run-command suppression window
    #[must_use]
    pub fn suppression_window(&self) -> Duration {
        Duration::from_millis(self.suppression_window_ms)
    }

    /// Debug-line coalescing interval
    #[must_use]
    pub fn debug_flush_interval(&self) -> Duration {
        Duration::from_millis(self.debug_flush_ms.max(1))
    }

    /// Check values that would make the driver misbehave
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.run_quantum == 0 {
            return Err(ConfigError::ValidationError(
                "run_quantum must be at least 1".to_string(),
            ));
        }
        if !VALID_MEMORY_SIZES.contains(&self.memory_size.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "memory_size must be one of {}, got {:?}",
                VALID_MEMORY_SIZES.join(", "),
                self.memory_size
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Where `driver.toml` lives
///
/// Returns `$XDG_CONFIG_HOME/drum-driver/driver.toml` or
/// `~/.config/drum-driver/driver.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR).join("driver.toml"))
}

/// Where the yield-step preference is kept by default
#[must_use]
pub fn default_preferences_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR).join("preferences.toml"))
}

/// Defaults, then `driver.toml`, then `DRUM_DRIVER_*` variables
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the merged configuration is invalid. A missing config file is not an error.
pub fn load_config() -> Result<DriverConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Same as [`load_config`] with an explicit file
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the merged configuration is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<DriverConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration using `env` to look up environment overrides
///
/// # Errors
///
/// See [`load_config_from_path`].
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<DriverConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = DriverConfig::default();

    match path {
        Some(file) if file.exists() => {
            let text = std::fs::read_to_string(&file).map_err(|source| ConfigError::ReadError {
                path: file.clone(),
                source,
            })?;
            let parsed: DriverToml = toml::from_str(&text)?;
            apply_toml_config(&mut config, &parsed);
            tracing::info!(path = %file.display(), "driver.toml applied");
            config.config_file_path = Some(file);
            config.source = ConfigSource::File;
        }
        Some(file) => tracing::debug!(path = %file.display(), "no driver.toml, keeping defaults"),
        None => {}
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

/// Overlay the keys present in the file
fn apply_toml_config(config: &mut DriverConfig, toml: &DriverToml) {
    if let Some(capacity) = toml.transport.channel_capacity {
        config.channel_capacity = capacity;
    }
    if let Some(ms) = toml.transport.runstate_poll_ms {
        config.runstate_poll_ms = ms;
    }

    if let Some(quantum) = toml.execution.run_quantum {
        config.run_quantum = quantum;
    }
    if let Some(stride) = toml.execution.register_stream_stride {
        config.register_stream_stride = stride;
    }
    if let Some(steps) = toml.execution.default_yield_steps {
        config.default_yield_steps = steps;
    }
    if let Some(ref size) = toml.execution.memory_size {
        config.memory_size = size.trim().to_uppercase();
    }

    if let Some(ms) = toml.state.suppression_window_ms {
        config.suppression_window_ms = ms;
    }
    if let Some(ms) = toml.state.debug_flush_ms {
        config.debug_flush_ms = ms;
    }
    if toml.state.preferences_path.is_some() {
        config.preferences_path = toml.state.preferences_path.clone();
    }
}

/// Overlay `DRUM_DRIVER_*` values that parse
fn apply_env_config<F>(config: &mut DriverConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        env(key).and_then(|v| v.trim().parse().ok())
    }

    let before = config.source;
    let mut touched = false;

    if let Some(n) = parsed(&env, "DRUM_DRIVER_CHANNEL_CAPACITY") {
        config.channel_capacity = n;
        touched = true;
    }
    if let Some(ms) = parsed(&env, "DRUM_DRIVER_RUNSTATE_POLL_MS") {
        config.runstate_poll_ms = ms;
        touched = true;
    }
    if let Some(n) = parsed(&env, "DRUM_DRIVER_RUN_QUANTUM") {
        config.run_quantum = n;
        touched = true;
    }
    if let Some(n) = parsed(&env, "DRUM_DRIVER_REGISTER_STREAM_STRIDE") {
        config.register_stream_stride = n;
        touched = true;
    }
    if let Some(ms) = parsed(&env, "DRUM_DRIVER_SUPPRESSION_WINDOW_MS") {
        config.suppression_window_ms = ms;
        touched = true;
    }
    if let Some(ms) = parsed(&env, "DRUM_DRIVER_DEBUG_FLUSH_MS") {
        config.debug_flush_ms = ms;
        touched = true;
    }
    if let Some(n) = parsed(&env, "DRUM_DRIVER_DEFAULT_YIELD_STEPS") {
        config.default_yield_steps = n;
        touched = true;
    }
    if let Some(size) = env("DRUM_DRIVER_MEMORY_SIZE") {
        config.memory_size = size.trim().to_uppercase();
        touched = true;
    }
    if let Some(path) = env("DRUM_DRIVER_PREFERENCES") {
        config.preferences_path = Some(PathBuf::from(path));
        touched = true;
    }

    config.source = if touched { ConfigSource::Env } else { before };
}
