//! TOML Configuration File Support
//!
//! Configuration is read from `~/.config/zonecheck/zonecheck.toml` (XDG
//! config dir) and environment variables, then CLI overrides.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [source]
//! url = "https://example.com/opportunity-zones.geojson"
//! zone_id_property = "GEOID"
//! fetch_timeout_secs = 60
//!
//! [cache]
//! ttl_secs = 86400
//! ticker_interval_secs = 300
//! store_prefix = "oz"
//!
//! [store]
//! url = "redis://127.0.0.1:6379"
//!
//! [rate_limit]
//! enabled = true
//!
//! [rate_limit.policies.web-app]
//! window_secs = 60
//! max_requests = 60
//!
//! [resilience]
//! failure_threshold = 5
//! cooldown_secs = 300
//!
//! [remote]
//! url = "http://localhost:3000"
//!
//! [flags]
//! use_remote_service = false
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::rate_limit::{RateLimitConfig, RateLimitPolicy};
use crate::routing::{HealthConfig, REMOTE_TIMEOUT};

/// Dataset URL
pub const ENV_SOURCE_URL: &str = "OPPORTUNITY_ZONES_URL";
/// Dataset file path
pub const ENV_SOURCE_FILE: &str = "OPPORTUNITY_ZONES_FILE";
/// Shared store URL
pub const ENV_STORE_URL: &str = "REDIS_URL";
/// Cache TTL in seconds
pub const ENV_CACHE_TTL: &str = "ZONECHECK_CACHE_TTL_SECS";
/// Zone identifier property
pub const ENV_ZONE_ID_PROPERTY: &str = "ZONECHECK_ZONE_ID_PROPERTY";
/// Rate limiting on/off
pub const ENV_RATE_LIMIT_ENABLED: &str = "ZONECHECK_RATE_LIMIT_ENABLED";
/// Remote service base URL
pub const ENV_REMOTE_URL: &str = "ZONECHECK_REMOTE_URL";
/// Remote service API key
pub const ENV_REMOTE_API_KEY: &str = "ZONECHECK_REMOTE_API_KEY";
/// Prefer the remote service
pub const ENV_USE_REMOTE_SERVICE: &str = "FEATURE_FLAG_USE_MCP_SERVICE";

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

/// `[source]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceToml {
    /// Dataset URL
    pub url: Option<String>,

    /// Dataset file (used when no URL is set)
    pub file: Option<PathBuf>,

    /// Property holding the zone identifier
    pub zone_id_property: Option<String>,

    /// Per-attempt fetch timeout in seconds
    pub fetch_timeout_secs: Option<u64>,
}

/// `[cache]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Freshness TTL in seconds
    pub ttl_secs: Option<u64>,

    /// Staleness check interval in seconds
    pub ticker_interval_secs: Option<u64>,

    /// Shared snapshot key prefix
    pub store_prefix: Option<String>,

    /// Fetch attempts
    pub max_attempts: Option<u32>,

    /// First retry delay in milliseconds
    pub initial_backoff_ms: Option<u64>,

    /// Retry delay cap in milliseconds
    pub max_backoff_ms: Option<u64>,
}

/// `[store]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreToml {
    /// `redis://...` or `memory://`
    pub url: Option<String>,

    /// Per-command timeout in milliseconds
    pub command_timeout_ms: Option<u64>,

    /// Connection probe interval in seconds
    pub probe_interval_secs: Option<u64>,
}

/// `[rate_limit.policies.<identity>]` entry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyToml {
    /// Window length in seconds
    pub window_secs: Option<u64>,

    /// Requests per window
    pub max_requests: Option<u32>,

    /// Counter key prefix
    pub prefix: Option<String>,
}

/// `[rate_limit]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitToml {
    /// Whether limits are enforced
    pub enabled: Option<bool>,

    /// Identity whose policy applies to unknown callers
    pub default_identity: Option<String>,

    /// Sweep interval in seconds
    pub sweep_interval_secs: Option<u64>,

    /// Expired window grace in seconds
    pub sweep_grace_secs: Option<u64>,

    /// Per-identity policies
    pub policies: HashMap<String, PolicyToml>,
}

/// `[resilience]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceToml {
    /// Consecutive failures before cooldown
    pub failure_threshold: Option<u32>,

    /// Cooldown in seconds
    pub cooldown_secs: Option<u64>,

    /// Attempts per operation
    pub max_attempts: Option<u32>,

    /// Base delay between attempts in milliseconds
    pub attempt_delay_ms: Option<u64>,
}

/// `[remote]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteToml {
    /// Remote service base URL
    pub url: Option<String>,

    /// Bearer token
    pub api_key: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
}

/// `[flags]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagsToml {
    /// Prefer the remote service
    pub use_remote_service: Option<bool>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneCheckToml {
    /// Dataset source
    pub source: SourceToml,
    /// Zone cache
    pub cache: CacheToml,
    /// Shared store
    pub store: StoreToml,
    /// Rate limiting
    pub rate_limit: RateLimitToml,
    /// Backend failover
    pub resilience: ResilienceToml,
    /// Remote service
    pub remote: RemoteToml,
    /// Feature flags
    pub flags: FlagsToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Where the zone dataset is read from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatasetLocation {
    /// HTTP(S) URL
    Url(String),
    /// Local file
    File(PathBuf),
    /// Not configured; the local engine reports `Configuration` when used
    Unconfigured,
}

/// Remote service connection settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Base URL
    pub url: String,
    /// Bearer token
    pub api_key: Option<String>,
    /// Request timeout
    pub timeout: Duration,
}

/// Centralized configuration for the zone check service
#[derive(Clone, Debug)]
pub struct ZoneCheckConfigFile {
    /// Dataset location
    pub dataset: DatasetLocation,

    /// Zone cache settings
    pub cache: CacheConfig,

    /// Shared store URL (`None` disables the store)
    pub store_url: Option<String>,

    /// Per-command store timeout
    pub store_command_timeout: Duration,

    /// Store connection probe interval
    pub store_probe_interval: Duration,

    /// Rate limiting
    pub rate_limit: RateLimitConfig,

    /// Backend failover tuning
    pub resilience: HealthConfig,

    /// Remote service, when configured
    pub remote: Option<RemoteConfig>,

    /// Prefer the remote service at startup
    pub use_remote_service: bool,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ZoneCheckConfigFile {
    fn default() -> Self {
        Self {
            dataset: DatasetLocation::Unconfigured,
            cache: CacheConfig::default(),
            store_url: None,
            store_command_timeout: Duration::from_secs(5),
            store_probe_interval: Duration::from_secs(30),
            rate_limit: RateLimitConfig::default(),
            resilience: HealthConfig::default(),
            remote: None,
            use_remote_service: false,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ZoneCheckConfigFile {
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

    /// Reject values the service cannot run with
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.cache.ttl.is_zero() {
            return invalid("cache ttl must be positive");
        }
        if self.cache.ticker_interval.is_zero() {
            return invalid("cache ticker interval must be positive");
        }
        if self.cache.fetch_timeout.is_zero() {
            return invalid("source fetch timeout must be positive");
        }
        if self.cache.retry.max_attempts == 0 {
            return invalid("cache max_attempts must be at least 1");
        }
        if self.cache.id_property.trim().is_empty() {
            return invalid("zone id property must not be empty");
        }
        if self.resilience.max_attempts == 0 {
            return invalid("resilience max_attempts must be at least 1");
        }
        if self.resilience.failure_threshold == 0 {
            return invalid("resilience failure_threshold must be at least 1");
        }
        if self.rate_limit.sweep_interval.is_zero() {
            return invalid("rate limit sweep interval must be positive");
        }
        self.rate_limit
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        if let Some(remote) = &self.remote {
            if remote.url.trim().is_empty() {
                return invalid("remote url must not be empty");
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/zonecheck/zonecheck.toml` or the platform
/// equivalent.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("zonecheck").join("zonecheck.toml"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<ZoneCheckConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ZoneCheckConfigFile, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with a custom environment lookup
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_with_env<F>(
    path: Option<PathBuf>,
    env: F,
) -> Result<ZoneCheckConfigFile, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ZoneCheckConfigFile::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ZoneCheckToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
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

    apply_env_config(&mut config, env);

    Ok(config)
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ZoneCheckConfigFile, toml: &ZoneCheckToml) -> Result<(), ConfigError> {
    // Source
    if let Some(url) = toml.source.url.as_ref().filter(|u| !u.trim().is_empty()) {
        config.dataset = DatasetLocation::Url(url.clone());
    } else if let Some(file) = &toml.source.file {
        config.dataset = DatasetLocation::File(file.clone());
    }
    if let Some(property) = &toml.source.zone_id_property {
        config.cache.id_property = property.clone();
    }
    if let Some(timeout) = toml.source.fetch_timeout_secs {
        config.cache.fetch_timeout = secs(timeout);
    }

    // Cache
    if let Some(ttl) = toml.cache.ttl_secs {
        config.cache.ttl = secs(ttl);
    }
    if let Some(interval) = toml.cache.ticker_interval_secs {
        config.cache.ticker_interval = secs(interval);
    }
    if let Some(prefix) = &toml.cache.store_prefix {
        config.cache.store_prefix = prefix.clone();
    }
    if let Some(attempts) = toml.cache.max_attempts {
        config.cache.retry.max_attempts = attempts;
    }
    if let Some(ms) = toml.cache.initial_backoff_ms {
        config.cache.retry.initial_backoff_ms = ms;
    }
    if let Some(ms) = toml.cache.max_backoff_ms {
        config.cache.retry.max_backoff_ms = ms;
    }

    // Store
    if let Some(url) = &toml.store.url {
        config.store_url = Some(url.clone()).filter(|u| !u.trim().is_empty());
    }
    if let Some(ms) = toml.store.command_timeout_ms {
        config.store_command_timeout = Duration::from_millis(ms);
    }
    if let Some(interval) = toml.store.probe_interval_secs {
        config.store_probe_interval = secs(interval);
    }

    // Rate limit
    if let Some(enabled) = toml.rate_limit.enabled {
        config.rate_limit.enabled = enabled;
    }
    if let Some(identity) = &toml.rate_limit.default_identity {
        config.rate_limit.default_identity = identity.clone();
    }
    if let Some(interval) = toml.rate_limit.sweep_interval_secs {
        config.rate_limit.sweep_interval = secs(interval);
    }
    if let Some(grace) = toml.rate_limit.sweep_grace_secs {
        config.rate_limit.sweep_grace = secs(grace);
    }
    for (identity, entry) in &toml.rate_limit.policies {
        let policy = match config.rate_limit.policies.get(identity) {
            Some(existing) => RateLimitPolicy {
                window_secs: entry.window_secs.unwrap_or(existing.window_secs),
                max_requests: entry.max_requests.unwrap_or(existing.max_requests),
                prefix: entry.prefix.clone().unwrap_or_else(|| existing.prefix.clone()),
            },
            None => {
                let (Some(window_secs), Some(max_requests)) = (entry.window_secs, entry.max_requests)
                else {
                    return Err(ConfigError::ValidationError(format!(
                        "rate limit policy '{identity}' needs window_secs and max_requests"
                    )));
                };
                RateLimitPolicy {
                    window_secs,
                    max_requests,
                    prefix: entry
                        .prefix
                        .clone()
                        .unwrap_or_else(|| format!("ratelimit:{identity}")),
                }
            }
        };
        config.rate_limit.policies.insert(identity.clone(), policy);
    }

    // Resilience
    if let Some(threshold) = toml.resilience.failure_threshold {
        config.resilience.failure_threshold = threshold;
    }
    if let Some(cooldown) = toml.resilience.cooldown_secs {
        config.resilience.cooldown = secs(cooldown);
    }
    if let Some(attempts) = toml.resilience.max_attempts {
        config.resilience.max_attempts = attempts;
    }
    if let Some(ms) = toml.resilience.attempt_delay_ms {
        config.resilience.attempt_delay = Duration::from_millis(ms);
    }

    // Remote
    if let Some(url) = toml.remote.url.as_ref().filter(|u| !u.trim().is_empty()) {
        config.remote = Some(RemoteConfig {
            url: url.clone(),
            api_key: toml.remote.api_key.clone(),
            timeout: toml.remote.timeout_secs.map_or(REMOTE_TIMEOUT, secs),
        });
    }

    // Flags
    if let Some(enabled) = toml.flags.use_remote_service {
        config.use_remote_service = enabled;
    }

    Ok(())
}

fn parse_bool(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut ZoneCheckConfigFile, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(url) = var(ENV_SOURCE_URL) {
        config.dataset = DatasetLocation::Url(url);
        config.source = ConfigSource::Env;
    } else if let Some(file) = var(ENV_SOURCE_FILE) {
        config.dataset = DatasetLocation::File(PathBuf::from(file));
        config.source = ConfigSource::Env;
    }

    if let Some(url) = var(ENV_STORE_URL) {
        config.store_url = Some(url);
        config.source = ConfigSource::Env;
    }

    if let Some(ttl) = var(ENV_CACHE_TTL) {
        if let Ok(secs) = ttl.parse::<u64>() {
            config.cache.ttl = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(property) = var(ENV_ZONE_ID_PROPERTY) {
        config.cache.id_property = property;
        config.source = ConfigSource::Env;
    }

    if let Some(enabled) = var(ENV_RATE_LIMIT_ENABLED) {
        config.rate_limit.enabled = parse_bool(&enabled);
        config.source = ConfigSource::Env;
    }

    if let Some(url) = var(ENV_REMOTE_URL) {
        let remote = config.remote.get_or_insert_with(|| RemoteConfig {
            url: String::new(),
            api_key: None,
            timeout: REMOTE_TIMEOUT,
        });
        remote.url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(key) = var(ENV_REMOTE_API_KEY) {
        if let Some(remote) = config.remote.as_mut() {
            remote.api_key = Some(key);
            config.source = ConfigSource::Env;
        }
    }

    if let Some(enabled) = var(ENV_USE_REMOTE_SERVICE) {
        config.use_remote_service = parse_bool(&enabled);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Dataset URL override
    pub source_url: Option<String>,

    /// Dataset file override
    pub source_file: Option<PathBuf>,

    /// Store URL override
    pub store_url: Option<String>,

    /// Remote preference override
    pub use_remote_service: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set dataset URL override
    #[must_use]
    pub fn with_source_url(mut self, url: String) -> Self {
        self.source_url = Some(url);
        self
    }

    /// Set dataset file override
    #[must_use]
    pub fn with_source_file(mut self, path: PathBuf) -> Self {
        self.source_file = Some(path);
        self
    }

    /// Set store URL override
    #[must_use]
    pub fn with_store_url(mut self, url: String) -> Self {
        self.store_url = Some(url);
        self
    }

    /// Set remote preference override
    #[must_use]
    pub fn with_use_remote_service(mut self, enabled: bool) -> Self {
        self.use_remote_service = Some(enabled);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ZoneCheckConfigFile) {
        if self.source_url.is_some()
            || self.source_file.is_some()
            || self.store_url.is_some()
            || self.use_remote_service.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref url) = self.source_url {
            config.dataset = DatasetLocation::Url(url.clone());
        } else if let Some(ref path) = self.source_file {
            config.dataset = DatasetLocation::File(path.clone());
        }

        if let Some(ref url) = self.store_url {
            config.store_url = Some(url.clone());
        }

        if let Some(enabled) = self.use_remote_service {
            config.use_remote_service = enabled;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
