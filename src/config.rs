//! Configuration management for Tollgate.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GateError, Result};
use crate::ratelimit::Algorithm;

/// Prefix for environment overrides, e.g. `TOLLGATE__QUOTA__MAX_QUOTA=500`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Top-level configuration. A component is enabled when its section is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Short-window request rate limiting
    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,

    /// Long-window usage quotas
    #[serde(default)]
    pub quota: Option<QuotaSettings>,

    /// Header freshness and authenticity checks
    #[serde(default)]
    pub headers: Option<HeaderSettings>,

    /// One-time-use enforcement for signed payloads
    #[serde(default)]
    pub replay: Option<ReplaySettings>,

    /// Log output for the binary
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Requests admitted per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Window length in milliseconds
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,

    /// Counting algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Upper bound on tracked keys
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_rate_window_ms(),
            algorithm: Algorithm::default(),
            max_entries: default_max_entries(),
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Quota manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSettings {
    /// Units of usage allowed per window
    #[serde(default = "default_max_quota")]
    pub max_quota: u64,

    /// Window length in milliseconds
    #[serde(default = "default_quota_window_ms")]
    pub window_ms: u64,

    /// Upper bound on tracked identifiers
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            max_quota: default_max_quota(),
            window_ms: default_quota_window_ms(),
            max_entries: default_max_entries(),
        }
    }
}

impl QuotaSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Header validator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSettings {
    /// Header names that must be present and non-empty
    #[serde(default)]
    pub required: Vec<String>,

    /// Header carrying the request timestamp (epoch millis)
    #[serde(default = "default_timestamp_header")]
    pub timestamp_header: String,

    /// Header carrying the hex HMAC signature
    #[serde(default = "default_signature_header")]
    pub signature_header: String,

    /// Maximum tolerated clock skew in milliseconds
    #[serde(default = "default_allowed_drift_ms")]
    pub allowed_drift_ms: u64,

    /// Shared secret; without it only freshness is checked
    #[serde(default)]
    pub hmac_secret: Option<String>,
}

impl Default for HeaderSettings {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            timestamp_header: default_timestamp_header(),
            signature_header: default_signature_header(),
            allowed_drift_ms: default_allowed_drift_ms(),
            hmac_secret: None,
        }
    }
}

impl HeaderSettings {
    pub fn allowed_drift(&self) -> Duration {
        Duration::from_millis(self.allowed_drift_ms)
    }
}

/// Replay guard settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySettings {
    /// Shared secret used to verify payload signatures
    pub secret: String,

    /// Maximum age (and future skew) of a signed payload in milliseconds
    #[serde(default = "default_replay_window_ms")]
    pub window_ms: u64,

    /// Number of consumed signatures remembered
    #[serde(default = "default_store_size")]
    pub store_size: usize,
}

impl ReplaySettings {
    /// Settings with the given secret and default window and store size.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            window_ms: default_replay_window_ms(),
            store_size: default_store_size(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings for the binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_max_requests() -> u64 {
    100
}

fn default_rate_window_ms() -> u64 {
    60_000
}

fn default_max_entries() -> usize {
    100_000
}

fn default_max_quota() -> u64 {
    10_000
}

fn default_quota_window_ms() -> u64 {
    86_400_000
}

fn default_timestamp_header() -> String {
    "x-timestamp".to_string()
}

fn default_signature_header() -> String {
    "x-signature".to_string()
}

fn default_allowed_drift_ms() -> u64 {
    300_000
}

fn default_replay_window_ms() -> u64 {
    300_000
}

fn default_store_size() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GateConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GateConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, layered with `TOLLGATE__*`
    /// environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading gate configuration");

        if !path.exists() {
            return Err(GateError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let layered = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: GateConfig = layered.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a component meaningless.
    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = &self.rate_limit {
            if rate.window_ms == 0 {
                return Err(GateError::Config("rate_limit.window_ms must be > 0".into()));
            }
            if rate.max_entries == 0 {
                return Err(GateError::Config("rate_limit.max_entries must be > 0".into()));
            }
        }

        if let Some(quota) = &self.quota {
            if quota.window_ms == 0 {
                return Err(GateError::Config("quota.window_ms must be > 0".into()));
            }
            if quota.max_entries == 0 {
                return Err(GateError::Config("quota.max_entries must be > 0".into()));
            }
        }

        if let Some(headers) = &self.headers {
            if headers.timestamp_header.is_empty() {
                return Err(GateError::Config("headers.timestamp_header must not be empty".into()));
            }
            if matches!(&headers.hmac_secret, Some(secret) if secret.is_empty()) {
                return Err(GateError::Config(
                    "headers.hmac_secret must not be empty when set".into(),
                ));
            }
        }

        if let Some(replay) = &self.replay {
            if replay.secret.is_empty() {
                return Err(GateError::Config("replay.secret must not be empty".into()));
            }
            if replay.window_ms == 0 {
                return Err(GateError::Config("replay.window_ms must be > 0".into()));
            }
            if replay.store_size == 0 {
                return Err(GateError::Config("replay.store_size must be > 0".into()));
            }
        }

        Ok(())
    }
}
