//! Error types for Tollgate.
//!
//! Two families live here. [`GateError`] covers the fallible setup paths
//! (loading and validating configuration). [`Violation`] is the rejection
//! taxonomy: it is carried inside decision values and never returned as `Err`.

use thiserror::Error;

/// Main error type for Tollgate setup operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration source errors
    #[error("Configuration source error: {0}")]
    Source(#[from] ::config::ConfigError),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, GateError>;

/// Coarse category of a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// Required header absent, or timestamp unparsable.
    MissingInput,
    /// Timestamp outside the allowed drift or replay window.
    FreshnessViolation,
    /// HMAC mismatch.
    AuthenticityViolation,
    /// Signature already consumed.
    UniquenessViolation,
    /// Rate or quota ceiling reached.
    LimitExceeded,
}

/// Why a request was rejected.
///
/// The `Display` output is the stable reason string reported to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("Missing required headers")]
    MissingHeaders(Vec<String>),

    #[error("Invalid timestamp format")]
    InvalidTimestamp,

    #[error("Timestamp drift too high")]
    TimestampDrift,

    #[error("Missing signature")]
    MissingSignature,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid or expired timestamp")]
    ExpiredTimestamp,

    #[error("Signature already used")]
    SignatureReused,

    #[error("Rate limit exceeded")]
    RateLimited {
        /// Seconds until the current window ends.
        retry_after: u64,
    },

    #[error("Quota exceeded")]
    QuotaExceeded,
}

impl Violation {
    /// Map this rejection onto its category.
    pub fn kind(&self) -> ViolationKind {
        match self {
            Violation::MissingHeaders(_)
            | Violation::InvalidTimestamp
            | Violation::MissingSignature => ViolationKind::MissingInput,
            Violation::TimestampDrift | Violation::ExpiredTimestamp => {
                ViolationKind::FreshnessViolation
            }
            Violation::InvalidSignature => ViolationKind::AuthenticityViolation,
            Violation::SignatureReused => ViolationKind::UniquenessViolation,
            Violation::RateLimited { .. } | Violation::QuotaExceeded => {
                ViolationKind::LimitExceeded
            }
        }
    }
}
