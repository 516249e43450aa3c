//! Freshness and authenticity checks on request headers.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::Level;

use crate::clock::{Clock, SystemClock};
use crate::config::HeaderSettings;
use crate::events::{default_sink, EventSink};
use crate::error::Violation;
use crate::signing;

/// Read access to a set of request headers.
///
/// Lookups try the exact name first and fall back to an ASCII
/// case-insensitive match.
pub trait HeaderLookup {
    fn header(&self, name: &str) -> Option<&str>;
}

impl<K, V, S> HeaderLookup for HashMap<K, V, S>
where
    K: Borrow<str> + Hash + Eq,
    V: AsRef<str>,
    S: BuildHasher,
{
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name)
            .or_else(|| {
                self.iter()
                    .find(|(k, _)| Borrow::<str>::borrow(*k).eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .map(|v| v.as_ref())
    }
}

impl<K, V> HeaderLookup for BTreeMap<K, V>
where
    K: Borrow<str> + Ord,
    V: AsRef<str>,
{
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name)
            .or_else(|| {
                self.iter()
                    .find(|(k, _)| Borrow::<str>::borrow(*k).eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .map(|v| v.as_ref())
    }
}

/// Outcome of header validation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderValidation {
    pub valid: bool,
    /// Required headers that were absent or empty
    pub missing: Vec<String>,
    pub reason: Option<Violation>,
}

impl HeaderValidation {
    fn passed() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    fn failed(reason: Violation) -> Self {
        let missing = match &reason {
            Violation::MissingHeaders(names) => names.clone(),
            _ => Vec::new(),
        };
        Self {
            valid: false,
            missing,
            reason: Some(reason),
        }
    }
}

struct Secrets {
    allowed_drift: Duration,
    hmac_secret: Option<String>,
}

/// Validates that a request's headers are complete, fresh, and signed.
///
/// Checks run in order and stop at the first failure:
/// 1. every required header is present and non-empty;
/// 2. the timestamp header parses as a number of epoch milliseconds;
/// 3. the timestamp is within `allowed_drift` of now, in either direction;
/// 4. if a secret is configured, the signature header equals
///    `HMAC-SHA256(secret, "{timestamp}:{body}")` in lowercase hex.
///
/// Without a secret the validator only checks presence and freshness.
pub struct HeaderValidator {
    required: Vec<String>,
    timestamp_header: String,
    signature_header: String,
    secrets: RwLock<Secrets>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

impl HeaderValidator {
    /// Create a validator from settings.
    pub fn new(settings: &HeaderSettings) -> Self {
        Self::build(settings, Arc::new(SystemClock::new()), default_sink())
    }

    /// Create a validator with an explicit clock and event sink.
    pub fn build(settings: &HeaderSettings, clock: Arc<dyn Clock>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            required: settings.required.clone(),
            timestamp_header: settings.timestamp_header.clone(),
            signature_header: settings.signature_header.clone(),
            secrets: RwLock::new(Secrets {
                allowed_drift: settings.allowed_drift(),
                hmac_secret: settings.hmac_secret.clone(),
            }),
            clock,
            sink,
        }
    }

    /// Validate `headers` against the configured checks.
    pub fn validate<H: HeaderLookup + ?Sized>(&self, headers: &H, body: &str) -> HeaderValidation {
        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|name| headers.header(name).map_or(true, str::is_empty))
            .cloned()
            .collect();

        if !missing.is_empty() {
            self.reject(&[("missing", missing.join(", "))], "Missing required headers");
            return HeaderValidation::failed(Violation::MissingHeaders(missing));
        }

        let timestamp = match headers.header(&self.timestamp_header).and_then(parse_timestamp) {
            Some(ts) => ts,
            None => {
                self.reject(&[], "Invalid timestamp format");
                return HeaderValidation::failed(Violation::InvalidTimestamp);
            }
        };

        let secrets = self.secrets.read();
        let now = self.clock.now_millis() as f64;
        let drift = (now - timestamp).abs();

        if drift > secrets.allowed_drift.as_millis() as f64 {
            self.reject(
                &[("drift_ms", format!("{}", drift))],
                "Timestamp drift too high",
            );
            return HeaderValidation::failed(Violation::TimestampDrift);
        }

        if let Some(secret) = &secrets.hmac_secret {
            let provided = match headers.header(&self.signature_header) {
                Some(sig) if !sig.is_empty() => sig,
                _ => {
                    self.reject(&[], "Missing signature");
                    return HeaderValidation::failed(Violation::MissingSignature);
                }
            };

            let rendered = render_timestamp(timestamp);
            let expected = signing::sign(
                secret.as_bytes(),
                &signing::header_message(&rendered, body),
            );

            if !signing::signatures_match(&expected, provided) {
                self.reject(&[("timestamp", rendered)], "Invalid signature");
                return HeaderValidation::failed(Violation::InvalidSignature);
            }
        }

        self.sink.emit(Level::DEBUG, "Header validation successful", &[]);
        HeaderValidation::passed()
    }

    fn reject(&self, context: &[(&str, String)], reason: &str) {
        self.sink.emit(
            Level::WARN,
            &format!("Header validation failed: {}", reason),
            context,
        );
    }

    /// Change the tolerated clock skew. Applies from the next validation.
    pub fn update_allowed_drift(&self, allowed_drift: Duration) {
        self.secrets.write().allowed_drift = allowed_drift;
        self.sink.emit(
            Level::INFO,
            "Updated header allowed drift",
            &[("allowed_drift_ms", allowed_drift.as_millis().to_string())],
        );
    }

    /// Replace the HMAC secret. `None` switches to freshness-only checks.
    pub fn rotate_secret(&self, secret: Option<String>) {
        let enabled = secret.is_some();
        self.secrets.write().hmac_secret = secret;
        self.sink.emit(
            Level::INFO,
            "Rotated header HMAC secret",
            &[("signing_enabled", enabled.to_string())],
        );
    }

    pub fn allowed_drift(&self) -> Duration {
        self.secrets.read().allowed_drift
    }

    /// Whether signatures are currently checked.
    pub fn signing_enabled(&self) -> bool {
        self.secrets.read().hmac_secret.is_some()
    }
}

/// Parse a decimal timestamp, rejecting NaN and infinities.
fn parse_timestamp(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().parse().ok()?;
    value.is_finite().then_some(value)
}

/// Render a parsed timestamp the way clients sign it: integral values carry
/// no fractional part.
fn render_timestamp(timestamp: f64) -> String {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if timestamp.fract() == 0.0 && timestamp.abs() < MAX_EXACT {
        format!("{}", timestamp as i64)
    } else {
        format!("{}", timestamp)
    }
}
