//! Admission pipeline composed from the individual checks.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::clock::{Clock, SystemClock};
use crate::config::GateConfig;
use crate::error::Violation;
use crate::events::{default_sink, EventSink};
use crate::headers::HeaderValidator;
use crate::quota::{QuotaDecision, QuotaManager};
use crate::ratelimit::{LoggedRateLimiter, RateDecision, RateLimiter, RateLimiterBackend};
use crate::replay::ReplayGuard;

/// A signed payload presented for one-time use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayload {
    pub payload: String,
    /// Epoch millis the payload was signed at
    pub timestamp: i64,
    /// Lowercase hex HMAC of `"{payload}:{timestamp}"`
    pub signature: String,
}

/// Everything the gate needs to know about one inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// API key, client address, or other caller identity
    pub identifier: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub signed: Option<SignedPayload>,
    /// Quota units this request consumes
    #[serde(default = "default_cost")]
    pub cost: u64,
}

fn default_cost() -> u64 {
    1
}

impl AdmissionRequest {
    /// A request with no headers, no body, and a cost of one.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            headers: HashMap::new(),
            body: String::new(),
            signed: None,
            cost: default_cost(),
        }
    }
}

/// The check that rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Headers,
    Replay,
    RateLimit,
    Quota,
}

/// Result of running a request through the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Every enabled check passed.
    Admitted {
        rate: Option<RateDecision>,
        quota: Option<QuotaDecision>,
    },
    /// A check failed; later checks were not run.
    Rejected { stage: Stage, violation: Violation },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }

    pub fn violation(&self) -> Option<&Violation> {
        match self {
            Admission::Admitted { .. } => None,
            Admission::Rejected { violation, .. } => Some(violation),
        }
    }
}

/// Runs requests through headers → replay → rate limit → quota, stopping at
/// the first rejection.
///
/// Each stage is optional. Stages that ran before a rejection keep their
/// side effects: a request rejected by its quota has still used a slot of
/// its rate window.
pub struct AdmissionGate {
    headers: Option<HeaderValidator>,
    replay: Option<ReplayGuard>,
    rate_limiter: Option<LoggedRateLimiter<RateLimiter>>,
    quota: Option<QuotaManager>,
}

impl AdmissionGate {
    /// Build a gate from configuration using the system clock and `tracing`.
    pub fn from_config(config: &GateConfig) -> Self {
        Self::from_config_with(config, Arc::new(SystemClock::new()), default_sink())
    }

    /// Build a gate from configuration with an explicit clock and sink.
    pub fn from_config_with(
        config: &GateConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            headers: config
                .headers
                .as_ref()
                .map(|s| HeaderValidator::build(s, clock.clone(), sink.clone())),
            replay: config
                .replay
                .as_ref()
                .map(|s| ReplayGuard::build(s, clock.clone(), sink.clone())),
            rate_limiter: config.rate_limit.as_ref().map(|s| {
                LoggedRateLimiter::with_sink(
                    RateLimiter::new(s).with_clock(clock.clone()),
                    sink.clone(),
                )
            }),
            quota: config
                .quota
                .as_ref()
                .map(|s| QuotaManager::build(s, clock.clone(), sink.clone())),
        }
    }

    /// Decide whether to admit `request`.
    #[instrument(skip(self, request), fields(identifier = %request.identifier))]
    pub fn admit(&self, request: &AdmissionRequest) -> Admission {
        if let Some(validator) = &self.headers {
            let result = validator.validate(&request.headers, &request.body);
            if let Some(violation) = result.reason {
                return Admission::Rejected {
                    stage: Stage::Headers,
                    violation,
                };
            }
        }

        if let Some(guard) = &self.replay {
            let Some(signed) = &request.signed else {
                return Admission::Rejected {
                    stage: Stage::Replay,
                    violation: Violation::MissingSignature,
                };
            };

            let result = guard.verify(
                &request.identifier,
                &signed.payload,
                signed.timestamp,
                &signed.signature,
            );
            if let Some(violation) = result.reason {
                return Admission::Rejected {
                    stage: Stage::Replay,
                    violation,
                };
            }
        }

        let rate = match &self.rate_limiter {
            Some(limiter) => {
                let decision = limiter.is_allowed(&request.identifier);
                if let Some(violation) = decision.violation() {
                    return Admission::Rejected {
                        stage: Stage::RateLimit,
                        violation,
                    };
                }
                Some(decision)
            }
            None => None,
        };

        let quota = match &self.quota {
            Some(manager) => {
                let decision = manager.check_quota(&request.identifier, request.cost);
                if let Some(violation) = decision.reason.clone() {
                    return Admission::Rejected {
                        stage: Stage::Quota,
                        violation,
                    };
                }
                Some(decision)
            }
            None => None,
        };

        Admission::Admitted { rate, quota }
    }

    pub fn headers(&self) -> Option<&HeaderValidator> {
        self.headers.as_ref()
    }

    pub fn replay(&self) -> Option<&ReplayGuard> {
        self.replay.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&LoggedRateLimiter<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn quota(&self) -> Option<&QuotaManager> {
        self.quota.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{QuotaSettings, RateLimitSettings};
    use crate::events::MemorySink;

    fn gate(config: &GateConfig) -> AdmissionGate {
        AdmissionGate::from_config_with(
            config,
            Arc::new(ManualClock::new(1_000)),
            Arc::new(MemorySink::new()),
        )
    }

    #[test]
    fn test_empty_gate_admits_everything() {
        let gate = gate(&GateConfig::default());
        let admission = gate.admit(&AdmissionRequest::new("anyone"));
        assert_eq!(
            admission,
            Admission::Admitted {
                rate: None,
                quota: None
            }
        );
    }

    #[test]
    fn test_rate_limit_stage() {
        let config = GateConfig {
            rate_limit: Some(RateLimitSettings {
                max_requests: 1,
                ..RateLimitSettings::default()
            }),
            ..GateConfig::default()
        };
        let gate = gate(&config);
        let request = AdmissionRequest::new("c");

        assert!(gate.admit(&request).is_admitted());
        match gate.admit(&request) {
            Admission::Rejected { stage, violation } => {
                assert_eq!(stage, Stage::RateLimit);
                assert_eq!(violation.to_string(), "Rate limit exceeded");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_quota_uses_request_cost() {
        let config = GateConfig {
            quota: Some(QuotaSettings {
                max_quota: 5,
                ..QuotaSettings::default()
            }),
            ..GateConfig::default()
        };
        let gate = gate(&config);

        let mut request = AdmissionRequest::new("c");
        request.cost = 3;
        assert!(gate.admit(&request).is_admitted());

        let rejected = gate.admit(&request);
        assert_eq!(rejected.violation(), Some(&Violation::QuotaExceeded));
        assert_eq!(gate.quota().unwrap().usage("c").unwrap().used, 3);
    }

    #[test]
    fn test_replay_stage_requires_signed_payload() {
        let config = GateConfig::from_yaml("replay:\n  secret: s\n").unwrap();
        let gate = gate(&config);

        match gate.admit(&AdmissionRequest::new("c")) {
            Admission::Rejected { stage, violation } => {
                assert_eq!(stage, Stage::Replay);
                assert_eq!(violation, Violation::MissingSignature);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: AdmissionRequest = serde_json::from_str(r#"{"identifier":"c"}"#).unwrap();
        assert_eq!(request, AdmissionRequest::new("c"));
    }
}
