//! One-time-use enforcement for signed payloads.
//!
//! A payload is accepted once: it must be fresh, carry a valid HMAC, and
//! present a signature that has not been seen before. Seen signatures live in
//! a bounded cache that forgets the oldest insertion first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{trace, Level};

use crate::clock::{window_millis, Clock, SystemClock};
use crate::config::ReplaySettings;
use crate::events::{default_sink, EventSink};
use crate::error::Violation;
use crate::signing;

/// Outcome of a replay check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayDecision {
    pub allowed: bool,
    pub identifier: String,
    pub reason: Option<Violation>,
}

/// Consumed signatures, remembered in insertion order.
///
/// Eviction drops the signature inserted longest ago, regardless of whether
/// it was looked up since. This approximates recency without the cost of
/// reordering on every hit.
#[derive(Debug)]
pub struct SignatureCache {
    seen: HashMap<String, i64>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SignatureCache {
    /// Create an empty cache holding at most `capacity` signatures.
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.seen.contains_key(signature)
    }

    /// When `signature` was first recorded, in epoch millis.
    pub fn first_seen(&self, signature: &str) -> Option<i64> {
        self.seen.get(signature).copied()
    }

    /// Record a signature. Returns the evicted signature, if any.
    ///
    /// Returns `None` without touching the cache if the signature is
    /// already present.
    pub fn insert(&mut self, signature: String, seen_at: i64) -> Option<String> {
        if self.seen.contains_key(&signature) {
            return None;
        }

        self.seen.insert(signature.clone(), seen_at);
        self.order.push_back(signature);

        if self.seen.len() > self.capacity {
            let oldest = self.order.pop_front()?;
            self.seen.remove(&oldest);
            return Some(oldest);
        }
        None
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Rejects stale, forged, or repeated signed payloads.
///
/// The freshness window applies in both directions, so payloads stamped too
/// far in the future are rejected as well. The uniqueness check and the
/// insert happen under one lock: two concurrent submissions of the same
/// signature cannot both pass.
pub struct ReplayGuard {
    secret: RwLock<String>,
    window: Duration,
    cache: Mutex<SignatureCache>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

impl ReplayGuard {
    /// Create a replay guard from settings.
    pub fn new(settings: &ReplaySettings) -> Self {
        Self::build(settings, Arc::new(SystemClock::new()), default_sink())
    }

    /// Create a replay guard with an explicit clock and event sink.
    pub fn build(settings: &ReplaySettings, clock: Arc<dyn Clock>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            secret: RwLock::new(settings.secret.clone()),
            window: settings.window(),
            cache: Mutex::new(SignatureCache::new(settings.store_size)),
            clock,
            sink,
        }
    }

    /// Verify a signed payload and consume its signature.
    pub fn verify(
        &self,
        identifier: &str,
        payload: &str,
        timestamp: i64,
        signature: &str,
    ) -> ReplayDecision {
        let now = self.clock.now_millis();

        if now.abs_diff(timestamp) > window_millis(self.window) as u64 {
            return self.reject(identifier, "stale timestamp", Violation::ExpiredTimestamp);
        }

        let expected = {
            let secret = self.secret.read();
            signing::sign(
                secret.as_bytes(),
                &signing::replay_message(payload, timestamp),
            )
        };

        if !signing::signatures_match(&expected, signature) {
            return self.reject(identifier, "invalid signature", Violation::InvalidSignature);
        }

        let evicted = {
            let mut cache = self.cache.lock();
            if cache.contains(signature) {
                drop(cache);
                return self.reject(identifier, "reused signature", Violation::SignatureReused);
            }
            cache.insert(signature.to_string(), now)
        };

        if let Some(oldest) = evicted {
            trace!(signature = %oldest, "Evicted oldest signature from replay cache");
        }

        self.sink.emit(
            Level::DEBUG,
            "Replay check passed",
            &[("identifier", identifier.to_string())],
        );

        ReplayDecision {
            allowed: true,
            identifier: identifier.to_string(),
            reason: None,
        }
    }

    fn reject(&self, identifier: &str, cause: &str, reason: Violation) -> ReplayDecision {
        self.sink.emit(
            Level::WARN,
            &format!("Replay rejected ({})", cause),
            &[("identifier", identifier.to_string())],
        );

        ReplayDecision {
            allowed: false,
            identifier: identifier.to_string(),
            reason: Some(reason),
        }
    }

    /// Forget every consumed signature.
    pub fn clear(&self) {
        self.cache.lock().clear();
        self.sink.emit(Level::INFO, "Replay signature store cleared", &[]);
    }

    /// Replace the signing secret. Consumed signatures stay remembered.
    pub fn rotate_secret(&self, secret: impl Into<String>) {
        *self.secret.write() = secret.into();
        self.sink.emit(Level::INFO, "Rotated replay signing secret", &[]);
    }

    /// Whether `signature` has already been consumed.
    pub fn is_consumed(&self, signature: &str) -> bool {
        self.cache.lock().contains(signature)
    }

    /// Number of remembered signatures.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::MemorySink;

    const NOW: i64 = 1_700_000_000_000;

    fn guard(store_size: usize) -> (ReplayGuard, ManualClock, Arc<MemorySink>) {
        let clock = ManualClock::new(NOW);
        let sink = Arc::new(MemorySink::new());
        let settings = ReplaySettings {
            secret: "testsecret".to_string(),
            window_ms: 5_000,
            store_size,
        };
        let guard = ReplayGuard::build(&settings, Arc::new(clock.clone()), sink.clone());
        (guard, clock, sink)
    }

    fn sig(payload: &str, timestamp: i64) -> String {
        signing::sign(b"testsecret", &format!("{}:{}", payload, timestamp))
    }

    #[test]
    fn test_first_use_allowed_second_rejected() {
        let (guard, _clock, _sink) = guard(1000);
        let signature = sig("data", NOW);

        let first = guard.verify("client3", "data", NOW, &signature);
        assert!(first.allowed);
        assert_eq!(first.identifier, "client3");

        let second = guard.verify("client3", "data", NOW, &signature);
        assert!(!second.allowed);
        assert_eq!(second.reason.unwrap().to_string(), "Signature already used");
    }

    #[test]
    fn test_stale_timestamp_rejected_before_signature() {
        let (guard, _clock, _sink) = guard(1000);
        let old = NOW - 10_000;

        let valid = guard.verify("c", "data", old, &sig("data", old));
        assert_eq!(valid.reason, Some(Violation::ExpiredTimestamp));

        let forged = guard.verify("c", "data", old, "bad");
        assert_eq!(forged.reason, Some(Violation::ExpiredTimestamp));
        assert!(guard.is_empty());
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let (guard, _clock, _sink) = guard(1000);
        let ahead = NOW + 5_001;
        let result = guard.verify("c", "data", ahead, &sig("data", ahead));
        assert_eq!(result.reason, Some(Violation::ExpiredTimestamp));
    }

    #[test]
    fn test_window_edge_is_inclusive() {
        let (guard, _clock, _sink) = guard(1000);
        let edge = NOW - 5_000;
        assert!(guard.verify("c", "data", edge, &sig("data", edge)).allowed);
    }

    #[test]
    fn test_malformed_signatures_rejected_without_panic() {
        let (guard, _clock, _sink) = guard(1000);
        let good = sig("data", NOW);
        let upper = good.to_uppercase();
        let inputs: [&str; 5] = ["", "zz", &good[..63], &upper, "ä"];

        for bad in inputs {
            let result = guard.verify("c", "data", NOW, bad);
            assert_eq!(result.reason, Some(Violation::InvalidSignature), "input {:?}", bad);
        }
        assert!(guard.is_empty());
    }

    #[test]
    fn test_signature_bound_to_payload() {
        let (guard, _clock, _sink) = guard(1000);
        let result = guard.verify("c", "other", NOW, &sig("data", NOW));
        assert_eq!(result.reason, Some(Violation::InvalidSignature));
    }

    #[test]
    fn test_capacity_evicts_first_inserted() {
        let (guard, clock, _sink) = guard(3);

        let signatures: Vec<String> = (0..4).map(|i| sig(&format!("p{}", i), NOW)).collect();
        for (i, s) in signatures.iter().enumerate() {
            assert!(guard.verify("c", &format!("p{}", i), NOW, s).allowed);
            clock.advance(Duration::from_millis(1));
        }

        assert_eq!(guard.len(), 3);
        assert!(!guard.is_consumed(&signatures[0]));
        assert!(guard.is_consumed(&signatures[3]));

        // The evicted signature no longer blocks a repeat of itself.
        assert!(guard.verify("c", "p0", NOW, &signatures[0]).allowed);
        assert!(!guard.is_consumed(&signatures[1]));
    }

    #[test]
    fn test_clear() {
        let (guard, _clock, sink) = guard(1000);
        let signature = sig("data", NOW);

        guard.verify("c", "data", NOW, &signature);
        guard.clear();
        assert!(guard.is_empty());
        assert!(guard.verify("c", "data", NOW, &signature).allowed);
        assert_eq!(sink.at_level(Level::INFO).len(), 1);
    }

    #[test]
    fn test_rotate_secret() {
        let (guard, _clock, _sink) = guard(1000);
        guard.rotate_secret("newsecret");

        let result = guard.verify("c", "data", NOW, &sig("data", NOW));
        assert_eq!(result.reason, Some(Violation::InvalidSignature));

        let fresh = signing::sign(b"newsecret", &format!("data:{}", NOW));
        assert!(guard.verify("c", "data", NOW, &fresh).allowed);
    }

    #[test]
    fn test_events_by_outcome() {
        let (guard, _clock, sink) = guard(1000);
        let signature = sig("data", NOW);

        guard.verify("c", "data", NOW, &signature);
        guard.verify("c", "data", NOW, &signature);

        assert_eq!(sink.at_level(Level::DEBUG).len(), 1);
        let warn = sink.at_level(Level::WARN);
        assert_eq!(warn.len(), 1);
        assert_eq!(warn[0].message, "Replay rejected (reused signature)");
    }

    #[test]
    fn test_signature_cache_insert() {
        let mut cache = SignatureCache::new(2);
        assert_eq!(cache.insert("a".into(), 1), None);
        assert_eq!(cache.insert("a".into(), 2), None);
        assert_eq!(cache.first_seen("a"), Some(1));
        assert_eq!(cache.insert("b".into(), 3), None);
        assert_eq!(cache.insert("c".into(), 4), Some("a".to_string()));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.capacity(), 2);
    }
}
