//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use super::backend::RateLimiterBackend;
use super::counter::{Algorithm, RateWindowEntry};
use super::key::KeyGenerator;
use crate::clock::{window_millis, Clock, SystemClock};
use crate::config::RateLimitSettings;
use crate::error::Violation;
use crate::store::{self, Expiring};

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u64,
    /// Seconds until the window ends, set only on rejection
    pub retry_after: Option<u64>,
}

impl RateDecision {
    fn admitted(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: None,
        }
    }

    fn rejected(retry_after: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after: Some(retry_after),
        }
    }

    /// The rejection reason, if any.
    pub fn violation(&self) -> Option<Violation> {
        if self.allowed {
            None
        } else {
            Some(Violation::RateLimited {
                retry_after: self.retry_after.unwrap_or(0),
            })
        }
    }
}

/// Thresholds that administrative calls may change at runtime.
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_requests: u64,
    window: Duration,
}

/// Per-identifier short-window request limiter.
///
/// This struct is thread-safe and can be shared across tasks. Each check is
/// a single read-modify-write under the map's per-key lock, so concurrent
/// callers cannot over-admit. Limits are per process: several instances
/// behind a load balancer each enforce their own budget.
pub struct RateLimiter {
    /// Window state indexed by derived key
    entries: DashMap<String, RateWindowEntry>,
    limits: RwLock<Limits>,
    algorithm: Algorithm,
    max_entries: usize,
    key_generator: KeyGenerator,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter from settings.
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            entries: DashMap::new(),
            limits: RwLock::new(Limits {
                max_requests: settings.max_requests,
                window: settings.window(),
            }),
            algorithm: settings.algorithm,
            max_entries: settings.max_entries.max(1),
            key_generator: KeyGenerator::identity(),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Use a custom identifier-to-key mapping.
    pub fn with_key_generator(mut self, key_generator: KeyGenerator) -> Self {
        self.key_generator = key_generator;
        self
    }

    /// Read time from the given clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check whether a request from `identifier` is admitted, counting it if so.
    pub fn is_allowed(&self, identifier: &str) -> RateDecision {
        let key = self.key_generator.derive(identifier);
        let now = self.clock.now_millis();
        let Limits {
            max_requests,
            window,
        } = *self.limits.read();
        let window_ms = window_millis(window);

        if !self.entries.contains_key(&key) {
            store::make_room(&self.entries, self.max_entries, now);
        }

        match self.entries.entry(key) {
            Entry::Vacant(vacant) => {
                trace!(key = %vacant.key(), window_ms, "Opening rate window");
                vacant.insert(RateWindowEntry::open(now, window_ms));
                RateDecision::admitted(max_requests.saturating_sub(1))
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();

                if entry.is_expired(now) {
                    *entry = RateWindowEntry::open(now, window_ms);
                    return RateDecision::admitted(max_requests.saturating_sub(1));
                }

                match self.algorithm {
                    Algorithm::Fixed => entry.last_request_at = now,
                    Algorithm::Sliding => entry.decay(now, window_ms, max_requests),
                }

                if entry.try_admit(max_requests) {
                    RateDecision::admitted(entry.remaining(max_requests))
                } else {
                    RateDecision::rejected(entry.retry_after_secs(now))
                }
            }
        }
    }

    /// Change the per-window request ceiling. Applies from the next check.
    pub fn update_max_requests(&self, max_requests: u64) {
        self.limits.write().max_requests = max_requests;
    }

    /// Change the window length. Live windows keep their original end.
    pub fn update_window(&self, window: Duration) {
        self.limits.write().window = window;
    }

    /// Forget the window for `identifier`.
    pub fn reset(&self, identifier: &str) {
        let key = self.key_generator.derive(identifier);
        self.entries.remove(&key);
    }

    /// Forget every window.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop windows that have already ended. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        store::purge_expired(&self.entries, self.clock.now_millis())
    }

    /// Current window state for `identifier`, if any.
    pub fn entry(&self, identifier: &str) -> Option<RateWindowEntry> {
        let key = self.key_generator.derive(identifier);
        self.entries.get(&key).map(|e| *e)
    }

    pub fn max_requests(&self) -> u64 {
        self.limits.read().max_requests
    }

    pub fn window(&self) -> Duration {
        self.limits.read().window
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitSettings::default())
    }
}

impl RateLimiterBackend for RateLimiter {
    fn is_allowed(&self, identifier: &str) -> RateDecision {
        RateLimiter::is_allowed(self, identifier)
    }

    fn update_max_requests(&self, max_requests: u64) {
        RateLimiter::update_max_requests(self, max_requests)
    }

    fn update_window(&self, window: Duration) {
        RateLimiter::update_window(self, window)
    }

    fn reset(&self, identifier: &str) {
        RateLimiter::reset(self, identifier)
    }

    fn clear(&self) {
        RateLimiter::clear(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max_requests: u64, window_ms: u64, algorithm: Algorithm) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let settings = RateLimitSettings {
            max_requests,
            window_ms,
            algorithm,
            ..RateLimitSettings::default()
        };
        let limiter = RateLimiter::new(&settings).with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::default();
        assert!(limiter.is_empty());
        assert_eq!(limiter.max_requests(), 100);
        assert_eq!(limiter.algorithm(), Algorithm::Fixed);
    }

    #[test]
    fn test_remaining_decreases_until_rejection() {
        let (limiter, _clock) = limiter(3, 1_000, Algorithm::Fixed);

        let remaining: Vec<u64> = (0..3).map(|_| limiter.is_allowed("client1").remaining).collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let rejected = limiter.is_allowed("client1");
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.retry_after, Some(1));
        assert!(matches!(
            rejected.violation(),
            Some(Violation::RateLimited { retry_after: 1 })
        ));
    }

    #[test]
    fn test_retry_after_counts_down() {
        let (limiter, clock) = limiter(1, 10_000, Algorithm::Fixed);

        assert!(limiter.is_allowed("c").allowed);
        clock.advance(Duration::from_millis(2_500));

        let rejected = limiter.is_allowed("c");
        assert_eq!(rejected.retry_after, Some(8));
    }

    #[test]
    fn test_window_expiry_opens_fresh_window() {
        let (limiter, clock) = limiter(2, 1_000, Algorithm::Fixed);

        assert!(limiter.is_allowed("c").allowed);
        assert!(limiter.is_allowed("c").allowed);
        assert!(!limiter.is_allowed("c").allowed);

        clock.advance(Duration::from_millis(1_000));
        assert!(!limiter.is_allowed("c").allowed, "window end is inclusive");

        clock.advance(Duration::from_millis(1));
        let decision = limiter.is_allowed("c");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(limiter.entry("c").unwrap().count, 1);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let (limiter, _clock) = limiter(1, 1_000, Algorithm::Fixed);

        assert!(limiter.is_allowed("a").allowed);
        assert!(!limiter.is_allowed("a").allowed);
        assert!(limiter.is_allowed("b").allowed);
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_key_generator_shares_budget() {
        let clock = ManualClock::new(0);
        let settings = RateLimitSettings {
            max_requests: 2,
            window_ms: 1_000,
            ..RateLimitSettings::default()
        };
        let limiter = RateLimiter::new(&settings)
            .with_clock(Arc::new(clock))
            .with_key_generator(KeyGenerator::new(|id| {
                id.split('/').next().unwrap_or(id).to_string()
            }));

        assert!(limiter.is_allowed("acme/1").allowed);
        assert!(limiter.is_allowed("acme/2").allowed);
        assert!(!limiter.is_allowed("acme/3").allowed);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_reset_behaves_like_new_identifier() {
        let (limiter, _clock) = limiter(2, 1_000, Algorithm::Fixed);

        let fresh = limiter.is_allowed("never-seen");

        limiter.is_allowed("c");
        limiter.is_allowed("c");
        assert!(!limiter.is_allowed("c").allowed);

        limiter.reset("c");
        assert_eq!(limiter.is_allowed("c"), fresh);
    }

    #[test]
    fn test_clear() {
        let (limiter, _clock) = limiter(2, 1_000, Algorithm::Fixed);
        limiter.is_allowed("a");
        limiter.is_allowed("b");
        assert_eq!(limiter.len(), 2);

        limiter.clear();
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_update_max_requests_applies_to_live_window() {
        let (limiter, _clock) = limiter(1, 1_000, Algorithm::Fixed);

        assert!(limiter.is_allowed("c").allowed);
        assert!(!limiter.is_allowed("c").allowed);

        limiter.update_max_requests(3);
        assert_eq!(limiter.max_requests(), 3);

        let decision = limiter.is_allowed("c");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn test_update_window_does_not_move_live_window() {
        let (limiter, clock) = limiter(1, 1_000, Algorithm::Fixed);

        limiter.is_allowed("c");
        let expires_at = limiter.entry("c").unwrap().expires_at;

        limiter.update_window(Duration::from_secs(60));
        assert_eq!(limiter.entry("c").unwrap().expires_at, expires_at);

        clock.advance(Duration::from_millis(1_001));
        limiter.is_allowed("c");
        assert_eq!(
            limiter.entry("c").unwrap().expires_at,
            clock.now_millis() + 60_000
        );
    }

    #[test]
    fn test_sliding_updates_last_request_on_rejection() {
        let (limiter, clock) = limiter(1, 1_000, Algorithm::Sliding);

        assert!(limiter.is_allowed("c").allowed);
        clock.advance(Duration::from_millis(400));
        assert!(!limiter.is_allowed("c").allowed);

        assert_eq!(limiter.entry("c").unwrap().last_request_at, clock.now_millis());
    }

    #[test]
    fn test_sliding_decays_at_window_boundary() {
        let (limiter, clock) = limiter(2, 1_000, Algorithm::Sliding);

        assert!(limiter.is_allowed("c").allowed);
        assert!(limiter.is_allowed("c").allowed);
        assert!(!limiter.is_allowed("c").allowed);

        // A full window since the last request, but the window end itself
        // has not passed yet: decay forgives the whole count.
        clock.advance(Duration::from_millis(1_000));
        let decision = limiter.is_allowed("c");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn test_fixed_does_not_decay_at_window_boundary() {
        let (limiter, clock) = limiter(2, 1_000, Algorithm::Fixed);

        limiter.is_allowed("c");
        limiter.is_allowed("c");
        clock.advance(Duration::from_millis(1_000));
        assert!(!limiter.is_allowed("c").allowed);
    }

    #[test]
    fn test_capacity_bound_evicts_least_recent() {
        let clock = ManualClock::new(0);
        let settings = RateLimitSettings {
            max_requests: 5,
            window_ms: 60_000,
            max_entries: 2,
            ..RateLimitSettings::default()
        };
        let limiter = RateLimiter::new(&settings).with_clock(Arc::new(clock.clone()));

        limiter.is_allowed("a");
        clock.advance(Duration::from_millis(10));
        limiter.is_allowed("b");
        clock.advance(Duration::from_millis(10));
        limiter.is_allowed("a");
        clock.advance(Duration::from_millis(10));
        limiter.is_allowed("c");

        assert_eq!(limiter.len(), 2);
        assert!(limiter.entry("a").is_some());
        assert!(limiter.entry("b").is_none());
        assert!(limiter.entry("c").is_some());
    }

    #[test]
    fn test_purge_expired() {
        let (limiter, clock) = limiter(5, 1_000, Algorithm::Fixed);
        limiter.is_allowed("a");
        clock.advance(Duration::from_millis(600));
        limiter.is_allowed("b");
        clock.advance(Duration::from_millis(600));

        assert_eq!(limiter.purge_expired(), 1);
        assert!(limiter.entry("a").is_none());
        assert!(limiter.entry("b").is_some());
    }
}
