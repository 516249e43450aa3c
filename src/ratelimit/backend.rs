//! Rate limiter trait for composing limiters with decorators.

use std::time::Duration;

use super::limiter::RateDecision;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the core `RateLimiter` so that cross-cutting
/// behavior (logging, metrics) can wrap it instead of subclassing it.
pub trait RateLimiterBackend: Send + Sync {
    /// Check and count a request from `identifier`.
    fn is_allowed(&self, identifier: &str) -> RateDecision;

    /// Change the per-window request ceiling.
    fn update_max_requests(&self, max_requests: u64);

    /// Change the window length for windows opened from now on.
    fn update_window(&self, window: Duration);

    /// Forget the window for `identifier`.
    fn reset(&self, identifier: &str);

    /// Forget every window.
    fn clear(&self);
}
