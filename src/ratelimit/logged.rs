//! Logging decorator for rate limiters.

use std::sync::Arc;
use std::time::Duration;

use tracing::Level;

use super::backend::RateLimiterBackend;
use super::limiter::{RateDecision, RateLimiter};
use crate::events::{default_sink, EventSink};

/// Wraps any [`RateLimiterBackend`] and reports its decisions and
/// administrative changes to an [`EventSink`].
///
/// Admissions are reported at debug, rejections at warn, and threshold
/// changes at info. The wrapped limiter's decisions pass through untouched.
pub struct LoggedRateLimiter<R: RateLimiterBackend = RateLimiter> {
    inner: R,
    sink: Arc<dyn EventSink>,
}

impl<R: RateLimiterBackend> LoggedRateLimiter<R> {
    /// Wrap a limiter, reporting to the default `tracing` sink.
    pub fn new(inner: R) -> Self {
        Self::with_sink(inner, default_sink())
    }

    /// Wrap a limiter, reporting to `sink`.
    pub fn with_sink(inner: R, sink: Arc<dyn EventSink>) -> Self {
        Self { inner, sink }
    }

    /// The wrapped limiter.
    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: RateLimiterBackend> RateLimiterBackend for LoggedRateLimiter<R> {
    fn is_allowed(&self, identifier: &str) -> RateDecision {
        let decision = self.inner.is_allowed(identifier);

        if decision.allowed {
            self.sink.emit(
                Level::DEBUG,
                "API request allowed",
                &[
                    ("identifier", identifier.to_string()),
                    ("remaining", decision.remaining.to_string()),
                ],
            );
        } else {
            self.sink.emit(
                Level::WARN,
                "API rate limit exceeded",
                &[
                    ("identifier", identifier.to_string()),
                    ("retry_after", decision.retry_after.unwrap_or(0).to_string()),
                ],
            );
        }

        decision
    }

    fn update_max_requests(&self, max_requests: u64) {
        self.inner.update_max_requests(max_requests);
        self.sink.emit(
            Level::INFO,
            "Updated rate limit max_requests",
            &[("max_requests", max_requests.to_string())],
        );
    }

    fn update_window(&self, window: Duration) {
        self.inner.update_window(window);
        self.sink.emit(
            Level::INFO,
            "Updated rate limit window",
            &[("window_ms", window.as_millis().to_string())],
        );
    }

    fn reset(&self, identifier: &str) {
        self.inner.reset(identifier);
        self.sink.emit(
            Level::INFO,
            "Reset rate limit window",
            &[("identifier", identifier.to_string())],
        );
    }

    fn clear(&self) {
        self.inner.clear();
        self.sink.emit(Level::INFO, "Cleared all rate limit windows", &[]);
    }
}
