//! Per-key rate window state.

use serde::{Deserialize, Serialize};

use crate::store::Expiring;

/// Counting algorithm used by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Count up to the limit within a window that starts at the first request.
    #[default]
    Fixed,
    /// Fixed window plus a decay step: whole windows elapsed since the last
    /// request each forgive `max_requests` from the count.
    ///
    /// This is a cheap approximation of a sliding log. It trades accuracy
    /// for a constant-size entry; callers needing exact sliding semantics
    /// should keep per-request timestamps instead.
    Sliding,
}

/// Counting state for one storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindowEntry {
    /// Requests admitted in the current window
    pub count: u64,
    /// Epoch millis at which the window ends
    pub expires_at: i64,
    /// Epoch millis of the most recent request
    pub last_request_at: i64,
}

impl RateWindowEntry {
    /// Open a fresh window at `now` that already counts one request.
    pub fn open(now: i64, window_ms: i64) -> Self {
        Self {
            count: 1,
            expires_at: now.saturating_add(window_ms),
            last_request_at: now,
        }
    }

    /// Apply the sliding decay for the time elapsed since the last request.
    pub fn decay(&mut self, now: i64, window_ms: i64, max_requests: u64) {
        let elapsed = now.saturating_sub(self.last_request_at).max(0);
        let windows = elapsed.checked_div(window_ms).unwrap_or(0).max(0) as u64;
        let forgiven = windows.saturating_mul(max_requests);

        self.count = self.count.saturating_sub(forgiven);
        self.last_request_at = now;
    }

    /// Count one more request if the window has room for it.
    pub fn try_admit(&mut self, max_requests: u64) -> bool {
        if self.count < max_requests {
            self.count += 1;
            true
        } else {
            false
        }
    }

    /// Requests still available under `max_requests`.
    pub fn remaining(&self, max_requests: u64) -> u64 {
        max_requests.saturating_sub(self.count)
    }

    /// Whole seconds until the window ends, rounded up.
    pub fn retry_after_secs(&self, now: i64) -> u64 {
        let millis = self.expires_at.saturating_sub(now).max(0) as u64;
        millis.div_ceil(1000)
    }
}

impl Expiring for RateWindowEntry {
    fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    fn last_touched(&self) -> i64 {
        self.last_request_at
    }
}
