//! Time sources.
//!
//! Every component reads "now" through the [`Clock`] port so that window
//! arithmetic can be tested without sleeping. Timestamps are milliseconds
//! since the Unix epoch, matching what clients put in their headers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Port for reading the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// System clock backed by `chrono::Utc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can hand one clone to a
/// component and keep another to advance time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a manual clock starting at `start_millis`.
    pub fn new(start_millis: i64) -> Self {
        Self {
            current: Arc::new(AtomicI64::new(start_millis)),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.current.fetch_add(millis, Ordering::SeqCst);
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, millis: i64) {
        self.current.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }
}

/// Convert a window length into whole milliseconds, saturating.
pub(crate) fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        let clock = SystemClock::new();
        assert!(clock.now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);

        clock.advance(Duration::from_secs(10));
        assert_eq!(clock.now_millis(), 11_000);

        let shared = clock.clone();
        shared.set(50);
        assert_eq!(clock.now_millis(), 50);
    }
}
