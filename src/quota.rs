//! Long-window usage quotas with variable-cost consumption.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::Level;

use crate::clock::{window_millis, Clock, SystemClock};
use crate::config::QuotaSettings;
use crate::events::{default_sink, EventSink};
use crate::error::Violation;
use crate::store::{self, Expiring};

/// Usage recorded for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaEntry {
    /// Units consumed in the current window
    pub used: u64,
    /// Epoch millis at which the window ends
    pub reset_time: i64,
    /// Epoch millis of the most recent check
    pub last_checked_at: i64,
}

impl Expiring for QuotaEntry {
    fn is_expired(&self, now: i64) -> bool {
        now > self.reset_time
    }

    fn last_touched(&self) -> i64 {
        self.last_checked_at
    }
}

/// Outcome of a quota check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Units consumed in the window after this decision
    pub used: u64,
    /// `max_quota - used`, floored at zero
    pub remaining: u64,
    /// Epoch millis at which the window ends
    pub reset_time: i64,
    pub identifier: String,
    pub reason: Option<Violation>,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_quota: u64,
    window: Duration,
}

/// Per-identifier usage accounting over a fixed window.
///
/// The first consumption in a window is always admitted, even when `amount`
/// alone exceeds `max_quota`. Later consumption is admitted only while the
/// running total stays within the ceiling; a rejected check leaves the total
/// untouched.
pub struct QuotaManager {
    usage: DashMap<String, QuotaEntry>,
    limits: RwLock<Limits>,
    max_entries: usize,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

impl QuotaManager {
    /// Create a quota manager from settings.
    pub fn new(settings: &QuotaSettings) -> Self {
        Self::build(settings, Arc::new(SystemClock::new()), default_sink())
    }

    /// Create a quota manager with an explicit clock and event sink.
    pub fn build(settings: &QuotaSettings, clock: Arc<dyn Clock>, sink: Arc<dyn EventSink>) -> Self {
        sink.emit(
            Level::INFO,
            "QuotaManager initialized",
            &[
                ("max_quota", settings.max_quota.to_string()),
                ("window_ms", settings.window_ms.to_string()),
            ],
        );

        Self {
            usage: DashMap::new(),
            limits: RwLock::new(Limits {
                max_quota: settings.max_quota,
                window: settings.window(),
            }),
            max_entries: settings.max_entries.max(1),
            clock,
            sink,
        }
    }

    /// Consume `amount` units for `identifier` if the quota allows it.
    pub fn check_quota(&self, identifier: &str, amount: u64) -> QuotaDecision {
        let now = self.clock.now_millis();
        let Limits { max_quota, window } = *self.limits.read();

        if !self.usage.contains_key(identifier) {
            store::make_room(&self.usage, self.max_entries, now);
        }

        let (allowed, entry) = match self.usage.entry(identifier.to_string()) {
            Entry::Vacant(vacant) => {
                let entry = *vacant.insert(Self::open(now, window, amount));
                (true, entry)
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.last_checked_at = now;

                if entry.is_expired(now) {
                    *entry = Self::open(now, window, amount);
                    (true, *entry)
                } else {
                    match entry.used.checked_add(amount) {
                        Some(total) if total <= max_quota => {
                            entry.used = total;
                            (true, *entry)
                        }
                        _ => (false, *entry),
                    }
                }
            }
        };

        let remaining = max_quota.saturating_sub(entry.used);

        if allowed {
            self.sink.emit(
                Level::DEBUG,
                "Quota allowed",
                &[
                    ("identifier", identifier.to_string()),
                    ("used", entry.used.to_string()),
                    ("remaining", remaining.to_string()),
                ],
            );
        } else {
            self.sink.emit(
                Level::WARN,
                "Quota exceeded",
                &[
                    ("identifier", identifier.to_string()),
                    ("used", entry.used.to_string()),
                    ("max_quota", max_quota.to_string()),
                ],
            );
        }

        QuotaDecision {
            allowed,
            used: entry.used,
            remaining,
            reset_time: entry.reset_time,
            identifier: identifier.to_string(),
            reason: (!allowed).then_some(Violation::QuotaExceeded),
        }
    }

    fn open(now: i64, window: Duration, amount: u64) -> QuotaEntry {
        QuotaEntry {
            used: amount,
            reset_time: now.saturating_add(window_millis(window)),
            last_checked_at: now,
        }
    }

    /// Change the per-window ceiling. Applies from the next check.
    pub fn update_max_quota(&self, max_quota: u64) {
        self.limits.write().max_quota = max_quota;
        self.sink.emit(
            Level::INFO,
            "Updated QuotaManager max_quota",
            &[("max_quota", max_quota.to_string())],
        );
    }

    /// Change the window length for windows opened from now on.
    pub fn update_window(&self, window: Duration) {
        self.limits.write().window = window;
        self.sink.emit(
            Level::INFO,
            "Updated QuotaManager window",
            &[("window_ms", window.as_millis().to_string())],
        );
    }

    /// Forget usage for `identifier`.
    pub fn reset(&self, identifier: &str) {
        self.usage.remove(identifier);
        self.sink.emit(
            Level::INFO,
            "Reset quota usage",
            &[("identifier", identifier.to_string())],
        );
    }

    /// Forget all usage.
    pub fn clear(&self) {
        self.usage.clear();
        self.sink.emit(Level::INFO, "Cleared all quota usage", &[]);
    }

    /// Drop windows that have already ended. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        store::purge_expired(&self.usage, self.clock.now_millis())
    }

    /// Current usage for `identifier`, if tracked.
    pub fn usage(&self, identifier: &str) -> Option<QuotaEntry> {
        self.usage.get(identifier).map(|e| *e)
    }

    pub fn max_quota(&self) -> u64 {
        self.limits.read().max_quota
    }

    pub fn window(&self) -> Duration {
        self.limits.read().window
    }

    pub fn len(&self) -> usize {
        self.usage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.usage.is_empty()
    }
}
