//! Capacity bound shared by the per-key maps.
//!
//! Without a bound, every identifier that ever sent a request would keep an
//! entry forever. Before a new key is inserted into a full map, expired
//! entries are dropped first; if the map is still full, a batch of the
//! entries touched least recently goes.

use dashmap::DashMap;
use tracing::trace;

/// Entries that know when they lapse and when they were last touched.
pub(crate) trait Expiring {
    /// Whether the entry's window has ended at `now`.
    fn is_expired(&self, now: i64) -> bool;

    /// Epoch millis of the last access, used to pick an eviction victim.
    fn last_touched(&self) -> i64;
}

/// Drop every expired entry. Returns how many were removed.
pub(crate) fn purge_expired<V: Expiring>(map: &DashMap<String, V>, now: i64) -> usize {
    let before = map.len();
    map.retain(|_, entry| !entry.is_expired(now));
    before.saturating_sub(map.len())
}

/// Share of capacity freed by one eviction pass.
const EVICTION_BATCH_DIVISOR: usize = 32;

/// Number of live entries evicted per pass over a full map of `capacity`.
pub(crate) fn eviction_batch(capacity: usize) -> usize {
    (capacity / EVICTION_BATCH_DIVISOR).max(1)
}

/// Make room for one more key in a map bounded to `capacity` entries.
///
/// A full map is swept once: expired entries go first, and if that frees
/// nothing, the [`eviction_batch`] least recently touched entries go. The
/// next inserts then find the map below capacity and skip the sweep.
///
/// Must not be called while holding a guard into `map`.
pub(crate) fn make_room<V: Expiring>(map: &DashMap<String, V>, capacity: usize, now: i64) {
    let capacity = capacity.max(1);
    if map.len() < capacity {
        return;
    }

    let purged = purge_expired(map, now);
    if purged > 0 {
        trace!(purged, "Dropped expired entries to make room");
    }

    let len = map.len();
    if len < capacity {
        return;
    }

    let excess = len - capacity + eviction_batch(capacity);
    let mut candidates: Vec<(i64, String)> = map
        .iter()
        .map(|entry| (entry.value().last_touched(), entry.key().clone()))
        .collect();

    if excess < candidates.len() {
        candidates.select_nth_unstable(excess);
        candidates.truncate(excess);
    }

    for (_, key) in &candidates {
        map.remove(key);
    }
    trace!(evicted = candidates.len(), "Evicted least recently touched entries");
}
