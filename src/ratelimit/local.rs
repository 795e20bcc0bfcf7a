//! In-process sliding-window log.
//!
//! Used when no shared store is configured and as the fallback while the
//! shared store is down. State is exclusively owned by this process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::backend::{window_millis, WindowCount, WindowStore};
use crate::error::StoreError;

/// Default bound on tracked identifiers before a lazy sweep kicks in.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Minimum gap between capacity-triggered sweeps, in clock milliseconds.
pub const LAZY_SWEEP_GAP_MS: u64 = 1_000;

/// Event log for one identifier.
#[derive(Debug, Clone)]
struct WindowEntry {
    /// Event timestamps (epoch ms), oldest first
    events: VecDeque<u64>,
    /// Largest window this entry has been used with, for eviction
    window_ms: u64,
}

impl WindowEntry {
    fn new(window_ms: u64) -> Self {
        Self {
            events: VecDeque::new(),
            window_ms,
        }
    }

    /// Drop every event with `now - ts >= window_ms`.
    fn purge(&mut self, now: u64, window_ms: u64) {
        while let Some(&oldest) = self.events.front() {
            if now.saturating_sub(oldest) >= window_ms {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn count(&self, window_ms: u64) -> WindowCount {
        WindowCount {
            count: self.events.len() as u64,
            reset_at: self
                .events
                .front()
                .map(|oldest| oldest.saturating_add(window_ms)),
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        match self.events.back() {
            Some(&newest) => now.saturating_sub(newest) >= self.window_ms,
            None => true,
        }
    }
}

/// Sharded in-memory window store.
///
/// Each identifier's purge, append and count run while holding that key's
/// shard lock, so two concurrent requests for the same identifier can never
/// both observe the count from before the other's append. Identifiers in
/// other shards proceed in parallel.
///
/// At capacity, a new identifier triggers a full sweep at most once per
/// [`LAZY_SWEEP_GAP_MS`]; in between, new identifiers are tracked over the
/// bound until the next sweep.
#[derive(Debug)]
pub struct LocalStore {
    entries: DashMap<String, WindowEntry>,
    max_entries: usize,
    /// Clock time before which no lazy sweep runs
    next_lazy_sweep_at: AtomicU64,
    lazy_sweeps: AtomicU64,
}

impl LocalStore {
    /// Create a store with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    /// Create a store that sweeps lazily once `max_entries` identifiers are tracked.
    ///
    /// A `max_entries` of zero disables the lazy sweep.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            next_lazy_sweep_at: AtomicU64::new(0),
            lazy_sweeps: AtomicU64::new(0),
        }
    }

    /// Record one event at `now` and return the resulting count.
    pub fn record(&self, identifier: &str, window: Duration, now: u64) -> WindowCount {
        self.make_room_for(identifier, now);

        let window_ms = window_millis(window);
        let mut entry = self
            .entries
            .entry(identifier.to_string())
            .or_insert_with(|| WindowEntry::new(window_ms));

        entry.window_ms = entry.window_ms.max(window_ms);
        entry.purge(now, window_ms);
        entry.events.push_back(now);
        let counted = entry.count(window_ms);

        trace!(
            identifier = %identifier,
            count = counted.count,
            "Recorded local window event"
        );

        counted
    }

    /// Count the identifier's window without recording.
    ///
    /// Unknown identifiers are not inserted.
    pub fn count(&self, identifier: &str, window: Duration, now: u64) -> WindowCount {
        let window_ms = window_millis(window);
        match self.entries.get_mut(identifier) {
            Some(mut entry) => {
                entry.purge(now, window_ms);
                entry.count(window_ms)
            }
            None => WindowCount::EMPTY,
        }
    }

    /// Forget an identifier.
    pub fn remove(&self, identifier: &str) -> bool {
        self.entries.remove(identifier).is_some()
    }

    /// Remove every entry whose newest event has aged past its largest window.
    ///
    /// Locks one shard at a time, so concurrent `record` calls only wait on
    /// the shard currently being swept.
    pub fn sweep_expired(&self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let after = self.entries.len();
        let evicted = before.saturating_sub(after);

        if evicted > 0 {
            debug!(evicted, remaining = after, "Swept expired local windows");
        }
        evicted
    }

    /// Number of tracked identifiers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no identifiers are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of capacity-triggered sweeps run so far.
    pub fn lazy_sweeps(&self) -> u64 {
        self.lazy_sweeps.load(Ordering::Relaxed)
    }

    fn make_room_for(&self, identifier: &str, now: u64) {
        if self.max_entries == 0
            || self.entries.len() < self.max_entries
            || self.entries.contains_key(identifier)
        {
            return;
        }

        // One caller per gap claims the sweep; everyone else proceeds
        let due = self.next_lazy_sweep_at.load(Ordering::Acquire);
        if now < due
            || self
                .next_lazy_sweep_at
                .compare_exchange(
                    due,
                    now.saturating_add(LAZY_SWEEP_GAP_MS),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
        {
            return;
        }

        self.lazy_sweeps.fetch_add(1, Ordering::Relaxed);
        self.sweep_expired(now);
        if self.entries.len() >= self.max_entries {
            warn!(
                tracked = self.entries.len(),
                max_entries = self.max_entries,
                "Local window store is over capacity after sweep"
            );
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for LocalStore {
    async fn record_and_count(
        &self,
        identifier: &str,
        window: Duration,
        now: u64,
    ) -> Result<WindowCount, StoreError> {
        Ok(self.record(identifier, window, now))
    }

    async fn peek(
        &self,
        identifier: &str,
        window: Duration,
        now: u64,
    ) -> Result<WindowCount, StoreError> {
        Ok(self.count(identifier, window, now))
    }

    async fn clear(&self, identifier: &str) -> Result<(), StoreError> {
        self.remove(identifier);
        Ok(())
    }

    async fn sweep(&self, now: u64) -> Result<usize, StoreError> {
        Ok(self.sweep_expired(now))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_record_counts_and_reports_reset() {
        let store = LocalStore::new();

        let first = store.record("u1", MINUTE, 1_000);
        assert_eq!(first.count, 1);
        assert_eq!(first.reset_at, Some(61_000));

        let second = store.record("u1", MINUTE, 2_000);
        assert_eq!(second.count, 2);
        // Reset follows the oldest event, not the newest
        assert_eq!(second.reset_at, Some(61_000));
    }

    #[test]
    fn test_record_purges_before_counting() {
        let store = LocalStore::new();
        let window = Duration::from_millis(100);

        store.record("u1", window, 0);
        store.record("u1", window, 50);

        // Event at 0 is exactly one window old and must not be counted
        let counted = store.record("u1", window, 100);
        assert_eq!(counted.count, 2);
        assert_eq!(counted.reset_at, Some(150));
    }

    #[test]
    fn test_count_does_not_record() {
        let store = LocalStore::new();
        store.record("u1", MINUTE, 1_000);

        for _ in 0..3 {
            assert_eq!(store.count("u1", MINUTE, 1_500).count, 1);
        }
        assert_eq!(store.record("u1", MINUTE, 2_000).count, 2);
    }

    #[test]
    fn test_count_unknown_identifier() {
        let store = LocalStore::new();

        assert_eq!(store.count("ghost", MINUTE, 1_000), WindowCount::EMPTY);
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_forgets_identifier() {
        let store = LocalStore::new();
        store.record("u1", MINUTE, 1_000);

        assert!(store.remove("u1"));
        assert!(!store.remove("u1"));
        assert_eq!(store.count("u1", MINUTE, 1_001), WindowCount::EMPTY);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = LocalStore::new();
        store.record("old", Duration::from_millis(100), 0);
        store.record("fresh", Duration::from_millis(100), 150);

        let evicted = store.sweep_expired(200);

        assert_eq!(evicted, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.count("fresh", Duration::from_millis(100), 200).count, 1);
    }

    #[test]
    fn test_sweep_honours_largest_window_seen() {
        let store = LocalStore::new();
        store.record("u1", Duration::from_secs(10), 0);
        store.record("u1", Duration::from_millis(100), 10);

        // Past the short window but inside the long one
        assert_eq!(store.sweep_expired(5_000), 0);
        assert_eq!(store.len(), 1);

        assert_eq!(store.sweep_expired(10_010), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_lazy_sweep_at_capacity() {
        let store = LocalStore::with_capacity(2);
        let window = Duration::from_millis(100);
        store.record("a", window, 0);
        store.record("b", window, 0);

        store.record("c", window, 500);

        assert_eq!(store.len(), 1);
        assert_eq!(store.count("c", window, 500).count, 1);
    }

    #[test]
    fn test_over_capacity_still_tracks_new_identifier() {
        let store = LocalStore::with_capacity(1);
        store.record("a", MINUTE, 0);

        let counted = store.record("b", MINUTE, 10);

        assert_eq!(counted.count, 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_lazy_sweep_runs_at_most_once_per_gap() {
        let store = LocalStore::with_capacity(10);
        for i in 0..10 {
            store.record(&format!("live-{}", i), MINUTE, 0);
        }

        // A burst of new identifiers while every entry is live
        for i in 0..500 {
            store.record(&format!("new-{}", i), MINUTE, i);
        }
        assert_eq!(store.lazy_sweeps(), 1);
        assert_eq!(store.len(), 510);

        store.record("later", MINUTE, LAZY_SWEEP_GAP_MS);
        assert_eq!(store.lazy_sweeps(), 2);

        // Known identifiers never trigger a sweep
        store.record("live-0", MINUTE, 10 * LAZY_SWEEP_GAP_MS);
        assert_eq!(store.lazy_sweeps(), 2);
    }

    #[test]
    fn test_concurrent_new_identifiers_share_one_lazy_sweep() {
        let store = Arc::new(LocalStore::with_capacity(4));
        for i in 0..4 {
            store.record(&format!("live-{}", i), MINUTE, 0);
        }

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        store.record(&format!("t{}-{}", t, i), MINUTE, 10);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.lazy_sweeps(), 1);
        assert_eq!(store.len(), 804);
    }

    #[test]
    fn test_concurrent_records_are_not_lost() {
        let store = Arc::new(LocalStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        store.record("hot", MINUTE, 1_000);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.count("hot", MINUTE, 1_000).count, 2_000);
    }
}
