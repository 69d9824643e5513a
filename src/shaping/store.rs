//! Bounded, expiry-tracking store for per-source buckets.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use crate::error::{Result, ShaperError};

/// Upper bound on the number of sources tracked by one middleware instance.
pub const MAX_SOURCES: usize = 65536;

/// A concurrent map whose entries expire after a time-to-live.
///
/// The store never holds more than `capacity` entries. An expired entry reads
/// as absent and keeps its slot only until it is reclaimed, which happens when
/// it is next touched, when an insertion finds the store full, or when the
/// background sweeper runs.
///
/// Entries live in a sharded map, so operations on different keys do not
/// contend on a single lock, while operations on the same key serialize.
/// A full scan only happens once some entry may have expired.
pub struct TtlStore<V> {
    entries: DashMap<String, Slot<V>>,
    /// Number of occupied slots, expired or not
    len: AtomicUsize,
    capacity: usize,
    /// Origin of the expiry offsets below
    epoch: Instant,
    /// Nanoseconds after `epoch`; no entry expires before this point
    earliest_expiry: AtomicU64,
    /// Full scans performed for expired entries
    scans: AtomicUsize,
}

struct Slot<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Slot<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

impl<V: Clone> TtlStore<V> {
    /// Create an empty store that holds at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ShaperError::CapacityInvalid);
        }

        Ok(Self {
            entries: DashMap::new(),
            len: AtomicUsize::new(0),
            capacity,
            epoch: Instant::now(),
            earliest_expiry: AtomicU64::new(u64::MAX),
            scans: AtomicUsize::new(0),
        })
    }

    /// Look up a live entry without refreshing its expiry.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let slot = self.entries.get(key)?;
            if !slot.is_expired(now) {
                return Some(slot.value.clone());
            }
        }

        self.remove_expired(key, now);
        None
    }

    /// Insert `value` under `key`, or replace the current value, and set the
    /// expiry to now + `ttl`.
    ///
    /// Fails with [`ShaperError::StoreFull`] when `key` is absent and every
    /// slot holds a live entry.
    pub fn set(&self, key: &str, value: V, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let value = match self.try_set(key, value, now + ttl) {
            Ok(()) => return Ok(()),
            Err(value) => value,
        };

        self.purge_expired_at(now);
        self.try_set(key, value, now + ttl)
            .map_err(|_| self.full_error(key))
    }

    /// Return the live value under `key` with its expiry pushed to now + `ttl`,
    /// or insert the value produced by `make` if the key is absent or expired.
    ///
    /// The lookup, refresh and insertion happen under the key's shard lock,
    /// so concurrent callers for one key always observe the same value.
    pub fn touch_or_insert_with<F>(&self, key: &str, ttl: Duration, mut make: F) -> Result<V>
    where
        F: FnMut() -> V,
    {
        let now = Instant::now();
        if let Some(value) = self.try_touch_or_insert(key, now, ttl, &mut make) {
            return Ok(value);
        }

        self.purge_expired_at(now);
        self.try_touch_or_insert(key, now, ttl, &mut make)
            .ok_or_else(|| self.full_error(key))
    }

    /// Remove an entry, returning its value if it was still live.
    pub fn remove(&self, key: &str) -> Option<V> {
        let (_, slot) = self.entries.remove(key)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        (!slot.is_expired(Instant::now())).then_some(slot.value)
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    /// Number of occupied slots, including expired entries not yet reclaimed.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn try_set(&self, key: &str, value: V, expires_at: Instant) -> std::result::Result<(), V> {
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if expires_at < slot.expires_at {
                    self.note_expiry(expires_at);
                }
                slot.value = value;
                slot.expires_at = expires_at;
                Ok(())
            }
            Entry::Vacant(vacant) => {
                if !self.claim_slot() {
                    return Err(value);
                }
                self.note_expiry(expires_at);
                vacant.insert(Slot { value, expires_at });
                Ok(())
            }
        }
    }

    fn try_touch_or_insert<F>(
        &self,
        key: &str,
        now: Instant,
        ttl: Duration,
        make: &mut F,
    ) -> Option<V>
    where
        F: FnMut() -> V,
    {
        let expires_at = now + ttl;
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.is_expired(now) {
                    trace!(key = %key, "Replacing expired entry");
                    slot.value = make();
                }
                if expires_at < slot.expires_at {
                    self.note_expiry(expires_at);
                }
                slot.expires_at = expires_at;
                Some(slot.value.clone())
            }
            Entry::Vacant(vacant) => {
                if !self.claim_slot() {
                    return None;
                }
                self.note_expiry(expires_at);
                let value = make();
                vacant.insert(Slot {
                    value: value.clone(),
                    expires_at,
                });
                Some(value)
            }
        }
    }

    fn claim_slot(&self) -> bool {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < self.capacity).then_some(len + 1)
            })
            .is_ok()
    }

    fn remove_expired(&self, key: &str, now: Instant) {
        if self
            .entries
            .remove_if(key, |_, slot| slot.is_expired(now))
            .is_some()
        {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        if self.offset(now) < self.earliest_expiry.load(Ordering::Acquire) {
            return 0;
        }
        self.scans.fetch_add(1, Ordering::Relaxed);

        // Entries written during the scan lower the bound again themselves
        self.earliest_expiry.store(u64::MAX, Ordering::Release);
        let mut removed = 0;
        let mut earliest = u64::MAX;
        self.entries.retain(|_, slot| {
            let keep = !slot.is_expired(now);
            if keep {
                earliest = earliest.min(self.offset(slot.expires_at));
            } else {
                removed += 1;
            }
            keep
        });
        self.earliest_expiry.fetch_min(earliest, Ordering::AcqRel);

        if removed > 0 {
            self.len.fetch_sub(removed, Ordering::AcqRel);
            trace!(removed = removed, "Purged expired entries");
        }
        removed
    }

    fn offset(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.epoch).as_nanos()).unwrap_or(u64::MAX)
    }

    fn note_expiry(&self, expires_at: Instant) {
        self.earliest_expiry.fetch_min(self.offset(expires_at), Ordering::AcqRel);
    }

    fn full_error(&self, key: &str) -> ShaperError {
        debug!(key = %key, capacity = self.capacity, "Store is full");
        ShaperError::StoreFull {
            capacity: self.capacity,
        }
    }
}

impl<V: Clone + Send + Sync + 'static> TtlStore<V> {
    /// Periodically purge expired entries on the current tokio runtime.
    ///
    /// The task holds a weak reference and exits once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = IntervalStream::new(interval);

        tokio::spawn(async move {
            while ticks.next().await.is_some() {
                let Some(live) = store.upgrade() else {
                    break;
                };
                let removed = live.purge_expired();
                if removed > 0 {
                    debug!(removed = removed, remaining = live.len(), "Swept expired entries");
                }
            }
            trace!("Store sweeper stopped");
        })
    }
}

impl<V> std::fmt::Debug for TtlStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlStore")
            .field("len", &self.len.load(Ordering::Relaxed))
            .field("capacity", &self.capacity)
            .field("scans", &self.scans.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio_test::{assert_err, assert_ok};

    const TTL: Duration = Duration::from_secs(10);

    #[test]
    fn test_zero_capacity_rejected() {
        let err = TtlStore::<u32>::new(0).unwrap_err();
        assert!(matches!(err, ShaperError::CapacityInvalid));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_and_get() {
        let store = TtlStore::new(4).unwrap();
        assert_eq!(store.get("a"), None);

        assert_ok!(store.set("a", 1, TTL));
        assert_eq!(store.get("a"), Some(1));
        assert_eq!(store.len(), 1);

        // Replacing keeps a single slot
        assert_ok!(store.set("a", 2, TTL));
        assert_eq!(store.get("a"), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires() {
        let store = TtlStore::new(4).unwrap();
        store.set("a", 1, TTL).unwrap();

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert_eq!(store.get("a"), Some(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(store.get("a"), None);
        // Reclaimed lazily by the lookup
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_does_not_refresh() {
        let store = TtlStore::new(4).unwrap();
        store.set("a", 1, TTL).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("a"), Some(1));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_refreshes_expiry() {
        let store = TtlStore::new(4).unwrap();
        store.set("a", 1, TTL).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        store.set("a", 1, TTL).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("a"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_store_rejects_new_keys() {
        let store = TtlStore::new(2).unwrap();
        store.set("a", 1, TTL).unwrap();
        store.set("b", 2, TTL).unwrap();

        let err = assert_err!(store.set("c", 3, TTL));
        assert!(matches!(err, ShaperError::StoreFull { capacity: 2 }));
        assert_eq!(store.get("c"), None);

        // Existing keys can still be updated
        assert_ok!(store.set("a", 10, TTL));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_store_evicts_expired() {
        let store = TtlStore::new(2).unwrap();
        store.set("a", 1, Duration::from_secs(1)).unwrap();
        store.set("b", 2, TTL).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_ok!(store.set("c", 3, TTL));
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("c"), Some(3));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_live_store_skips_scan() {
        let store = TtlStore::new(2).unwrap();
        store.set("a", 1, TTL).unwrap();
        store.touch_or_insert_with("b", TTL, || 2).unwrap();

        // Nothing can have expired yet, so new keys fail without a scan
        for key in ["c", "d", "e"] {
            assert_err!(store.set(key, 3, TTL));
            assert_err!(store.touch_or_insert_with(key, TTL, || 3));
        }
        assert_eq!(store.purge_expired(), 0);
        assert_eq!(store.scans.load(Ordering::Relaxed), 0);

        tokio::time::advance(TTL).await;
        assert_ok!(store.set("c", 3, TTL));
        assert_eq!(store.scans.load(Ordering::Relaxed), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_with_shorter_ttl_is_reclaimed() {
        let store = TtlStore::new(2).unwrap();
        store.set("a", 1, TTL).unwrap();
        store.set("b", 2, TTL).unwrap();
        store.set("a", 1, Duration::from_secs(1)).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_ok!(store.set("c", 3, TTL));
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("b"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_or_insert_with() {
        let store = TtlStore::new(4).unwrap();
        let created = AtomicU32::new(0);
        let make = || created.fetch_add(1, Ordering::SeqCst) + 100;

        assert_eq!(store.touch_or_insert_with("a", TTL, make).unwrap(), 100);
        assert_eq!(store.touch_or_insert_with("a", TTL, make).unwrap(), 100);

        // Each touch pushes the expiry forward
        tokio::time::advance(Duration::from_secs(6)).await;
        store.touch_or_insert_with("a", TTL, make).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.touch_or_insert_with("a", TTL, make).unwrap(), 100);

        // An expired value is replaced with a fresh one
        tokio::time::advance(TTL).await;
        assert_eq!(store.touch_or_insert_with("a", TTL, make).unwrap(), 101);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_or_insert_respects_capacity() {
        let store = TtlStore::new(1).unwrap();
        store.touch_or_insert_with("a", TTL, || 1).unwrap();

        let err = store.touch_or_insert_with("b", TTL, || 2).unwrap_err();
        assert!(matches!(err, ShaperError::StoreFull { .. }));

        tokio::time::advance(TTL).await;
        assert_eq!(store.touch_or_insert_with("b", TTL, || 2).unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove() {
        let store = TtlStore::new(2).unwrap();
        store.set("a", 1, TTL).unwrap();

        assert_eq!(store.remove("a"), Some(1));
        assert_eq!(store.remove("a"), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_expired() {
        let store = Arc::new(TtlStore::new(8).unwrap());
        store.set("a", 1, Duration::from_secs(1)).unwrap();
        store.set("b", 2, Duration::from_secs(30)).unwrap();

        let sweeper = store.spawn_sweeper(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("b"), Some(2));

        drop(store);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(sweeper.is_finished());
    }

    #[test]
    fn test_cardinality_bound_under_concurrency() {
        let store = Arc::new(TtlStore::new(64).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|thread| {
                let store = store.clone();
                std::thread::spawn(move || {
                    (0..32)
                        .filter(|i| {
                            store
                                .set(&format!("{}-{}", thread, i), *i, Duration::from_secs(60))
                                .is_ok()
                        })
                        .count()
                })
            })
            .collect();

        let inserted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(inserted, 64);
        assert_eq!(store.len(), 64);
    }
}
