//! Process-wide keyed query cache.
//!
//! [`QueryCache`] owns every [`CacheEntry`]. Observers and mutations are the
//! only writers; everything else gets read-only snapshots.
//!
//! # Retention
//!
//! Entries live in a moka cache with per-entry expiry. An entry with at
//! least one subscriber or a request in flight never expires. Once the last
//! subscriber goes away the entry expires after its `cache_time` (the
//! longest one requested by any observer of that key). Expiry is lazy:
//! reads never see an expired entry, and [`QueryCache::run_pending_tasks()`]
//! forces eviction listeners to run.
//!
//! # Events
//!
//! Every write is published on a broadcast channel as a [`CacheEvent`], so
//! tooling can follow the cache without touching its internals.

pub(crate) mod slot;

use std::sync::Arc;
use std::time::Duration;

use moka::Expiry;
use moka::notification::RemovalCause;
use moka::ops::compute::Op;
use moka::sync::Cache;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::key::QueryKey;
use crate::telemetry;
use crate::{Result, SkuldError};

pub use slot::EntryStatus;
pub(crate) use slot::{AnyValue, EntrySlot};

/// Configuration for the query cache.
///
/// ```rust
/// # use skuld::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .default_cache_time(Duration::from_secs(60))
///     .event_capacity(64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Retention of inactive entries created without query options
    /// (e.g. through [`QueryCache::set()`]). Default: 5 minutes.
    pub default_cache_time: Duration,
    /// Buffered events per receiver before slow receivers lag. Default: 256.
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_cache_time: Duration::from_secs(5 * 60),
            event_capacity: 256,
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retention of inactive entries created without options.
    pub fn default_cache_time(mut self, ttl: Duration) -> Self {
        self.default_cache_time = ttl;
        self
    }

    /// Set the broadcast buffer for cache events.
    pub fn event_capacity(mut self, n: usize) -> Self {
        self.event_capacity = n.max(1);
        self
    }
}

/// Change notifications published by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Data, status or error of the entry changed.
    Updated(QueryKey),
    /// The entry was marked stale; live observers refetch it.
    Invalidated(QueryKey),
    /// The entry left the cache (explicit removal or expiry).
    Removed(QueryKey),
}

/// Read-only snapshot of a cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub status: EntryStatus,
    pub error: Option<SkuldError>,
    pub last_fetched_at: Option<Instant>,
    pub subscriber_count: usize,
    pub is_fetching: bool,
    pub is_invalidated: bool,
}

/// Per-entry expiry: no expiry while observed or fetching.
struct IdleExpiry;

impl Expiry<QueryKey, Arc<EntrySlot>> for IdleExpiry {
    fn expire_after_create(
        &self,
        _key: &QueryKey,
        slot: &Arc<EntrySlot>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        slot.idle_ttl()
    }

    fn expire_after_update(
        &self,
        _key: &QueryKey,
        slot: &Arc<EntrySlot>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        slot.idle_ttl()
    }
}

/// Thread-safe, cheaply cloneable keyed store of query results.
#[derive(Clone)]
pub struct QueryCache {
    entries: Cache<QueryKey, Arc<EntrySlot>>,
    events: broadcast::Sender<CacheEvent>,
    config: CacheConfig,
}

impl QueryCache {
    /// Create an empty cache with default configuration.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create an empty cache with the given configuration.
    pub fn with_config(config: CacheConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let listener_events = events.clone();
        let entries = Cache::builder()
            .expire_after(IdleExpiry)
            .eviction_listener(move |key: Arc<QueryKey>, _slot, cause| {
                if cause == RemovalCause::Expired {
                    metrics::counter!(telemetry::GC_EVICTIONS_TOTAL).increment(1);
                    debug!(key = %key, "evicted inactive query");
                    let _ = listener_events.send(CacheEvent::Removed((*key).clone()));
                }
            })
            .build();
        Self {
            entries,
            events,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Typed data stored under `key`.
    ///
    /// Returns `Ok(None)` on miss or when the entry holds no data yet, and
    /// [`SkuldError::TypeMismatch`] when the stored value is not a `T`.
    pub fn get<T>(&self, key: &QueryKey) -> Result<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let Some(slot) = self.entries.get(key) else {
            return Ok(None);
        };
        let data = slot.lock().data.clone();
        data.map(|value| downcast::<T>(key, value)).transpose()
    }

    /// Store `data` under `key` as a successful, fresh result.
    pub fn set<T>(&self, key: &QueryKey, data: T)
    where
        T: Send + Sync + 'static,
    {
        let slot = self.slot(key, self.config.default_cache_time);
        slot.set_data(Arc::new(data));
        self.touch(&slot);
        self.emit(CacheEvent::Updated(key.clone()));
    }

    /// Snapshot of the entry under `key`.
    pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|slot| snapshot(&slot))
    }

    /// Keys currently held, in no particular order.
    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries.iter().map(|(key, _)| (*key).clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark every entry whose key starts with `prefix` as stale.
    ///
    /// Live observers of those keys refetch; other entries refetch on their
    /// next access. Returns the number of entries marked.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let matched = self.matching(prefix);
        for slot in &matched {
            slot.mark_invalidated();
            debug!(key = %slot.key(), "invalidated query");
            self.emit(CacheEvent::Invalidated(slot.key().clone()));
        }
        matched.len()
    }

    /// Cancel in-flight requests for every key starting with `prefix`.
    ///
    /// Cancelled requests leave their entries exactly as they were before
    /// the request started. Returns the number of requests cancelled.
    pub fn cancel(&self, prefix: &QueryKey) -> usize {
        self.matching(prefix)
            .iter()
            .filter(|slot| slot.cancel())
            .inspect(|slot| {
                metrics::counter!(telemetry::CANCELLATIONS_TOTAL,
                    "resource" => slot.key().resource().to_owned())
                .increment(1);
            })
            .count()
    }

    /// Drop every entry whose key starts with `prefix`, cancelling requests
    /// in flight. Returns the number of entries removed.
    pub fn remove(&self, prefix: &QueryKey) -> usize {
        self.matching(prefix)
            .iter()
            .filter(|slot| self.remove_slot(slot))
            .count()
    }

    /// Remove `slot` if it is still the one stored under its key.
    fn remove_slot(&self, slot: &Arc<EntrySlot>) -> bool {
        let removed = self.compute_if_current(slot, Op::Remove);
        if removed {
            slot.cancel();
            self.emit(CacheEvent::Removed(slot.key().clone()));
        }
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.remove(&QueryKey::from_parts(Vec::new()));
    }

    /// Subscribe to cache change notifications.
    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Run moka housekeeping now: evicts expired entries and fires their
    /// [`CacheEvent::Removed`] notifications.
    pub fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks();
    }

    // ===== crate-internal access for observers and fetches =====

    /// Get or atomically create the slot for `key`.
    pub(crate) fn slot(&self, key: &QueryKey, cache_time: Duration) -> Arc<EntrySlot> {
        self.entries
            .entry_by_ref(key)
            .or_insert_with(|| Arc::new(EntrySlot::new(key.clone(), cache_time)))
            .into_value()
    }

    /// Register a subscriber on `key` for the lifetime of the guard.
    pub(crate) fn subscribe(&self, key: &QueryKey, cache_time: Duration) -> Subscription {
        let slot = self.slot(key, cache_time);
        slot.add_subscriber(cache_time);
        self.touch(&slot);
        Subscription {
            cache: self.clone(),
            slot,
        }
    }

    /// Re-insert `slot` so its expiry is recomputed. A slot that has been
    /// replaced or removed in the meantime is left alone.
    pub(crate) fn touch(&self, slot: &Arc<EntrySlot>) {
        self.compute_if_current(slot, Op::Put(slot.clone()));
    }

    /// Apply `op` under the entry lock when `slot` is the stored value;
    /// returns whether it was applied.
    fn compute_if_current(&self, slot: &Arc<EntrySlot>, op: Op<Arc<EntrySlot>>) -> bool {
        let mut applied = false;
        self.entries
            .entry_by_ref(slot.key())
            .and_compute_with(|current| match current {
                Some(entry) if Arc::ptr_eq(entry.value(), slot) => {
                    applied = true;
                    op
                }
                _ => Op::Nop,
            });
        applied
    }

    /// Whether `slot` is still the one stored under its key.
    pub(crate) fn is_current(&self, slot: &Arc<EntrySlot>) -> bool {
        self.entries
            .get(slot.key())
            .is_some_and(|current| Arc::ptr_eq(&current, slot))
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn matching(&self, prefix: &QueryKey) -> Vec<Arc<EntrySlot>> {
        self.entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(_, slot)| slot)
            .collect()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one subscriber registered on a cache entry until dropped.
pub(crate) struct Subscription {
    cache: QueryCache,
    slot: Arc<EntrySlot>,
}

impl Subscription {
    pub(crate) fn slot(&self) -> &Arc<EntrySlot> {
        &self.slot
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let remaining = self.slot.remove_subscriber();
        if remaining == 0 {
            debug!(key = %self.slot.key(), "last subscriber left");
        }
        self.cache.touch(&self.slot);
    }
}

pub(crate) fn downcast<T>(key: &QueryKey, value: AnyValue) -> Result<T>
where
    T: Clone + Send + Sync + 'static,
{
    value
        .downcast::<T>()
        .map(|typed| (*typed).clone())
        .map_err(|_| SkuldError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
        })
}

fn snapshot(slot: &EntrySlot) -> CacheEntry {
    let state = slot.lock();
    CacheEntry {
        key: slot.key().clone(),
        status: state.status,
        error: state.error.clone(),
        last_fetched_at: state.last_fetched_at,
        subscriber_count: state.subscribers,
        is_fetching: state.is_fetching(),
        is_invalidated: state.invalidated,
    }
}
