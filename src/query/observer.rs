//! Live observer of one query key.
//!
//! An observer holds a subscription on its cache entry and runs a small
//! driver task that reacts to entry changes, invalidation, focus and the
//! polling timer. Dropping the observer releases the subscription and stops
//! the driver; a request it started keeps running and still updates the
//! cache for everyone else.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::QueryClient;
use super::fetcher::{QueryFetcher, spawn_fetch};
use super::options::QueryOptions;
use super::state::QuerySnapshot;
use crate::SkuldError;
use crate::cache::slot::FetchMode;
use crate::cache::{CacheEvent, EntrySlot, Subscription};
use crate::key::QueryKey;
use crate::telemetry;

/// Handle returned by [`QueryClient::watch()`].
///
/// Reads are always served from the cache: [`state()`](Self::state) builds a
/// snapshot on demand, [`changed()`](Self::changed) and
/// [`stream()`](Self::stream) follow updates.
pub struct QueryObserver<T> {
    shared: Arc<Shared<T>>,
    snapshots: watch::Receiver<QuerySnapshot<T>>,
    driver: CancellationToken,
}

struct Shared<T> {
    client: QueryClient,
    key: QueryKey,
    fetcher: Arc<dyn QueryFetcher<T>>,
    options: Mutex<QueryOptions<T>>,
    /// `None` once unmounted.
    subscription: Mutex<Option<Subscription>>,
    options_changed: Notify,
    snapshot: watch::Sender<QuerySnapshot<T>>,
}

impl<T> QueryObserver<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn mount(
        client: QueryClient,
        key: QueryKey,
        fetcher: Arc<dyn QueryFetcher<T>>,
        options: QueryOptions<T>,
    ) -> Self {
        // Subscribe to everything before the first fetch so no event is missed.
        let events = client.cache().events();
        let focus = client.focus();
        let subscription = client.cache().subscribe(&key, options.cache_time);
        let version = subscription.slot().watch();
        let (snapshot, mut snapshots) = watch::channel(QuerySnapshot::idle());

        let shared = Arc::new(Shared {
            client,
            key,
            fetcher,
            options: Mutex::new(options),
            subscription: Mutex::new(Some(subscription)),
            options_changed: Notify::new(),
            snapshot,
        });
        shared.fetch_if_stale();
        shared.publish();
        snapshots.borrow_and_update();

        let driver = CancellationToken::new();
        tokio::spawn(drive(shared.clone(), driver.clone(), version, events, focus));
        debug!(key = %shared.key, "mounted observer");

        Self {
            shared,
            snapshots,
            driver,
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.shared.key
    }

    /// Current state, read from the cache now.
    pub fn state(&self) -> QuerySnapshot<T> {
        self.shared.snapshot()
    }

    pub fn data(&self) -> Option<T> {
        self.state().data().cloned()
    }

    pub fn error(&self) -> Option<SkuldError> {
        self.state().error().cloned()
    }

    pub fn is_loading(&self) -> bool {
        self.state().is_loading()
    }

    pub fn is_error(&self) -> bool {
        self.state().is_error()
    }

    pub fn is_fetching(&self) -> bool {
        self.state().is_fetching
    }

    /// Wait for the next published change.
    pub async fn changed(&mut self) -> QuerySnapshot<T> {
        if self.snapshots.changed().await.is_err() {
            return self.shared.snapshot();
        }
        self.snapshots.borrow_and_update().clone()
    }

    /// Wait until a published snapshot satisfies `f`, checking the latest one first.
    pub async fn wait_for(
        &mut self,
        mut f: impl FnMut(&QuerySnapshot<T>) -> bool,
    ) -> QuerySnapshot<T> {
        match self.snapshots.wait_for(|snapshot| f(snapshot)).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.shared.snapshot(),
        }
    }

    /// Stream of snapshots, starting with the latest one.
    pub fn stream(&self) -> WatchStream<QuerySnapshot<T>> {
        WatchStream::new(self.snapshots.clone())
    }

    /// Cancel the in-flight request for this key, issue a new one and wait
    /// for it to settle. Does nothing while the observer is disabled.
    pub async fn refetch(&self) -> QuerySnapshot<T> {
        if let Some((slot, generation)) = self.shared.fetch(FetchMode::Replace) {
            slot.wait_settled(generation).await;
        } else {
            debug!(key = %self.shared.key, "refetch skipped, query disabled");
        }
        self.shared.snapshot()
    }

    pub fn options(&self) -> QueryOptions<T> {
        self.shared.options()
    }

    /// Replace the options. Re-enabling or shortening `stale_time` fetches
    /// right away when the cached data is not fresh under the new options.
    pub fn set_options(&self, options: QueryOptions<T>) {
        if let Some(slot) = self.shared.slot() {
            let mut state = slot.lock();
            state.cache_time = state.cache_time.max(options.cache_time);
        }
        *self.shared.lock_options() = options;
        self.shared.fetch_if_stale();
        self.shared.options_changed.notify_one();
    }

    pub fn set_enabled(&self, enabled: bool) {
        let options = self.shared.options().enabled(enabled);
        self.set_options(options);
    }
}

impl<T> Drop for QueryObserver<T> {
    fn drop(&mut self) {
        self.driver.cancel();
        let subscription = self.shared.lock_subscription().take();
        drop(subscription);
        debug!(key = %self.shared.key, "unmounted observer");
    }
}

impl<T> Shared<T> {
    fn lock_options(&self) -> MutexGuard<'_, QueryOptions<T>> {
        self.options.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscription(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn options(&self) -> QueryOptions<T> {
        self.lock_options().clone()
    }

    fn slot(&self) -> Option<Arc<EntrySlot>> {
        self.lock_subscription()
            .as_ref()
            .map(|subscription| subscription.slot().clone())
    }
}

impl<T> Shared<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn snapshot(&self) -> QuerySnapshot<T> {
        let stale_time = self.lock_options().stale_time;
        match self.slot() {
            Some(slot) => QuerySnapshot::from_entry(&self.key, &slot.lock(), stale_time),
            None => QuerySnapshot::idle(),
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.snapshot());
    }

    /// Issue a request unless disabled or unmounted.
    fn fetch(&self, mode: FetchMode) -> Option<(Arc<EntrySlot>, u64)> {
        let options = self.options();
        if !options.enabled {
            return None;
        }
        let slot = self.slot()?;
        let generation = spawn_fetch(
            self.client.cache(),
            &slot,
            self.fetcher.clone(),
            options.retry,
            mode,
        );
        Some((slot, generation))
    }

    /// Mount behaviour: fetch when enabled and the cache has nothing fresh.
    fn fetch_if_stale(&self) {
        let options = self.options();
        if !options.enabled {
            return;
        }
        let Some(slot) = self.slot() else {
            return;
        };
        let resource = self.key.resource().to_owned();
        if slot.lock().is_fresh(options.stale_time) {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "resource" => resource).increment(1);
            return;
        }
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "resource" => resource).increment(1);
        spawn_fetch(
            self.client.cache(),
            &slot,
            self.fetcher.clone(),
            options.retry,
            FetchMode::Join,
        );
    }

    fn refetch_on_focus(&self) {
        if self.lock_options().refetch_on_window_focus {
            debug!(key = %self.key, "window focused");
            self.fetch_if_stale();
        }
    }

    /// Joins a request started after the invalidation, or replaces an older one.
    fn refetch_if_invalidated(&self) {
        let invalidated = self.slot().is_some_and(|slot| slot.lock().invalidated);
        if invalidated {
            self.fetch(FetchMode::Join);
        }
    }

    /// When the next poll is due, if polling is active.
    fn poll_deadline(&self) -> Option<Instant> {
        let options = self.options();
        if !options.enabled || options.refetch_interval.is_off() {
            return None;
        }
        let slot = self.slot()?;
        let state = slot.lock();
        if state.is_fetching() {
            return None;
        }
        let settled_at = state.last_settled_at?;
        let data = state.data.as_deref().and_then(|data| data.downcast_ref::<T>());
        options
            .refetch_interval
            .next_delay(data)
            .map(|delay| settled_at + delay)
    }

    /// Re-subscribe after our entry was removed from the cache.
    fn remount(&self) -> Option<watch::Receiver<u64>> {
        let version = {
            let mut subscription = self.lock_subscription();
            let current = subscription.as_ref()?;
            if self.client.cache().is_current(current.slot()) {
                return None;
            }
            let cache_time = self.lock_options().cache_time;
            let fresh = self.client.cache().subscribe(&self.key, cache_time);
            let version = fresh.slot().watch();
            *subscription = Some(fresh);
            version
        };
        debug!(key = %self.key, "entry removed, remounting");
        self.fetch_if_stale();
        self.publish();
        Some(version)
    }
}

async fn drive<T>(
    shared: Arc<Shared<T>>,
    token: CancellationToken,
    mut version: watch::Receiver<u64>,
    mut events: broadcast::Receiver<CacheEvent>,
    mut focus: watch::Receiver<bool>,
) where
    T: Clone + Send + Sync + 'static,
{
    loop {
        let deadline = shared.poll_deadline();
        tokio::select! {
            _ = token.cancelled() => break,
            changed = version.changed() => {
                if changed.is_err() {
                    break;
                }
                shared.publish();
            }
            event = events.recv() => match event {
                Ok(CacheEvent::Invalidated(key)) if key == shared.key => {
                    shared.fetch(FetchMode::Join);
                }
                Ok(CacheEvent::Removed(key)) if key == shared.key => {
                    if let Some(fresh) = shared.remount() {
                        version = fresh;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    debug!(key = %shared.key, missed, "observer lagged behind cache events");
                    // A missed Removed leaves us on a detached slot.
                    if let Some(fresh) = shared.remount() {
                        version = fresh;
                    }
                    shared.refetch_if_invalidated();
                }
                Err(RecvError::Closed) => break,
            },
            _ = shared.options_changed.notified() => shared.publish(),
            changed = focus.changed() => {
                if changed.is_err() {
                    break;
                }
                if *focus.borrow_and_update() {
                    shared.refetch_on_focus();
                }
            }
            _ = sleep_until(deadline) => {
                debug!(key = %shared.key, "polling");
                shared.fetch(FetchMode::Join);
            }
        }
    }
}

/// Sleep until `deadline`, or forever without one.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
