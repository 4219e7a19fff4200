//! Entry point for queries: owns the cache, client defaults and focus state.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::fetcher::{QueryFetcher, spawn_fetch};
use super::observer::QueryObserver;
use super::options::{QueryDefaults, QueryOptions};
use crate::cache::slot::{FetchMode, Outcome};
use crate::cache::{CacheConfig, QueryCache, downcast};
use crate::key::QueryKey;
use crate::telemetry;
use crate::{Result, SkuldError};

/// Shared handle for queries and mutations.
///
/// Cloning is cheap; every clone talks to the same [`QueryCache`].
///
/// ```rust,no_run
/// use skuld::{QueryClient, QueryContext, query_key};
///
/// # async fn example() -> skuld::Result<()> {
/// let client = QueryClient::new();
/// let mut users = client.watch(
///     query_key!["users"],
///     |_ctx: QueryContext| async { Ok::<_, skuld::SkuldError>(vec!["ada".to_string()]) },
///     client.options::<Vec<String>>(),
/// );
/// let snapshot = users.wait_for(|s| !s.is_loading()).await;
/// println!("{:?}", snapshot.data());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    cache: QueryCache,
    defaults: QueryDefaults,
    focused: watch::Sender<bool>,
}

impl QueryClient {
    /// Create a client with default cache configuration and query defaults.
    pub fn new() -> Self {
        Self::with_defaults(QueryDefaults::default())
    }

    /// Create a client whose [`QueryClient::options()`] start from `defaults`.
    pub fn with_defaults(defaults: QueryDefaults) -> Self {
        let cache = QueryCache::with_config(
            CacheConfig::new().default_cache_time(defaults.cache_time),
        );
        Self::with_cache(cache, defaults)
    }

    /// Create a client around an existing cache.
    pub fn with_cache(cache: QueryCache, defaults: QueryDefaults) -> Self {
        let (focused, _) = watch::channel(true);
        Self {
            inner: Arc::new(ClientInner {
                cache,
                defaults,
                focused,
            }),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    pub fn defaults(&self) -> &QueryDefaults {
        &self.inner.defaults
    }

    /// Query options seeded from this client's defaults.
    pub fn options<T>(&self) -> QueryOptions<T> {
        QueryOptions::from_defaults(&self.inner.defaults)
    }

    /// Mount an observer on `key`.
    ///
    /// Issues a request right away when `options.enabled` is set and the
    /// cache holds no fresh data; joins the in-flight request for the key if
    /// there is one. Dropping the observer unmounts it. Must be called from
    /// within a tokio runtime.
    pub fn watch<T, F>(
        &self,
        key: QueryKey,
        fetcher: F,
        options: QueryOptions<T>,
    ) -> QueryObserver<T>
    where
        T: Clone + Send + Sync + 'static,
        F: QueryFetcher<T> + 'static,
    {
        QueryObserver::mount(self.clone(), key, Arc::new(fetcher), options)
    }

    pub(crate) fn watch_shared<T>(
        &self,
        key: QueryKey,
        fetcher: Arc<dyn QueryFetcher<T>>,
        options: QueryOptions<T>,
    ) -> QueryObserver<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        QueryObserver::mount(self.clone(), key, fetcher, options)
    }

    /// One-shot read through the cache.
    ///
    /// Returns fresh cached data without a request; otherwise issues one
    /// (or joins the in-flight one) and waits for it. `options.enabled` is
    /// ignored: calling this is the request.
    pub async fn fetch_query<T, F>(
        &self,
        key: QueryKey,
        fetcher: F,
        options: QueryOptions<T>,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: QueryFetcher<T> + 'static,
    {
        let cache = self.cache();
        let slot = cache.slot(&key, options.cache_time);
        let resource = key.resource().to_owned();

        let cached = {
            let state = slot.lock();
            state
                .is_fresh(options.stale_time)
                .then(|| state.data.clone())
                .flatten()
        };
        if let Some(data) = cached {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "resource" => resource).increment(1);
            debug!(%key, "served fresh data from cache");
            return downcast(&key, data);
        }
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "resource" => resource).increment(1);

        let generation = spawn_fetch(
            cache,
            &slot,
            Arc::new(fetcher),
            options.retry,
            FetchMode::Join,
        );
        match slot.wait_settled(generation).await {
            Outcome::Ok => {
                let data = slot.lock().data.clone();
                match data {
                    Some(data) => downcast(&key, data),
                    None => Err(SkuldError::Cancelled),
                }
            }
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled => Err(SkuldError::Cancelled),
        }
    }

    /// Typed data cached under `key`, if any.
    pub fn get_query_data<T>(&self, key: &QueryKey) -> Result<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.cache().get(key)
    }

    /// Write `data` under `key` as a fresh successful result. Live observers
    /// see it immediately.
    pub fn set_query_data<T>(&self, key: &QueryKey, data: T)
    where
        T: Send + Sync + 'static,
    {
        self.cache().set(key, data);
    }

    /// Mark entries under `prefix` stale; live observers refetch.
    pub fn invalidate_queries(&self, prefix: &QueryKey) -> usize {
        self.cache().invalidate(prefix)
    }

    /// Cancel requests in flight under `prefix`. Their entries are left as
    /// they were before the requests started.
    pub fn cancel_queries(&self, prefix: &QueryKey) -> usize {
        self.cache().cancel(prefix)
    }

    /// Drop entries under `prefix`. Live observers start over from `Idle`.
    pub fn remove_queries(&self, prefix: &QueryKey) -> usize {
        self.cache().remove(prefix)
    }

    /// Report window focus. Regaining focus refetches stale queries of live
    /// observers that have `refetch_on_window_focus` set.
    pub fn set_focused(&self, focused: bool) {
        self.inner.focused.send_if_modified(|current| {
            let changed = *current != focused;
            *current = focused;
            changed
        });
    }

    pub fn is_focused(&self) -> bool {
        *self.inner.focused.borrow()
    }

    pub(crate) fn focus(&self) -> watch::Receiver<bool> {
        self.inner.focused.subscribe()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}
