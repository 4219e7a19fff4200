//! Fetcher trait and the spawned request that writes results into the cache.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::slot::{Begin, FetchMode};
use crate::cache::{AnyValue, CacheEvent, EntrySlot, QueryCache};
use crate::key::QueryKey;
use crate::retry::{RetryConfig, with_retry};
use crate::telemetry;
use crate::{Result, SkuldError};

/// Passed to every fetch attempt.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub key: QueryKey,
    /// Cancelled when the request is superseded, cancelled or removed.
    /// Fetchers should stop work and return [`SkuldError::Cancelled`].
    pub signal: CancellationToken,
}

/// Produces the data for a query key.
///
/// Implemented for any `Fn(QueryContext) -> impl Future<Output = Result<T>>`,
/// so plain async closures work:
///
/// ```rust
/// # use skuld::{QueryContext, QueryFetcher};
/// fn users() -> impl QueryFetcher<Vec<String>> {
///     |_ctx: QueryContext| async { Ok::<_, skuld::SkuldError>(vec!["ada".to_string()]) }
/// }
/// ```
#[async_trait]
pub trait QueryFetcher<T>: Send + Sync {
    async fn fetch(&self, ctx: QueryContext) -> Result<T>;
}

#[async_trait]
impl<T, F, Fut> QueryFetcher<T> for F
where
    F: Fn(QueryContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send,
    T: Send + 'static,
{
    async fn fetch(&self, ctx: QueryContext) -> Result<T> {
        self(ctx).await
    }
}

/// Start (or join) a request for `slot` and return its generation.
///
/// The request runs on its own task so it settles even if every observer
/// that asked for it has gone away.
pub(crate) fn spawn_fetch<T>(
    cache: &QueryCache,
    slot: &Arc<EntrySlot>,
    fetcher: Arc<dyn QueryFetcher<T>>,
    retry: RetryConfig,
    mode: FetchMode,
) -> u64
where
    T: Send + Sync + 'static,
{
    let key = slot.key().clone();
    let (generation, token) = match slot.begin(mode) {
        Begin::Joined(generation) => {
            metrics::counter!(telemetry::DEDUPLICATED_TOTAL,
                "resource" => key.resource().to_owned())
            .increment(1);
            debug!(%key, generation, "joined in-flight request");
            return generation;
        }
        Begin::Started { generation, token } => (generation, token),
    };
    debug!(%key, generation, ?mode, "starting fetch");
    cache.touch(slot);
    cache.emit(CacheEvent::Updated(key.clone()));

    let cache = cache.clone();
    let slot = slot.clone();
    tokio::spawn(async move {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SkuldError::Cancelled),
            result = with_retry(&retry, &key, &token, || {
                fetcher.fetch(QueryContext {
                    key: key.clone(),
                    signal: token.clone(),
                })
            }) => result,
        };
        let resource = key.resource().to_owned();
        metrics::histogram!(telemetry::FETCH_DURATION_SECONDS, "resource" => resource.clone())
            .record(started.elapsed().as_secs_f64());

        let mut status = match &result {
            Ok(_) => "ok",
            Err(SkuldError::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        if let Err(err) = &result
            && !err.is_cancelled()
        {
            debug!(%key, generation, error = %err, "fetch failed");
        }

        let applied = slot.settle(generation, result.map(|data| Arc::new(data) as AnyValue));
        cache.touch(&slot);
        if applied {
            cache.emit(CacheEvent::Updated(key.clone()));
        } else {
            debug!(%key, generation, "dropped superseded result");
            status = "superseded";
        }
        metrics::counter!(telemetry::FETCHES_TOTAL, "resource" => resource, "status" => status)
            .increment(1);
    });
    generation
}
