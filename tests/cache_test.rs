//! Cache retention and prefix operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use skuld::{
    CacheConfig, CacheEvent, QueryCache, QueryClient, QueryContext, QueryDefaults, SkuldError,
    query_key,
};

const SHORT: Duration = Duration::from_millis(100);

fn slow_fetcher(calls: Arc<AtomicU32>, delay: Duration) -> impl skuld::QueryFetcher<u32> + 'static {
    move |_ctx: QueryContext| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(delay).await;
            Ok::<_, SkuldError>(1)
        }
    }
}

// ============================================================================
// Retention
// ============================================================================

#[tokio::test]
async fn inactive_entry_is_evicted_after_cache_time() {
    let client = QueryClient::new();
    let key = query_key!["users"];
    let mut events = client.cache().events();

    let observer = client.watch(
        key.clone(),
        slow_fetcher(Arc::new(AtomicU32::new(0)), Duration::ZERO),
        client.options().enabled(false).cache_time(SHORT),
    );
    assert_eq!(client.cache().entry(&key).unwrap().subscriber_count, 1);
    drop(observer);
    assert!(client.cache().entry(&key).is_some());

    tokio::time::sleep(SHORT * 3).await;
    client.cache().run_pending_tasks();
    assert!(client.cache().entry(&key).is_none());

    let mut removed = false;
    while let Ok(event) = events.try_recv() {
        removed |= event == CacheEvent::Removed(key.clone());
    }
    assert!(removed, "expected a Removed event for the evicted key");
}

#[tokio::test]
async fn observed_entry_is_never_evicted() {
    let client = QueryClient::new();
    let key = query_key!["teams"];
    let _observer = client.watch(
        key.clone(),
        slow_fetcher(Arc::new(AtomicU32::new(0)), Duration::ZERO),
        client.options().enabled(false).cache_time(SHORT),
    );

    tokio::time::sleep(SHORT * 3).await;
    client.cache().run_pending_tasks();
    assert_eq!(client.cache().entry(&key).unwrap().subscriber_count, 1);
}

#[tokio::test]
async fn entry_with_request_in_flight_is_kept() {
    let client = QueryClient::new();
    let key = query_key!["slos"];
    let calls = Arc::new(AtomicU32::new(0));

    let pending = {
        let client = client.clone();
        let key = key.clone();
        let fetcher = slow_fetcher(calls.clone(), SHORT * 4);
        tokio::spawn(async move {
            client
                .fetch_query(key, fetcher, client.options().cache_time(SHORT))
                .await
        })
    };

    tokio::time::sleep(SHORT * 2).await;
    client.cache().run_pending_tasks();
    assert!(client.cache().entry(&key).unwrap().is_fetching);

    assert_eq!(pending.await.unwrap().unwrap(), 1);
    tokio::time::sleep(SHORT * 3).await;
    client.cache().run_pending_tasks();
    assert!(client.cache().entry(&key).is_none());
}

#[tokio::test]
async fn longest_cache_time_wins() {
    let client = QueryClient::new();
    let key = query_key!["dashboards"];
    let fetcher = || slow_fetcher(Arc::new(AtomicU32::new(0)), Duration::ZERO);

    let short = client.watch(
        key.clone(),
        fetcher(),
        client.options().enabled(false).cache_time(SHORT),
    );
    let long = client.watch(
        key.clone(),
        fetcher(),
        client
            .options()
            .enabled(false)
            .cache_time(Duration::from_secs(60)),
    );
    drop(short);
    drop(long);

    tokio::time::sleep(SHORT * 3).await;
    client.cache().run_pending_tasks();
    assert!(client.cache().entry(&key).is_some());
}

// ============================================================================
// Prefix operations
// ============================================================================

#[tokio::test]
async fn prefix_operations_match_structurally() {
    let cache = QueryCache::with_config(CacheConfig::new().event_capacity(16));
    cache.set(&query_key!["teams"], 0u32);
    cache.set(&query_key!["teams", 1], 1u32);
    cache.set(&query_key!["teams", 2], 2u32);
    cache.set(&query_key!["users", 1], 3u32);
    cache.set(&query_key!["team"], 4u32);

    assert_eq!(cache.invalidate(&query_key!["teams"]), 3);
    assert!(cache.entry(&query_key!["teams", 2]).unwrap().is_invalidated);
    assert!(!cache.entry(&query_key!["team"]).unwrap().is_invalidated);

    // Invalidated data is still served.
    assert_eq!(cache.get::<u32>(&query_key!["teams", 1]).unwrap(), Some(1));

    assert_eq!(cache.remove(&query_key!["teams", 1]), 1);
    assert!(cache.entry(&query_key!["teams", 1]).is_none());
    assert_eq!(cache.len(), 4);

    cache.clear();
    assert!(cache.is_empty());
}

#[tokio::test]
async fn client_defaults_seed_options() {
    let defaults = QueryDefaults {
        stale_time: Duration::from_secs(10),
        retry: 0,
        ..QueryDefaults::default()
    };
    let client = QueryClient::with_cache(QueryCache::new(), defaults);
    let options = client.options::<u32>();
    assert_eq!(options.stale_time, Duration::from_secs(10));
    assert_eq!(options.retry.max_attempts, 1);
}
