//! Diagnostics report polling: refetch every 10s while the scan runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skuld::resources::{self, DIAGNOSTICS_POLL_INTERVAL, DiagnosticsReport, ScanStatus};
use skuld::{QueryClient, QueryContext, QueryFetcher, SkuldError};
use tokio::time::Instant;

/// Serves the queued statuses in order, repeating the last one.
fn scripted(
    statuses: &[&str],
    calls: Arc<AtomicU32>,
    times: Arc<Mutex<Vec<Instant>>>,
) -> impl QueryFetcher<DiagnosticsReport> + 'static {
    let queue = Arc::new(Mutex::new(
        statuses.iter().map(|s| s.to_string()).collect::<VecDeque<_>>(),
    ));
    move |_ctx: QueryContext| {
        calls.fetch_add(1, Ordering::SeqCst);
        times.lock().unwrap().push(Instant::now());
        let status = {
            let mut queue = queue.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap()
            }
        };
        async move {
            Ok::<_, SkuldError>(
                serde_json::from_value::<DiagnosticsReport>(serde_json::json!({
                    "scanStatus": status,
                    "service": "checkout",
                }))
                .unwrap(),
            )
        }
    }
}

#[tokio::test(start_paused = true)]
async fn polls_until_scan_settles() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let times = Arc::new(Mutex::new(Vec::new()));
    let mut report = client.watch(
        resources::diagnostics_report("env-1", "v1"),
        scripted(
            &["Pending", "InProgress", "SUCCESS"],
            calls.clone(),
            times.clone(),
        ),
        resources::diagnostics_report_options(client.options()),
    );

    let done = report
        .wait_for(|s| s.data().is_some_and(|r| r.scan_status == ScanStatus::Success))
        .await;
    assert_eq!(
        done.data().unwrap().details.get("service"),
        Some(&serde_json::json!("checkout"))
    );

    // No further requests once the scan has settled.
    tokio::time::sleep(DIAGNOSTICS_POLL_INTERVAL * 5).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let times = times.lock().unwrap();
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= DIAGNOSTICS_POLL_INTERVAL, "polled after {gap:?}");
        assert!(gap < DIAGNOSTICS_POLL_INTERVAL + Duration::from_secs(1));
    }
}

#[tokio::test(start_paused = true)]
async fn unmount_stops_polling() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let times = Arc::new(Mutex::new(Vec::new()));
    let mut report = client.watch(
        resources::diagnostics_report("env-1", "v1"),
        scripted(&["InProgress"], calls.clone(), times),
        resources::diagnostics_report_options(client.options()),
    );
    report.wait_for(|s| s.is_success()).await;
    tokio::time::sleep(DIAGNOSTICS_POLL_INTERVAL + Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    drop(report);
    tokio::time::sleep(DIAGNOSTICS_POLL_INTERVAL * 5).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn invalidation_resumes_polling() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let times = Arc::new(Mutex::new(Vec::new()));
    let key = resources::diagnostics_report("env-2", "v4");
    let mut report = client.watch(
        key.clone(),
        scripted(&["FAILED", "Pending", "SUCCESS"], calls.clone(), times),
        resources::diagnostics_report_options(client.options()),
    );
    report
        .wait_for(|s| s.data().is_some_and(|r| r.scan_status == ScanStatus::Failed))
        .await;
    tokio::time::sleep(DIAGNOSTICS_POLL_INTERVAL * 2).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A rescan is requested: the refetch sees Pending and polling resumes.
    client.invalidate_queries(&key);
    report
        .wait_for(|s| s.data().is_some_and(|r| r.scan_status == ScanStatus::Success))
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn fixed_interval_polls_regardless_of_data() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let _observer = client.watch(
        skuld::query_key!["slos"],
        move |_ctx: QueryContext| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, SkuldError>(n) }
        },
        client
            .options()
            .refetch_interval(skuld::RefetchInterval::Every(Duration::from_secs(2))),
    );

    tokio::time::sleep(Duration::from_millis(6500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}
