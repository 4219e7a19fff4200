//! Per-key entry slot: status, type-erased data, and the in-flight request.
//!
//! Every request issued for a key gets a monotonically increasing
//! generation. Only the settlement of the current generation may write the
//! entry; anything older is dropped. A cancelled request restores the
//! status it found when it started. Invalidation is tracked against the
//! newest generation issued at that point: only a request started afterwards
//! can make the entry fresh again, and fetches never join an older one.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::SkuldError;
use crate::key::QueryKey;

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Created but never fetched.
    Idle,
    /// First fetch in progress, no data yet.
    Loading,
    /// Holds data from a successful fetch.
    Success,
    /// Last fetch failed. Previous data, if any, is kept.
    Error,
}

/// How a new fetch treats a request already in flight for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
    /// Join the in-flight request instead of issuing another, unless it was
    /// issued before the entry was invalidated; then replace it.
    Join,
    /// Cancel the in-flight request and issue a new one.
    Replace,
}

/// Result of asking a slot to begin a fetch.
pub(crate) enum Begin {
    Joined(u64),
    Started {
        generation: u64,
        token: CancellationToken,
    },
}

/// Settled result of one generation.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Ok,
    Failed(SkuldError),
    Cancelled,
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
    prior_status: EntryStatus,
    prior_error: Option<SkuldError>,
}

pub(crate) struct EntryState {
    pub(crate) status: EntryStatus,
    pub(crate) data: Option<AnyValue>,
    pub(crate) error: Option<SkuldError>,
    pub(crate) last_fetched_at: Option<Instant>,
    pub(crate) last_settled_at: Option<Instant>,
    pub(crate) invalidated: bool,
    /// Newest generation issued when the entry was last invalidated.
    invalidated_through: u64,
    pub(crate) subscribers: usize,
    pub(crate) cache_time: Duration,
    in_flight: Option<InFlight>,
    settled: Option<(u64, Outcome)>,
    next_generation: u64,
}

impl EntryState {
    pub(crate) fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Fresh means successful, not invalidated, and younger than `stale_time`.
    pub(crate) fn is_fresh(&self, stale_time: Duration) -> bool {
        self.status == EntryStatus::Success
            && !self.invalidated
            && self
                .last_fetched_at
                .is_some_and(|at| at.elapsed() < stale_time)
    }

    /// Whether an in-flight request of `generation` predates the last
    /// invalidation and so cannot serve fresh data.
    fn predates_invalidation(&self, generation: u64) -> bool {
        self.invalidated && generation <= self.invalidated_through
    }

    /// Expiry while nobody watches and nothing is in flight.
    fn idle_ttl(&self) -> Option<Duration> {
        (self.subscribers == 0 && self.in_flight.is_none()).then_some(self.cache_time)
    }
}

pub(crate) struct EntrySlot {
    key: QueryKey,
    state: Mutex<EntryState>,
    version: watch::Sender<u64>,
}

impl EntrySlot {
    pub(crate) fn new(key: QueryKey, cache_time: Duration) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            key,
            state: Mutex::new(EntryState {
                status: EntryStatus::Idle,
                data: None,
                error: None,
                last_fetched_at: None,
                last_settled_at: None,
                invalidated: false,
                invalidated_through: 0,
                subscribers: 0,
                cache_time,
                in_flight: None,
                settled: None,
                next_generation: 0,
            }),
            version,
        }
    }

    pub(crate) fn key(&self) -> &QueryKey {
        &self.key
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receiver that changes whenever the entry does.
    pub(crate) fn watch(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub(crate) fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub(crate) fn idle_ttl(&self) -> Option<Duration> {
        self.lock().idle_ttl()
    }

    pub(crate) fn add_subscriber(&self, cache_time: Duration) {
        let mut state = self.lock();
        state.subscribers += 1;
        // Longest requested retention wins while several observers share the key.
        state.cache_time = state.cache_time.max(cache_time);
    }

    pub(crate) fn remove_subscriber(&self) -> usize {
        let mut state = self.lock();
        state.subscribers = state.subscribers.saturating_sub(1);
        state.subscribers
    }

    pub(crate) fn begin(&self, mode: FetchMode) -> Begin {
        let begin = {
            let mut state = self.lock();
            if mode == FetchMode::Join
                && let Some(in_flight) = &state.in_flight
                && !state.predates_invalidation(in_flight.generation)
            {
                return Begin::Joined(in_flight.generation);
            }

            let (prior_status, prior_error) = match state.in_flight.take() {
                Some(previous) => {
                    previous.token.cancel();
                    (previous.prior_status, previous.prior_error)
                }
                None => (state.status, state.error.clone()),
            };

            state.next_generation += 1;
            let generation = state.next_generation;
            let token = CancellationToken::new();
            if state.data.is_none() {
                state.status = EntryStatus::Loading;
                state.error = None;
            }
            state.in_flight = Some(InFlight {
                generation,
                token: token.clone(),
                prior_status,
                prior_error,
            });
            Begin::Started { generation, token }
        };
        self.notify();
        begin
    }

    /// Apply the result of `generation`. Returns `false` when the request
    /// was superseded and its result dropped.
    pub(crate) fn settle(&self, generation: u64, result: crate::Result<AnyValue>) -> bool {
        {
            let mut state = self.lock();
            let Some(in_flight) = state
                .in_flight
                .take_if(|in_flight| in_flight.generation == generation)
            else {
                return false;
            };

            let now = Instant::now();
            let outcome = match result {
                Ok(value) => {
                    state.status = EntryStatus::Success;
                    state.data = Some(value);
                    state.error = None;
                    state.last_fetched_at = Some(now);
                    state.last_settled_at = Some(now);
                    // A request issued before the invalidation may hold old data.
                    state.invalidated = state.predates_invalidation(generation);
                    Outcome::Ok
                }
                Err(SkuldError::Cancelled) => {
                    state.status = in_flight.prior_status;
                    state.error = in_flight.prior_error;
                    Outcome::Cancelled
                }
                Err(err) => {
                    state.status = EntryStatus::Error;
                    state.error = Some(err.clone());
                    state.last_settled_at = Some(now);
                    Outcome::Failed(err)
                }
            };
            state.settled = Some((generation, outcome));
        }
        self.notify();
        true
    }

    /// Cancel the in-flight request, if any. Returns whether one was cancelled.
    pub(crate) fn cancel(&self) -> bool {
        let state = self.lock();
        match &state.in_flight {
            Some(in_flight) => {
                in_flight.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until `generation` and every newer request has settled, then
    /// return the outcome of the latest settled one.
    pub(crate) async fn wait_settled(&self, generation: u64) -> Outcome {
        let mut rx = self.watch();
        loop {
            {
                let state = self.lock();
                let pending = state
                    .in_flight
                    .as_ref()
                    .is_some_and(|in_flight| in_flight.generation >= generation);
                if !pending {
                    return match &state.settled {
                        Some((settled, outcome)) if *settled >= generation => outcome.clone(),
                        _ => Outcome::Cancelled,
                    };
                }
            }
            if rx.changed().await.is_err() {
                return Outcome::Cancelled;
            }
        }
    }

    pub(crate) fn mark_invalidated(&self) {
        {
            let mut state = self.lock();
            state.invalidated = true;
            state.invalidated_through = state.next_generation;
        }
        self.notify();
    }

    pub(crate) fn set_data(&self, value: AnyValue) {
        {
            let mut state = self.lock();
            let now = Instant::now();
            state.status = EntryStatus::Success;
            state.data = Some(value);
            state.error = None;
            state.last_fetched_at = Some(now);
            state.last_settled_at = Some(now);
            state.invalidated = false;
        }
        self.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> EntrySlot {
        EntrySlot::new(crate::query_key!["users"], Duration::from_secs(300))
    }

    fn value(v: i32) -> AnyValue {
        Arc::new(v)
    }

    fn started(begin: Begin) -> (u64, CancellationToken) {
        match begin {
            Begin::Started { generation, token } => (generation, token),
            Begin::Joined(_) => panic!("expected a new request"),
        }
    }

    #[test]
    fn join_reuses_in_flight_generation() {
        let slot = slot();
        let (generation, _) = started(slot.begin(FetchMode::Join));
        match slot.begin(FetchMode::Join) {
            Begin::Joined(joined) => assert_eq!(joined, generation),
            Begin::Started { .. } => panic!("should join"),
        }
        assert_eq!(slot.lock().status, EntryStatus::Loading);
    }

    #[test]
    fn invalidation_replaces_older_request() {
        let slot = slot();
        let (stale, stale_token) = started(slot.begin(FetchMode::Join));
        slot.mark_invalidated();

        let (fresh, _) = started(slot.begin(FetchMode::Join));
        assert!(stale_token.is_cancelled());
        match slot.begin(FetchMode::Join) {
            Begin::Joined(joined) => assert_eq!(joined, fresh),
            Begin::Started { .. } => panic!("should join the post-invalidation request"),
        }

        assert!(!slot.settle(stale, Ok(value(1))));
        assert!(slot.settle(fresh, Ok(value(2))));
        assert!(!slot.lock().invalidated);
    }

    #[test]
    fn older_result_does_not_clear_invalidation() {
        let slot = slot();
        let (stale, _) = started(slot.begin(FetchMode::Join));
        slot.mark_invalidated();

        // Settles before anyone asked for a replacement.
        assert!(slot.settle(stale, Ok(value(1))));
        let state = slot.lock();
        assert!(state.invalidated);
        assert!(!state.is_fresh(Duration::from_secs(600)));
    }

    #[test]
    fn superseded_result_is_dropped() {
        let slot = slot();
        let (old, old_token) = started(slot.begin(FetchMode::Join));
        let (new, _) = started(slot.begin(FetchMode::Replace));
        assert!(old_token.is_cancelled());
        assert!(new > old);

        assert!(slot.settle(new, Ok(value(2))));
        assert!(!slot.settle(old, Ok(value(1))));

        let state = slot.lock();
        let data = state.data.clone().unwrap().downcast::<i32>().unwrap();
        assert_eq!(*data, 2);
    }

    #[test]
    fn cancellation_restores_prior_status() {
        let slot = slot();
        let (generation, _) = started(slot.begin(FetchMode::Join));
        assert_eq!(slot.lock().status, EntryStatus::Loading);
        assert!(slot.settle(generation, Err(SkuldError::Cancelled)));
        let state = slot.lock();
        assert_eq!(state.status, EntryStatus::Idle);
        assert!(state.data.is_none());
        assert!(state.last_settled_at.is_none());
    }

    #[test]
    fn error_keeps_previous_data() {
        let slot = slot();
        let (first, _) = started(slot.begin(FetchMode::Join));
        slot.settle(first, Ok(value(1)));
        let (second, _) = started(slot.begin(FetchMode::Join));
        // Refetching with data keeps the success status visible.
        assert_eq!(slot.lock().status, EntryStatus::Success);
        slot.settle(second, Err(SkuldError::Http("down".into())));

        let state = slot.lock();
        assert_eq!(state.status, EntryStatus::Error);
        assert!(state.data.is_some());
        assert!(matches!(state.error, Some(SkuldError::Http(_))));
    }

    #[test]
    fn idle_ttl_only_without_subscribers_or_requests() {
        let slot = slot();
        assert_eq!(slot.idle_ttl(), Some(Duration::from_secs(300)));
        slot.add_subscriber(Duration::from_secs(10));
        assert_eq!(slot.idle_ttl(), None);
        slot.remove_subscriber();
        let (generation, _) = started(slot.begin(FetchMode::Join));
        assert_eq!(slot.idle_ttl(), None);
        slot.settle(generation, Ok(value(1)));
        assert_eq!(slot.idle_ttl(), Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn wait_settled_reports_outcome() {
        let slot = Arc::new(slot());
        let (generation, _) = started(slot.begin(FetchMode::Join));
        let settler = slot.clone();
        tokio::spawn(async move {
            settler.settle(generation, Err(SkuldError::Http("boom".into())));
        });
        match slot.wait_settled(generation).await {
            Outcome::Failed(SkuldError::Http(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn freshness_window() {
        let slot = slot();
        slot.set_data(value(1));
        let state = slot.lock();
        assert!(state.is_fresh(Duration::from_secs(60)));
        assert!(!state.is_fresh(Duration::ZERO));
    }
}
