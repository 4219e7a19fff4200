//! Typed, immutable views of a cache entry.

use std::time::Duration;

use tokio::time::Instant;

use crate::SkuldError;
use crate::cache::slot::EntryState;
use crate::cache::{EntryStatus, downcast};
use crate::key::QueryKey;

/// State of a query as seen by one observer.
#[derive(Debug, Clone)]
pub enum QueryState<T> {
    /// Never fetched, or disabled before the first fetch.
    Idle,
    /// First fetch in progress, no data yet.
    Loading,
    Success {
        data: T,
        updated_at: Instant,
        /// Older than the observer's `stale_time`, or invalidated.
        is_stale: bool,
    },
    /// The last fetch failed. `data` holds the previous result, if any.
    Error { error: SkuldError, data: Option<T> },
}

/// Snapshot handed to observers: the query state plus whether a request is
/// in flight (a background refetch keeps `Success` visible).
#[derive(Debug, Clone)]
pub struct QuerySnapshot<T> {
    pub state: QueryState<T>,
    pub is_fetching: bool,
}

impl<T> QuerySnapshot<T> {
    pub fn idle() -> Self {
        Self {
            state: QueryState::Idle,
            is_fetching: false,
        }
    }

    pub fn data(&self) -> Option<&T> {
        match &self.state {
            QueryState::Success { data, .. } => Some(data),
            QueryState::Error { data, .. } => data.as_ref(),
            QueryState::Idle | QueryState::Loading => None,
        }
    }

    pub fn error(&self) -> Option<&SkuldError> {
        match &self.state {
            QueryState::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, QueryState::Idle)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, QueryState::Loading)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.state, QueryState::Success { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self.state, QueryState::Error { .. })
    }

    pub fn is_stale(&self) -> bool {
        match &self.state {
            QueryState::Success { is_stale, .. } => *is_stale,
            _ => true,
        }
    }
}

impl<T> Default for QuerySnapshot<T> {
    fn default() -> Self {
        Self::idle()
    }
}

impl<T> QuerySnapshot<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Build a typed snapshot. A stored value of the wrong type surfaces as
    /// an error state instead of a panic.
    pub(crate) fn from_entry(key: &QueryKey, entry: &EntryState, stale_time: Duration) -> Self {
        let data = match entry.data.clone().map(|value| downcast::<T>(key, value)) {
            Some(Ok(data)) => Some(data),
            Some(Err(error)) => {
                return Self {
                    state: QueryState::Error { error, data: None },
                    is_fetching: entry.is_fetching(),
                };
            }
            None => None,
        };

        let state = match (entry.status, data) {
            (EntryStatus::Idle, _) => QueryState::Idle,
            (EntryStatus::Loading, _) => QueryState::Loading,
            (EntryStatus::Success, Some(data)) => QueryState::Success {
                data,
                updated_at: entry.last_fetched_at.unwrap_or_else(Instant::now),
                is_stale: !entry.is_fresh(stale_time),
            },
            // Success without data cannot be produced by the cache.
            (EntryStatus::Success, None) => QueryState::Idle,
            (EntryStatus::Error, data) => QueryState::Error {
                error: entry
                    .error
                    .clone()
                    .unwrap_or_else(|| SkuldError::Fetch("unknown error".into())),
                data,
            },
        };
        Self {
            state,
            is_fetching: entry.is_fetching(),
        }
    }
}
