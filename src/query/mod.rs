//! Queries: observers, fetchers, options and the client that ties them to
//! the cache.

mod client;
mod fetcher;
mod observer;
mod options;
mod state;

pub use client::QueryClient;
pub use fetcher::{QueryContext, QueryFetcher};
pub use observer::QueryObserver;
pub(crate) use observer::sleep_until;
pub use options::{IntervalFn, QueryDefaults, QueryOptions, RefetchInterval};
pub use state::{QuerySnapshot, QueryState};
