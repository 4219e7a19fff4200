//! Skuld - keyed query cache, polling and mutation layer for REST resources
//!
//! UI code asks for data by [`QueryKey`]; skuld serves it from a shared
//! in-memory cache, issues at most one request per key at a time, retries
//! failed reads, polls while asked to, and tracks the status of writes.
//!
//! # Query Example
//!
//! ```rust,no_run
//! use skuld::{QueryClient, QueryContext, query_key};
//!
//! #[tokio::main]
//! async fn main() -> skuld::Result<()> {
//!     let client = QueryClient::new();
//!     let mut teams = client.watch(
//!         query_key!["teams"],
//!         |_ctx: QueryContext| async { Ok::<_, skuld::SkuldError>(vec!["core".to_string()]) },
//!         client.options::<Vec<String>>(),
//!     );
//!
//!     let snapshot = teams.wait_for(|s| s.is_success() || s.is_error()).await;
//!     println!("{:?}", snapshot.data());
//!     Ok(())
//! }
//! ```
//!
//! # Polling Example
//!
//! ```rust,no_run
//! use skuld::http::ApiClient;
//! use skuld::{QueryClient, resources};
//!
//! #[tokio::main]
//! async fn main() -> skuld::Result<()> {
//!     let api = ApiClient::new("https://dash.example.com/api")?;
//!     let client = QueryClient::new();
//!     let mut report = client.watch(
//!         resources::diagnostics_report("env-7", "v3"),
//!         api.fetcher::<resources::DiagnosticsReport>("diagnostics/env-7/v3"),
//!         resources::diagnostics_report_options(client.options()),
//!     );
//!
//!     // Refetches every 10s until the scan leaves InProgress/Pending.
//!     let done = report
//!         .wait_for(|s| s.data().is_some_and(|r| !r.scan_status.is_running()))
//!         .await;
//!     println!("{:?}", done.data());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod form;
pub mod http;
pub mod key;
pub mod mutation;
pub mod query;
pub mod resources;
pub mod retry;
pub mod search;
pub mod telemetry;
pub mod version;

// Re-export main types at crate root
pub use cache::{CacheConfig, CacheEntry, CacheEvent, EntryStatus, QueryCache};
pub use error::{Result, SkuldError};
pub use form::FormState;
pub use key::{KeyPart, QueryKey};
pub use mutation::{Mutation, MutationFn, MutationState};
pub use query::{
    QueryClient, QueryContext, QueryDefaults, QueryFetcher, QueryObserver, QueryOptions,
    QuerySnapshot, QueryState, RefetchInterval,
};
pub use retry::RetryConfig;
pub use search::{DebouncedSearch, SearchConfig, SearchState};
pub use version::PKG_VERSION;
