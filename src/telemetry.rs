//! Telemetry metric name constants.
//!
//! Centralised metric names for skuld operations. Consumers install their
//! own `metrics` recorder (e.g. prometheus, statsd); without a recorder
//! installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `skuld_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `resource`: first segment of the query key (e.g. "users", "slo")
//! - `status`: "ok", "error", "cancelled" or "superseded" (a newer request
//!   for the same key replaced this one)

/// Total fetches issued to a fetcher (one per attempt sequence, not per retry).
///
/// Labels: `resource`, `status` ("ok" | "error" | "cancelled" | "superseded").
pub const FETCHES_TOTAL: &str = "skuld_fetches_total";

/// Fetch duration in seconds, retries included.
///
/// Labels: `resource`.
pub const FETCH_DURATION_SECONDS: &str = "skuld_fetch_duration_seconds";

/// Total retry attempts (not counting the initial request).
///
/// Labels: `resource`.
pub const RETRIES_TOTAL: &str = "skuld_retries_total";

/// Fetch requests that joined an already in-flight request.
///
/// Labels: `resource`.
pub const DEDUPLICATED_TOTAL: &str = "skuld_deduplicated_total";

/// Reads served from a fresh cache entry.
///
/// Labels: `resource`.
pub const CACHE_HITS_TOTAL: &str = "skuld_cache_hits_total";

/// Reads that found no fresh entry.
///
/// Labels: `resource`.
pub const CACHE_MISSES_TOTAL: &str = "skuld_cache_misses_total";

/// In-flight requests cancelled before they settled.
///
/// Labels: `resource`.
pub const CANCELLATIONS_TOTAL: &str = "skuld_cancellations_total";

/// Mutations executed.
///
/// Labels: `mutation` (name given to the mutation), `status` ("ok" | "error").
pub const MUTATIONS_TOTAL: &str = "skuld_mutations_total";

/// Inactive entries evicted after their cache time elapsed.
pub const GC_EVICTIONS_TOTAL: &str = "skuld_gc_evictions_total";
