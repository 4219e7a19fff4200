//! Per-query configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryConfig;

/// Delay before the next poll, computed from the latest data.
pub type IntervalFn<T> = Arc<dyn Fn(Option<&T>) -> Option<Duration> + Send + Sync>;

/// Interval polling policy for a query.
pub enum RefetchInterval<T> {
    /// No polling.
    Off,
    /// Poll at a fixed delay after each settled fetch.
    Every(Duration),
    /// Ask the function after each settled fetch. `None` stops polling until
    /// a later result makes it return `Some` again.
    Dynamic(IntervalFn<T>),
}

impl<T> RefetchInterval<T> {
    /// Build a dynamic policy from a function of the latest data.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(Option<&T>) -> Option<Duration> + Send + Sync + 'static,
    {
        RefetchInterval::Dynamic(Arc::new(f))
    }

    /// Delay until the next poll given the latest data.
    pub fn next_delay(&self, data: Option<&T>) -> Option<Duration> {
        match self {
            RefetchInterval::Off => None,
            RefetchInterval::Every(delay) => Some(*delay),
            RefetchInterval::Dynamic(f) => f(data),
        }
    }

    pub fn is_off(&self) -> bool {
        matches!(self, RefetchInterval::Off)
    }
}

impl<T> Clone for RefetchInterval<T> {
    fn clone(&self) -> Self {
        match self {
            RefetchInterval::Off => RefetchInterval::Off,
            RefetchInterval::Every(delay) => RefetchInterval::Every(*delay),
            RefetchInterval::Dynamic(f) => RefetchInterval::Dynamic(f.clone()),
        }
    }
}

impl<T> fmt::Debug for RefetchInterval<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefetchInterval::Off => f.write_str("Off"),
            RefetchInterval::Every(delay) => f.debug_tuple("Every").field(delay).finish(),
            RefetchInterval::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Client-wide defaults applied to every new [`QueryOptions`].
///
/// Deserializable so the CLI can read it from the `[query]` table of its
/// config file (durations in milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryDefaults {
    /// How long data stays fresh. Default: 0 (stale immediately).
    #[serde(rename = "stale_time_ms", with = "millis")]
    pub stale_time: Duration,
    /// Retention of entries without subscribers. Default: 5 minutes.
    #[serde(rename = "cache_time_ms", with = "millis")]
    pub cache_time: Duration,
    /// Retries after the initial request. Default: 3.
    pub retry: u32,
    /// Base backoff delay. Default: 1s.
    #[serde(rename = "retry_delay_ms", with = "millis")]
    pub retry_delay: Duration,
    /// Refetch stale data when the window regains focus. Default: true.
    pub refetch_on_window_focus: bool,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            cache_time: Duration::from_secs(5 * 60),
            retry: 3,
            retry_delay: Duration::from_secs(1),
            refetch_on_window_focus: true,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_millis)
    }
}

/// Options for one query observer.
///
/// ```rust
/// # use skuld::{QueryOptions, RefetchInterval};
/// # use std::time::Duration;
/// let options: QueryOptions<u32> = QueryOptions::new()
///     .stale_time(Duration::from_secs(30))
///     .retry(1)
///     .refetch_interval(RefetchInterval::Every(Duration::from_secs(5)));
/// assert!(options.enabled);
/// ```
pub struct QueryOptions<T> {
    /// `false` guarantees the observer issues no request. Default: true.
    pub enabled: bool,
    pub retry: RetryConfig,
    pub refetch_on_window_focus: bool,
    pub refetch_interval: RefetchInterval<T>,
    pub stale_time: Duration,
    pub cache_time: Duration,
}

impl<T> QueryOptions<T> {
    /// Options seeded from [`QueryDefaults::default()`].
    pub fn new() -> Self {
        Self::from_defaults(&QueryDefaults::default())
    }

    pub fn from_defaults(defaults: &QueryDefaults) -> Self {
        Self {
            enabled: true,
            retry: RetryConfig::retries(defaults.retry).initial_delay(defaults.retry_delay),
            refetch_on_window_focus: defaults.refetch_on_window_focus,
            refetch_interval: RefetchInterval::Off,
            stale_time: defaults.stale_time,
            cache_time: defaults.cache_time,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Retries after the initial request, keeping the current backoff delays.
    pub fn retry(mut self, count: u32) -> Self {
        self.retry = self.retry.max_attempts(count.saturating_add(1));
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn refetch_on_window_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_window_focus = enabled;
        self
    }

    pub fn refetch_interval(mut self, interval: RefetchInterval<T>) -> Self {
        self.refetch_interval = interval;
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        Self {
            enabled: self.enabled,
            retry: self.retry.clone(),
            refetch_on_window_focus: self.refetch_on_window_focus,
            refetch_interval: self.refetch_interval.clone(),
            stale_time: self.stale_time,
            cache_time: self.cache_time,
        }
    }
}

impl<T> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("enabled", &self.enabled)
            .field("retry", &self.retry)
            .field("refetch_on_window_focus", &self.refetch_on_window_focus)
            .field("refetch_interval", &self.refetch_interval)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .finish()
    }
}
