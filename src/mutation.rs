//! Mutations: non-cached writes with their own status.
//!
//! A [`Mutation`] has a single status slot shared by every call. Only the
//! most recently issued call writes it, so a slow older call can never
//! overwrite the status of a newer one. Each call's own future still
//! resolves with its own result. Mutations never retry.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::key::QueryKey;
use crate::query::QueryClient;
use crate::telemetry;
use crate::{Result, SkuldError};

/// Status of a mutation.
#[derive(Debug, Clone)]
pub enum MutationState<T> {
    Idle,
    Pending,
    Success(T),
    Error(SkuldError),
}

impl<T> MutationState<T> {
    pub fn is_idle(&self) -> bool {
        matches!(self, MutationState::Idle)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MutationState::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, MutationState::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, MutationState::Error(_))
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            MutationState::Success(data) => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&SkuldError> {
        match self {
            MutationState::Error(err) => Some(err),
            _ => None,
        }
    }
}

/// The write operation behind a [`Mutation`].
#[async_trait]
pub trait MutationFn<V, T>: Send + Sync {
    async fn call(&self, vars: V) -> Result<T>;
}

#[async_trait]
impl<V, T, F, Fut> MutationFn<V, T> for F
where
    F: Fn(V) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send,
    V: Send + 'static,
    T: Send + 'static,
{
    async fn call(&self, vars: V) -> Result<T> {
        self(vars).await
    }
}

/// A write with status tracking and optional cache invalidation.
///
/// ```rust,no_run
/// use skuld::{Mutation, QueryClient, query_key};
///
/// # async fn example() -> skuld::Result<()> {
/// let client = QueryClient::new();
/// let rename = Mutation::new(&client, |name: String| async move {
///     Ok::<_, skuld::SkuldError>(name.to_uppercase())
/// })
/// .invalidates(query_key!["teams"]);
///
/// let renamed = rename.mutate_async("core".to_string()).await?;
/// assert_eq!(renamed, "CORE");
/// assert!(rename.is_success());
/// # Ok(())
/// # }
/// ```
pub struct Mutation<V, T> {
    client: QueryClient,
    name: String,
    mutate: Arc<dyn MutationFn<V, T>>,
    invalidates: Vec<QueryKey>,
    latest: Arc<AtomicU64>,
    state: Arc<watch::Sender<MutationState<T>>>,
}

impl<V, T> Clone for Mutation<V, T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            name: self.name.clone(),
            mutate: self.mutate.clone(),
            invalidates: self.invalidates.clone(),
            latest: self.latest.clone(),
            state: self.state.clone(),
        }
    }
}

impl<V, T> Mutation<V, T>
where
    V: Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(client: &QueryClient, mutate: F) -> Self
    where
        F: MutationFn<V, T> + 'static,
    {
        let (state, _) = watch::channel(MutationState::Idle);
        Self {
            client: client.clone(),
            name: "mutation".to_string(),
            mutate: Arc::new(mutate),
            invalidates: Vec::new(),
            latest: Arc::new(AtomicU64::new(0)),
            state: Arc::new(state),
        }
    }

    /// Name used in logs and metric labels.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Mark cache entries under `prefix` stale after every successful call.
    pub fn invalidates(mut self, prefix: QueryKey) -> Self {
        self.invalidates.push(prefix);
        self
    }

    /// Run the mutation and resolve with its result.
    ///
    /// Nothing in the cache changes on failure.
    pub async fn mutate_async(&self, vars: V) -> Result<T> {
        let call = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_if_latest(call, MutationState::Pending);
        debug!(mutation = %self.name, call, "mutation started");

        let result = self.mutate.call(vars).await;
        match &result {
            Ok(data) => {
                for prefix in &self.invalidates {
                    self.client.invalidate_queries(prefix);
                }
                self.set_if_latest(call, MutationState::Success(data.clone()));
            }
            Err(err) => {
                warn!(mutation = %self.name, call, error = %err, "mutation failed");
                self.set_if_latest(call, MutationState::Error(err.clone()));
            }
        }
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(telemetry::MUTATIONS_TOTAL,
            "mutation" => self.name.clone(), "status" => status)
        .increment(1);
        result
    }

    /// Back to `Idle`. Calls still in flight resolve normally but no longer
    /// write the status.
    pub fn reset(&self) {
        self.latest.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(MutationState::Idle);
    }

    pub fn state(&self) -> MutationState<T> {
        self.state.borrow().clone()
    }

    /// Receiver that sees every status change.
    pub fn subscribe(&self) -> watch::Receiver<MutationState<T>> {
        self.state.subscribe()
    }

    pub fn is_idle(&self) -> bool {
        self.state.borrow().is_idle()
    }

    pub fn is_pending(&self) -> bool {
        self.state.borrow().is_pending()
    }

    /// Alias of [`is_pending()`](Self::is_pending).
    pub fn is_loading(&self) -> bool {
        self.is_pending()
    }

    pub fn is_success(&self) -> bool {
        self.state.borrow().is_success()
    }

    pub fn is_error(&self) -> bool {
        self.state.borrow().is_error()
    }

    pub fn data(&self) -> Option<T> {
        self.state.borrow().data().cloned()
    }

    pub fn error(&self) -> Option<SkuldError> {
        self.state.borrow().error().cloned()
    }

    fn set_if_latest(&self, call: u64, next: MutationState<T>) {
        self.state.send_if_modified(|state| {
            if self.latest.load(Ordering::SeqCst) != call {
                return false;
            }
            *state = next;
            true
        });
    }
}
