//! Debounced search over a query key family.
//!
//! Keystrokes go in through [`DebouncedSearch::input()`]; the text is
//! committed once no new input arrived for the debounce period. Each commit
//! cancels the in-flight request of the previous text and observes the key
//! `base + [text]`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::key::QueryKey;
use crate::query::{
    QueryClient, QueryFetcher, QueryObserver, QueryOptions, QuerySnapshot, sleep_until,
};

/// Debounce settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchConfig {
    /// Quiet period before input is committed. Default: 300ms.
    pub debounce: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
        }
    }
}

impl SearchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// Published search state. `snapshot` always belongs to `text`.
#[derive(Debug, Clone)]
pub struct SearchState<T> {
    /// Last committed text, `None` before the first commit.
    pub text: Option<String>,
    pub snapshot: QuerySnapshot<T>,
}

/// Search box backed by the query cache.
pub struct DebouncedSearch<T> {
    input: mpsc::UnboundedSender<String>,
    state: watch::Receiver<SearchState<T>>,
    _task: DropGuard,
}

impl<T> DebouncedSearch<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start the search task. Must be called from within a tokio runtime.
    pub fn new<F>(
        client: &QueryClient,
        base: QueryKey,
        fetcher: F,
        options: QueryOptions<T>,
        config: SearchConfig,
    ) -> Self
    where
        F: QueryFetcher<T> + 'static,
    {
        let (input, inputs) = mpsc::unbounded_channel();
        let (publish, state) = watch::channel(SearchState {
            text: None,
            snapshot: QuerySnapshot::idle(),
        });
        let token = CancellationToken::new();
        let task = SearchTask {
            client: client.clone(),
            base,
            fetcher: Arc::new(fetcher),
            options,
            debounce: config.debounce,
            publish,
        };
        tokio::spawn(task.run(inputs, token.clone()));
        Self {
            input,
            state,
            _task: token.drop_guard(),
        }
    }

    /// Feed the current text of the search box.
    pub fn input(&self, text: impl Into<String>) {
        // The task only stops when this handle is dropped.
        let _ = self.input.send(text.into());
    }

    pub fn state(&self) -> SearchState<T> {
        self.state.borrow().clone()
    }

    /// Last committed text.
    pub fn committed(&self) -> Option<String> {
        self.state.borrow().text.clone()
    }

    /// Wait until the published state satisfies `f`.
    pub async fn wait_for(&mut self, mut f: impl FnMut(&SearchState<T>) -> bool) -> SearchState<T> {
        if let Ok(state) = self.state.wait_for(|state| f(state)).await {
            return state.clone();
        }
        self.state.borrow().clone()
    }
}

struct SearchTask<T> {
    client: QueryClient,
    base: QueryKey,
    fetcher: Arc<dyn QueryFetcher<T>>,
    options: QueryOptions<T>,
    debounce: Duration,
    publish: watch::Sender<SearchState<T>>,
}

impl<T> SearchTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn run(self, mut inputs: mpsc::UnboundedReceiver<String>, token: CancellationToken) {
        let mut pending: Option<(String, Instant)> = None;
        let mut committed: Option<String> = None;
        let mut observer: Option<QueryObserver<T>> = None;

        loop {
            let deadline = pending.as_ref().map(|(_, at)| *at + self.debounce);
            tokio::select! {
                _ = token.cancelled() => break,
                text = inputs.recv() => match text {
                    Some(text) => pending = Some((text, Instant::now())),
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    let Some((text, _)) = pending.take() else {
                        continue;
                    };
                    if committed.as_deref() == Some(text.as_str()) {
                        continue;
                    }
                    if let Some(previous) = observer.take() {
                        let cancelled = self.client.cancel_queries(previous.key());
                        debug!(key = %previous.key(), cancelled, "superseded search");
                    }
                    let key = self.base.clone().with(text.clone());
                    debug!(%key, "committing search");
                    let next = self.client.watch_shared(
                        key,
                        self.fetcher.clone(),
                        self.options.clone(),
                    );
                    self.publish.send_replace(SearchState {
                        text: Some(text.clone()),
                        snapshot: next.state(),
                    });
                    committed = Some(text);
                    observer = Some(next);
                }
                snapshot = next_change(&mut observer) => {
                    self.publish.send_modify(|state| state.snapshot = snapshot);
                }
            }
        }
    }
}

async fn next_change<T>(observer: &mut Option<QueryObserver<T>>) -> QuerySnapshot<T>
where
    T: Clone + Send + Sync + 'static,
{
    match observer {
        Some(observer) => observer.changed().await,
        None => std::future::pending().await,
    }
}
