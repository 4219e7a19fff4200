//! JSON client for the dashboard REST API.
//!
//! One generic transport instead of a wrapper per endpoint: queries use
//! [`ApiClient::fetcher()`], mutations use [`ApiClient::mutation()`].

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mutation::MutationFn;
use crate::query::{QueryContext, QueryFetcher};
use crate::{Result, SkuldError};

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client bound to one API base URL.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ApiClient {
    /// Client for `base_url` with the default timeout and no token.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::builder(base_url).build()
    }

    pub fn builder(base_url: impl Into<String>) -> ApiClientBuilder {
        ApiClientBuilder {
            base_url: base_url.into(),
            token: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET {base_url}{path}` decoded as JSON.
    pub async fn get_json<T>(&self, path: &str, signal: &CancellationToken) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let request = self.http.get(self.url(path));
        self.execute(Method::GET, path, request, signal).await
    }

    /// Send `body` as JSON with `method` and decode the JSON response.
    /// An empty response body decodes as `null` (so `T = ()` works).
    pub async fn send_json<B, T>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        signal: &CancellationToken,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.http.request(method.clone(), self.url(path)).json(body);
        self.execute(method, path, request, signal).await
    }

    /// `DELETE {base_url}{path}`.
    pub async fn delete(&self, path: &str, signal: &CancellationToken) -> Result<()> {
        let request = self.http.delete(self.url(path));
        self.execute(Method::DELETE, path, request, signal).await
    }

    /// Query fetcher for `GET path`. The query's cancellation signal aborts
    /// the request.
    pub fn fetcher<T>(&self, path: impl Into<String>) -> impl QueryFetcher<T> + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        let path = path.into();
        move |ctx: QueryContext| {
            let client = client.clone();
            let path = path.clone();
            async move { client.get_json::<T>(&path, &ctx.signal).await }
        }
    }

    /// Mutation sending its variables as the JSON body of `method path`.
    pub fn mutation<B, T>(
        &self,
        method: Method,
        path: impl Into<String>,
    ) -> impl MutationFn<B, T> + 'static
    where
        B: Serialize + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        let path = path.into();
        move |body: B| {
            let client = client.clone();
            let path = path.clone();
            let method = method.clone();
            async move {
                client
                    .send_json::<B, T>(method, &path, &body, &CancellationToken::new())
                    .await
            }
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn execute<T>(
        &self,
        method: Method,
        path: &str,
        request: RequestBuilder,
        signal: &CancellationToken,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        debug!(%method, path, "sending request");
        tokio::select! {
            biased;
            _ = signal.cancelled() => {
                debug!(%method, path, "request cancelled");
                Err(SkuldError::Cancelled)
            }
            result = self.send(request) => result,
        }
    }

    async fn send<T>(&self, request: RequestBuilder) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body
            };
            return Err(SkuldError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        let body: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
        Ok(serde_json::from_slice(body)?)
    }

    fn transport_error(&self, err: reqwest::Error) -> SkuldError {
        if err.is_timeout() {
            SkuldError::Timeout(self.timeout)
        } else {
            SkuldError::from(err)
        }
    }
}

/// Builder for [`ApiClient`].
#[derive(Debug, Clone)]
pub struct ApiClientBuilder {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl ApiClientBuilder {
    /// Bearer token sent with every request.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Per-request timeout. Default: 30s.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ApiClient> {
        let http = Client::builder()
            .timeout(self.timeout)
            .user_agent(crate::version::user_agent())
            .build()
            .map_err(|e| SkuldError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(ApiClient {
            http,
            base_url: self.base_url,
            token: self.token,
            timeout: self.timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_slashes() {
        let client = ApiClient::new("http://localhost:8080/api/").unwrap();
        assert_eq!(client.url("/users"), "http://localhost:8080/api/users");
        assert_eq!(client.url("teams/7"), "http://localhost:8080/api/teams/7");
    }

    #[test]
    fn debug_redacts_token() {
        let client = ApiClient::builder("http://localhost")
            .token("secret")
            .build()
            .unwrap();
        let debug = format!("{client:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("<redacted>"));
    }
}
