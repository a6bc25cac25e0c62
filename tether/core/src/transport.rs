//! Push-stream and polling transports
//!
//! Traits at the network seam plus their `reqwest` implementations. The core
//! only ever sees byte chunks ([`ByteStream`]) and JSON snapshots, so tests
//! can script either side without a server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TetherError;
use crate::poller::PollingEndpoint;

/// Raw body chunks of a push stream
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TetherError>>;

/// Supplies credentials for outgoing requests
///
/// Tokens are consumed as-is; refreshing them is the caller's business.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Bearer token to attach, if any
    async fn bearer_token(&self) -> Option<String>;
}

/// Fixed bearer token
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap a token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Request that opens a push stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Endpoint URL
    pub url: String,
    /// JSON request body
    pub body: Value,
    /// Resumption cursor sent as `Last-Event-ID`
    pub last_event_id: Option<String>,
}

impl PushRequest {
    /// Create a request
    pub fn new(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            body,
            last_event_id: None,
        }
    }

    /// Set the resumption cursor
    #[must_use]
    pub fn with_last_event_id(mut self, id: Option<String>) -> Self {
        self.last_event_id = id;
        self
    }
}

/// Opens push streams
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Send the request and return the response body as a byte stream
    ///
    /// Unsuccessful statuses are mapped with [`TetherError::from_status`].
    async fn open(&self, request: &PushRequest) -> Result<ByteStream, TetherError>;
}

/// Build a client with a connect timeout and no overall request timeout
/// (push streams stay open for minutes)
///
/// # Errors
///
/// Returns [`TetherError::Transport`] if the TLS backend cannot initialise.
pub fn build_client(connect_timeout: Duration) -> Result<reqwest::Client, TetherError> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| TetherError::Transport(format!("failed to build HTTP client: {e}")))
}

pub(crate) async fn authorize(
    builder: reqwest::RequestBuilder,
    credentials: Option<&Arc<dyn CredentialProvider>>,
) -> reqwest::RequestBuilder {
    match credentials {
        Some(provider) => match provider.bearer_token().await {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        },
        None => builder,
    }
}

/// Turn an unsuccessful response into an error carrying its body
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, TetherError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        body
    };
    Err(TetherError::from_status(status.as_u16(), message))
}

/// SSE over HTTP
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl HttpTransport {
    /// Create a transport using `client`
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            credentials: None,
        }
    }

    /// Attach a credential provider
    #[must_use]
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(&self, request: &PushRequest) -> Result<ByteStream, TetherError> {
        let mut builder = self
            .client
            .post(&request.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .json(&request.body);
        if let Some(id) = &request.last_event_id {
            builder = builder.header("Last-Event-ID", id);
        }
        let builder = authorize(builder, self.credentials.as_ref()).await;

        tracing::debug!(url = %request.url, resume = request.last_event_id.is_some(), "Opening push stream");
        let response = check_status(builder.send().await?).await?;

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(TetherError::from))
            .boxed())
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("credentials", &self.credentials.is_some())
            .finish_non_exhaustive()
    }
}

/// Polls `GET {base_url}/{resource_id}` for JSON snapshots
#[derive(Clone)]
pub struct HttpPollingEndpoint {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<Arc<dyn CredentialProvider>>,
    request_timeout: Duration,
}

impl HttpPollingEndpoint {
    /// Create an endpoint
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            credentials: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Attach a credential provider
    #[must_use]
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Per-request timeout
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// URL of one resource
    #[must_use]
    pub fn resource_url(&self, resource_id: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), resource_id)
    }
}

#[async_trait]
impl PollingEndpoint for HttpPollingEndpoint {
    async fn fetch(&self, resource_id: &str) -> Result<Value, TetherError> {
        let builder = self
            .client
            .get(self.resource_url(resource_id))
            .timeout(self.request_timeout);
        let builder = authorize(builder, self.credentials.as_ref()).await;
        let response = check_status(builder.send().await?).await?;
        Ok(response.json::<Value>().await?)
    }
}

impl std::fmt::Debug for HttpPollingEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPollingEndpoint")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
