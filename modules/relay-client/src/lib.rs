//! HTTP client for the relay's status protocol.

use reqwest::{header, Client, Response};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use threatwatch_core::{HealthResponse, Snapshot, StartRequest, StartResponse, StatusList};
use url::Url;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("relay unreachable: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("relay returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("invalid relay url: {0}")]
    Url(String),
}

impl ClientError {
    /// Worth asking again later; a rejected request or a bad payload is not.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) | ClientError::Timeout(_) => true,
            ClientError::Upstream { status, .. } => *status >= 500 || *status == 429,
            ClientError::Decode(_) | ClientError::Url(_) => false,
        }
    }
}

/// Where execution status comes from. The polling controller is generic over this so it
/// can be driven by the HTTP client or by a scripted source.
pub trait StatusSource: Send + Sync + 'static {
    fn start(&self, req: &StartRequest) -> impl Future<Output = Result<StartResponse, ClientError>> + Send;
    fn snapshot(&self, execution_id: &str) -> impl Future<Output = Result<Snapshot, ClientError>> + Send;
    fn health(&self) -> impl Future<Output = Result<HealthResponse, ClientError>> + Send;
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    base: Url,
    http: Client,
    timeout: Duration,
}

impl RelayClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let base = Url::parse(base_url).map_err(|e| ClientError::Url(format!("{}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::Url(base_url.to_string()));
        }
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(format!("threatwatch/{}", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(RelayClient { base, http, timeout })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Url(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Every status read goes to the relay; nothing is served from a cache.
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ClientError> {
        let resp = self
            .http
            .get(url)
            .header(header::CACHE_CONTROL, "no-cache, no-store")
            .header(header::PRAGMA, "no-cache")
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        self.decode(resp).await
    }

    async fn decode<T: DeserializeOwned>(&self, resp: Response) -> Result<T, ClientError> {
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| self.transport(e))?;
        if !status.is_success() {
            return Err(ClientError::Upstream { status: status.as_u16(), message: error_message(&bytes) });
        }
        serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
    }

    fn transport(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() { ClientError::Timeout(self.timeout) } else { ClientError::Transport(e.to_string()) }
    }

    pub async fn list(&self) -> Result<StatusList, ClientError> {
        self.get_json(self.endpoint(&["status"])?).await
    }
}

impl StatusSource for RelayClient {
    async fn start(&self, req: &StartRequest) -> Result<StartResponse, ClientError> {
        let url = self.endpoint(&["start"])?;
        tracing::debug!(%url, source = %req.source_path, "start request");
        let resp = self.http.post(url).json(req).send().await.map_err(|e| self.transport(e))?;
        self.decode(resp).await
    }

    async fn snapshot(&self, execution_id: &str) -> Result<Snapshot, ClientError> {
        self.get_json(self.endpoint(&["status", execution_id])?).await
    }

    async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.get_json(self.endpoint(&["health"])?).await
    }
}

/// Human-readable message from an error body: the `error` field of a JSON body, else the
/// trimmed text.
fn error_message(body: &[u8]) -> String {
    if let Ok(v) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(msg) = v.get("error").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    if text.is_empty() { "no response body".to_string() } else { text }
}
