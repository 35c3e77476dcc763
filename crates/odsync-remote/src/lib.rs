//! Rate-limited access to remote OData-style collections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use reqwest::header::ACCEPT;
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "odsync-remote";

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(10);

/// Serializes callers so that granted slots are at least `min_interval` apart.
///
/// The inner mutex is held across the sleep, so waiting callers queue in FIFO order.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_granted: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_granted: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait_for_slot(&self) {
        let mut last = self.last_granted.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid url {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Timeouts, refused connections, 5xx and 429 are expected to clear up on a later pass.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request { source, .. } => {
                classify_reqwest_error(source) == RetryDisposition::Retryable
            }
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Decode { .. } | FetchError::InvalidUrl(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct RemoteClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub credentials: Option<Credentials>,
    pub backoff: BackoffPolicy,
}

impl Default for RemoteClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            credentials: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// The remote side of a sync pass. Every call is expected to go through a rate limiter.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn base_url(&self) -> &str;

    async fn discover_collections(&self) -> Result<Vec<String>, FetchError>;

    async fn fetch_collection(&self, collection: &str) -> Result<Vec<JsonValue>, FetchError>;

    async fn preview_collection(
        &self,
        collection: &str,
        top: usize,
    ) -> Result<Vec<JsonValue>, FetchError>;

    async fn count_records(&self, collection: &str) -> Result<u64, FetchError>;
}

/// HTTP client for one remote base address.
#[derive(Debug)]
pub struct HttpRemoteClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
    limiter: Arc<RateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpRemoteClient {
    pub fn new(
        base_url: &str,
        config: RemoteClientConfig,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, FetchError> {
        let base_url = normalize_base_url(base_url);
        Url::parse(&base_url).map_err(|_| FetchError::InvalidUrl(base_url.clone()))?;

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(|source| FetchError::Request {
            url: base_url.clone(),
            source,
        })?;

        Ok(Self {
            client,
            base_url,
            credentials: config.credentials,
            limiter,
            backoff: config.backoff,
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn collection_url(&self, collection: &str, query: &[(&str, &str)]) -> Result<Url, FetchError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|_| FetchError::InvalidUrl(self.base_url.clone()))?;
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .push(collection);
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("$format", "json");
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<JsonValue, FetchError> {
        let url_text = url.to_string();
        let span = info_span!("remote_get", url = %url_text);

        async {
            let mut attempt = 0usize;
            loop {
                self.limiter.wait_for_slot().await;

                let mut request = self.client.get(url.clone()).header(ACCEPT, "application/json");
                if let Some(creds) = &self.credentials {
                    request = request.basic_auth(&creds.username, Some(&creds.password));
                }

                let err = match request.send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let body = resp.bytes().await.map_err(|source| FetchError::Request {
                                url: url_text.clone(),
                                source,
                            })?;
                            debug!(bytes = body.len(), "remote response received");
                            return serde_json::from_slice(&body).map_err(|source| {
                                FetchError::Decode {
                                    url: url_text.clone(),
                                    source,
                                }
                            });
                        }
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: url_text.clone(),
                        }
                    }
                    Err(source) => FetchError::Request {
                        url: url_text.clone(),
                        source,
                    },
                };

                if err.is_transient() && attempt < self.backoff.max_retries {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %err, "transient remote failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn discover_collections(&self) -> Result<Vec<String>, FetchError> {
        let url =
            Url::parse(&self.base_url).map_err(|_| FetchError::InvalidUrl(self.base_url.clone()))?;
        let document = self.get_json(url).await?;
        Ok(collection_names_from_service_document(&document))
    }

    async fn fetch_collection(&self, collection: &str) -> Result<Vec<JsonValue>, FetchError> {
        let url = self.collection_url(collection, &[])?;
        Ok(records_from_payload(self.get_json(url).await?))
    }

    async fn preview_collection(
        &self,
        collection: &str,
        top: usize,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let top = top.to_string();
        let url = self.collection_url(collection, &[("$top", top.as_str())])?;
        Ok(records_from_payload(self.get_json(url).await?))
    }

    async fn count_records(&self, collection: &str) -> Result<u64, FetchError> {
        let url = self.collection_url(collection, &[("$count", "true")])?;
        Ok(count_from_payload(&self.get_json(url).await?))
    }
}

/// Accepts the loose forms operators paste into config: `@host/path/`, `host/path`, ...
pub fn normalize_base_url(raw: &str) -> String {
    let mut url = raw.trim();
    if let Some(stripped) = url.strip_prefix('@') {
        url = stripped;
    }
    let lower = url.to_ascii_lowercase();
    let mut out = if lower.starts_with("http://") || lower.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{url}")
    };
    while out.ends_with('/') {
        out.pop();
    }
    out
}

/// Percent-decodes a collection name; undecodable input is returned unchanged.
pub fn decode_collection_name(name: &str) -> String {
    percent_decode_str(name)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| name.to_string())
}

pub fn collection_names_from_service_document(document: &JsonValue) -> Vec<String> {
    let Some(entries) = document.get("value").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            ["name", "url", "entitySet", "title"]
                .iter()
                .find_map(|field| entry.get(*field).and_then(JsonValue::as_str))
        })
        .map(decode_collection_name)
        .collect()
}

/// Responses are either a bare array or an object carrying a `value` array.
pub fn records_from_payload(payload: JsonValue) -> Vec<JsonValue> {
    match payload {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => match map.remove("value") {
            Some(JsonValue::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

pub fn count_from_payload(payload: &JsonValue) -> u64 {
    if let Some(n) = payload.get("@odata.count").and_then(json_count) {
        return n;
    }
    if let Some(n) = payload.get("count").and_then(json_count) {
        return n;
    }
    if let Some(items) = payload.get("value").and_then(JsonValue::as_array) {
        return items.len() as u64;
    }
    payload.as_array().map(|a| a.len() as u64).unwrap_or(0)
}

fn json_count(value: &JsonValue) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}
