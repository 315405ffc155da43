//! Outbound webhook delivery with bounded retry.
//!
//! A [`WebhookJob`] is sent through an [`HttpSend`] implementation. Only
//! connection-level failures are retried: any HTTP status, including 4xx and
//! 5xx, completes the delivery. Attempts are separated by a fixed pause.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One outbound HTTP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookJob {
    pub uri: String,
    pub method: Method,
    pub data_type: String,
    pub payload: Option<Bytes>,
}

impl WebhookJob {
    #[must_use]
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method,
            data_type: String::new(),
            payload: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, data_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        self.data_type = data_type.into();
        self.payload = Some(payload.into());
        self
    }

    /// The `Content-Type` header value, present only when both a data type
    /// and a payload are set.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        match (&self.payload, self.data_type.is_empty()) {
            (Some(_), false) => Some(&self.data_type),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: Bytes,
}

impl WebhookResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
    /// The destination could not be reached. Retried.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The job cannot be turned into a request. Never retried.
    #[error("invalid webhook request: {0}")]
    InvalidRequest(String),
    /// The request failed for a reason retrying cannot fix, such as a
    /// redirect loop. Never retried.
    #[error("webhook request failed: {0}")]
    Failed(String),
    #[error("webhook delivery failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Which methods are retried after a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryScope {
    /// Every method, giving at-least-once delivery on connection failure.
    #[default]
    AllMethods,
    /// Only idempotent methods; others get a single attempt.
    IdempotentOnly,
}

/// Webhook retry and timeout settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub max_attempts: u32,
    pub retry_pause: Duration,
    /// Per-attempt timeout covering connect, send and body read.
    pub request_timeout: Duration,
    pub retry_scope: RetryScope,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_pause: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            retry_scope: RetryScope::AllMethods,
        }
    }
}

impl WebhookConfig {
    /// Number of attempts allowed for `method`.
    #[must_use]
    pub fn attempts_for(&self, method: &Method) -> u32 {
        match self.retry_scope {
            RetryScope::IdempotentOnly if !method.is_idempotent() => 1,
            _ => self.max_attempts.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// HttpSend
// ---------------------------------------------------------------------------

/// Performs a single HTTP attempt.
#[async_trait]
pub trait HttpSend: Send + Sync {
    /// # Errors
    ///
    /// `WebhookError::Connect` for failures worth retrying; any other
    /// variant ends the delivery.
    async fn send(&self, job: &WebhookJob, timeout: Duration)
        -> Result<WebhookResponse, WebhookError>;
}

/// [`HttpSend`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    /// # Errors
    ///
    /// Returns `WebhookError::InvalidRequest` if the HTTP client cannot be built.
    pub fn new() -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| WebhookError::InvalidRequest(e.to_string()))?;
        Ok(Self { client })
    }
}

/// Maps a failure from `send`, before any status was received.
fn classify(e: &reqwest::Error) -> WebhookError {
    if e.is_builder() {
        WebhookError::InvalidRequest(e.to_string())
    } else if e.is_connect() || e.is_timeout() || e.is_request() {
        WebhookError::Connect(e.to_string())
    } else {
        WebhookError::Failed(e.to_string())
    }
}

/// Reads the response body. The status has already arrived, so the attempt
/// counts as delivered even if the body is cut short.
async fn read_body(response: reqwest::Response, uri: &str) -> Bytes {
    match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            debug!(uri, error = %e, "webhook response body unreadable");
            Bytes::new()
        }
    }
}

#[async_trait]
impl HttpSend for ReqwestSender {
    async fn send(
        &self,
        job: &WebhookJob,
        timeout: Duration,
    ) -> Result<WebhookResponse, WebhookError> {
        let mut request = self
            .client
            .request(job.method.clone(), job.uri.as_str())
            .timeout(timeout);
        if let Some(content_type) = job.content_type() {
            request = request.header(http::header::CONTENT_TYPE, content_type);
        }
        if let Some(payload) = &job.payload {
            request = request.body(payload.clone());
        }

        let response = request.send().await.map_err(|e| classify(&e))?;
        let status = response.status().as_u16();
        let body = read_body(response, &job.uri).await;
        Ok(WebhookResponse { status, body })
    }
}

// ---------------------------------------------------------------------------
// WebhookClient
// ---------------------------------------------------------------------------

/// Delivers webhook jobs with the configured retry policy.
#[derive(Debug, Clone)]
pub struct WebhookClient<S = ReqwestSender> {
    sender: S,
    config: WebhookConfig,
}

impl WebhookClient<ReqwestSender> {
    /// Creates a client that sends over HTTP with `reqwest`.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::InvalidRequest` if the HTTP client cannot be built.
    pub fn new(config: WebhookConfig) -> Result<Self, WebhookError> {
        Ok(Self::with_sender(ReqwestSender::new()?, config))
    }
}

impl<S: HttpSend> WebhookClient<S> {
    #[must_use]
    pub fn with_sender(sender: S, config: WebhookConfig) -> Self {
        Self { sender, config }
    }

    #[must_use]
    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Sends `job`, retrying connection failures.
    ///
    /// # Errors
    ///
    /// - `WebhookError::InvalidRequest` or `WebhookError::Failed` immediately
    ///   when retrying cannot help
    /// - `WebhookError::Exhausted` once every attempt failed to connect
    pub async fn deliver(&self, job: &WebhookJob) -> Result<WebhookResponse, WebhookError> {
        let attempts = self.config.attempts_for(&job.method);
        let mut last = String::new();

        for attempt in 1..=attempts {
            match self.sender.send(job, self.config.request_timeout).await {
                Ok(response) => {
                    debug!(uri = %job.uri, method = %job.method, status = response.status, attempt, "webhook delivered");
                    return Ok(response);
                }
                Err(WebhookError::Connect(reason)) => {
                    warn!(uri = %job.uri, method = %job.method, attempt, error = %reason, "webhook attempt failed");
                    last = reason;
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_pause).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(WebhookError::Exhausted { attempts, last })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
