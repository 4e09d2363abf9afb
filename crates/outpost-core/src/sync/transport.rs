//! Client side of the sync HTTP API and the retry policy around it.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use super::protocol::{ExchangeRequest, ExchangeResponse, RegisterRequest, RegisterResponse};
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::util::{compact_text, is_http_url, normalize_text_option};

/// Failures talking to the other side of an exchange
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("upgrade required: {0}")]
    UpgradeRequired(String),

    #[error("exchange rejected: {0}")]
    Rejected(String),

    #[error("registration refused: {0}")]
    Registration(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
}

impl TransportError {
    /// Whether retrying the same request may succeed
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// The two calls a client node makes against its server.
pub trait SyncTransport: Send + Sync {
    fn register(
        &self,
        request: &RegisterRequest,
    ) -> impl Future<Output = std::result::Result<RegisterResponse, TransportError>> + Send;

    fn exchange(
        &self,
        token: &str,
        request: &ExchangeRequest,
    ) -> impl Future<Output = std::result::Result<ExchangeResponse, TransportError>> + Send;
}

/// `SyncTransport` over HTTPS
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> std::result::Result<T, TransportError> {
        response
            .json::<T>()
            .await
            .map_err(|e| TransportError::Network(format!("invalid response body: {e}")))
    }
}

impl SyncTransport for HttpTransport {
    async fn register(
        &self,
        request: &RegisterRequest,
    ) -> std::result::Result<RegisterResponse, TransportError> {
        let response = self
            .client
            .post(format!("{}/sync/register", self.base_url))
            .header("Accept", "application/json")
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return Self::read_json(response).await;
        }

        let body = response.text().await.unwrap_or_default();
        let message = parse_api_error(status, &body);
        Err(match status {
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT => TransportError::Registration(message),
            _ => status_error(status, message),
        })
    }

    async fn exchange(
        &self,
        token: &str,
        request: &ExchangeRequest,
    ) -> std::result::Result<ExchangeResponse, TransportError> {
        let response = self
            .client
            .post(format!("{}/sync/exchange", self.base_url))
            .bearer_auth(token)
            .header("Accept", "application/json")
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return Self::read_json(response).await;
        }

        let body = response.text().await.unwrap_or_default();
        let message = parse_api_error(status, &body);
        Err(match status {
            StatusCode::BAD_REQUEST => TransportError::Rejected(message),
            _ => status_error(status, message),
        })
    }
}

/// Bounded retries with exponential backoff and a per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub const fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            max_attempts: settings.max_retries,
            timeout: settings.request_timeout,
            initial_backoff: settings.retry_backoff,
            max_backoff: settings.retry_backoff_max,
        }
    }

    /// Run `call` until it succeeds, fails permanently, or the attempt budget is spent.
    ///
    /// `call` must send the same request every time.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut backoff = self.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.timeout)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "Transient sync failure, retrying: {error}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2).min(self.max_backoff);
                }
                Err(error) if error.is_transient() => {
                    tracing::error!(operation, attempts = attempt, "Giving up: {error}");
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        last_error: error,
                    });
                }
                Err(error) => return Err(Error::Transport(error)),
            }
        }
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(Duration::ZERO)
    } else {
        TransportError::Network(error.to_string())
    }
}

fn status_error(status: StatusCode, message: String) -> TransportError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Unauthorized(message),
        StatusCode::UPGRADE_REQUIRED => TransportError::UpgradeRequired(message),
        _ => TransportError::Server {
            status: status.as_u16(),
            message,
        },
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput("server URL must not be empty".to_string()))?;
    if is_http_url(&url) {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "server URL must include http:// or https://".to_string(),
        ))
    }
}
