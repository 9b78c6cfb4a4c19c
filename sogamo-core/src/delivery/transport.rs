//! Network side of delivery
//!
//! The flush controller only knows the [`Transport`] trait. [`HttpTransport`]
//! is the stock implementation: it posts the batch as a JSON array and maps
//! the response status to success, retryable or permanent failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;

use crate::error::{Error, Result, TransportError};
use crate::types::{LIB_NAME, LIB_VERSION};

use super::payload::Payload;

/// Performs one delivery attempt
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` to `url`, giving up after `timeout`
    async fn send(
        &self,
        url: &str,
        payload: &Payload,
        timeout: Duration,
    ) -> std::result::Result<(), TransportError>;
}

/// HTTP transport backed by reqwest
pub struct HttpTransport {
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with the library's default headers
    pub fn new() -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("{}/{}", LIB_NAME, LIB_VERSION))
                .map_err(|e| Error::Config(format!("invalid user agent: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        url: &str,
        payload: &Payload,
        timeout: Duration,
    ) -> std::result::Result<(), TransportError> {
        let body = payload
            .to_bytes()
            .map_err(|e| TransportError::Permanent(format!("failed to serialize batch: {}", e)))?;

        let response = self
            .http_client
            .post(url)
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        if status.is_success() {
            tracing::trace!(%url, records = payload.record_count, "Batch accepted");
            return Ok(());
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        Err(classify_status(status, &error_text))
    }
}

/// Map a non-success status to the failure kind
fn classify_status(status: StatusCode, body: &str) -> TransportError {
    let message = format!("API error ({}): {}", status, body.trim());
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        TransportError::Retryable(message)
    } else {
        TransportError::Permanent(message)
    }
}

/// Requests that never produced a response are retryable, except when the
/// request itself could not be built
fn classify_request_error(error: &reqwest::Error) -> TransportError {
    if error.is_builder() {
        TransportError::Permanent(format!("invalid request: {}", error))
    } else if error.is_timeout() {
        TransportError::Retryable(format!("request timed out: {}", error))
    } else {
        TransportError::Retryable(format!("HTTP request failed: {}", error))
    }
}
