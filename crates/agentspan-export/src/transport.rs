//! Outbound span transports.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::otlp::ExportTraceServiceRequest;

const OTLP_TRACES_PATH: &str = "/api/public/otel/v1/traces";
const MAX_ERROR_BODY: usize = 512;

/// Failure of one transmission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The backend could not be reached or is temporarily unavailable.
    #[error("transient: {0}")]
    Transient(String),
    /// The backend refused the payload itself.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// One outbound transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportBatch {
    /// Idempotency key for this batch, stable across re-exports.
    pub idempotency_key: String,
    pub index: usize,
    pub total: usize,
    pub request: ExportTraceServiceRequest,
}

impl ExportBatch {
    pub fn span_count(&self) -> usize {
        self.request.span_count()
    }
}

/// Sends encoded span batches to a backend.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, batch: &ExportBatch) -> Result<(), TransportError>;
}

/// Backend endpoint and credentials, fixed at process start.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub public_key: String,
    pub secret_key: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// OTLP/HTTP JSON transport with Basic auth.
pub struct OtlpHttpTransport {
    client: Client,
    endpoint: String,
    public_key: String,
    secret_key: String,
}

impl OtlpHttpTransport {
    pub fn new(config: &BackendConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        let endpoint = format!("{}{}", config.base_url.trim_end_matches('/'), OTLP_TRACES_PATH);
        tracing::info!(endpoint = %endpoint, "OtlpHttpTransport: configured");
        Ok(Self {
            client,
            endpoint,
            public_key: config.public_key.clone(),
            secret_key: config.secret_key.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for OtlpHttpTransport {
    fn name(&self) -> &'static str {
        "otlp-http"
    }

    async fn send(&self, batch: &ExportBatch) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .header("Idempotency-Key", &batch.idempotency_key)
            .json(&batch.request)
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status();
        if status.is_success() {
            debug!(
                batch = batch.index,
                spans = batch.span_count(),
                status = status.as_u16(),
                "Batch accepted"
            );
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
        let message = format!("backend returned {status}: {body}");

        if is_transient_status(status) {
            Err(TransportError::Transient(message))
        } else {
            Err(TransportError::Rejected(message))
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn classify_error(e: reqwest::Error) -> TransportError {
    if e.is_builder() {
        TransportError::Rejected(e.to_string())
    } else {
        TransportError::Transient(e.to_string())
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
        assert!(!is_transient_status(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let transport = OtlpHttpTransport::new(&BackendConfig {
            base_url: "https://cloud.example.com/".into(),
            public_key: "pk".into(),
            secret_key: "sk".into(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(
            transport.endpoint(),
            "https://cloud.example.com/api/public/otel/v1/traces"
        );
    }

    #[test]
    fn test_error_body_truncation_respects_utf8() {
        let body = "é".repeat(400);
        let cut = floor_char_boundary(&body, MAX_ERROR_BODY);
        assert!(cut <= MAX_ERROR_BODY);
        assert!(body.is_char_boundary(cut));
    }
}
