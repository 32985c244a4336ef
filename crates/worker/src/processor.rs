//! HTTP chunk processor for the external normalization service.
//!
//! Sends `POST {url}` with `{"payload": ..., "params": ...}` and expects a
//! JSON result body. Every failure is classified into a
//! [`ChunkError`] kind so the retry policy can tell transient upstream
//! trouble from requests that will never succeed.

use async_trait::async_trait;
use chunkflow_core::chunk_error::{ChunkError, ErrorKind};
use chunkflow_core::settings::ExecutionSettings;
use chunkflow_pipeline::ChunkProcessor;
use reqwest::StatusCode;

/// Longest error body quoted in a chunk error message.
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Connection settings for the processing endpoint.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Full endpoint URL, e.g. `http://normalizer:8080/v1/normalize`.
    pub url: String,
    /// Sent as a bearer token when set.
    pub api_key: Option<String>,
}

/// [`ChunkProcessor`] backed by an HTTP endpoint.
pub struct HttpChunkProcessor {
    client: reqwest::Client,
    config: ProcessorConfig,
}

impl HttpChunkProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, config: ProcessorConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ChunkProcessor for HttpChunkProcessor {
    async fn process(
        &self,
        payload: &serde_json::Value,
        settings: &ExecutionSettings,
    ) -> Result<serde_json::Value, ChunkError> {
        let body = serde_json::json!({
            "payload": payload,
            "params": settings.params,
        });

        let mut request = self
            .client
            .post(&self.config.url)
            .timeout(settings.processor_timeout())
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ChunkError::new(
                classify_status(status),
                format!("processor returned {status}: {}", truncate(&body)),
            ));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ChunkError::rejected(format!("processor returned malformed JSON: {e}")))
    }
}

/// Map a non-success HTTP status to an error kind.
pub fn classify_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorKind::Timeout,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Unauthorized,
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNPROCESSABLE_ENTITY => {
            ErrorKind::InvalidPayload
        }
        s if s.is_server_error() => ErrorKind::Unavailable,
        _ => ErrorKind::Rejected,
    }
}

fn classify_transport_error(err: reqwest::Error) -> ChunkError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_builder() {
        ErrorKind::InvalidPayload
    } else {
        // Connect failures, resets, and truncated bodies.
        ErrorKind::ConnectionReset
    };
    ChunkError::new(kind, format!("request to processor failed: {err}"))
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((offset, _)) => format!("{}...", &body[..offset]),
        None => body.to_string(),
    }
}
