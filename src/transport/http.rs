//! HTTP backend over reqwest: REST calls plus a server-sent-events progress stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::{SectionGenerationError, TransportError};
use crate::progress::ProgressEvent;
use crate::session::SectionContent;
use crate::transport::backend::{
    ProgressStream, SectionGenerator, SectionRequest, SessionBackend, StartRequest, StreamMessage,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn map_http_error(error: reqwest::Error) -> TransportError {
    if let Some(status) = error.status() {
        TransportError::Status {
            status: status.as_u16(),
            message: error.to_string(),
        }
    } else if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else if error.is_decode() {
        TransportError::Decode(error.to_string())
    } else {
        TransportError::Connect(format!("HTTP error: {}", error))
    }
}

#[derive(Deserialize)]
struct SessionCreated {
    #[serde(alias = "sessionId", alias = "id")]
    session_id: String,
}

#[derive(Deserialize)]
struct SectionPayload {
    #[serde(default, alias = "data", alias = "content")]
    answers: Option<SectionContent>,
    #[serde(default)]
    error: Option<String>,
}

/// REST + SSE client for the generation service.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, TransportError> {
        Self::with_timeouts(base_url, api_key, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    /// The client carries only a connect timeout; the request timeout is applied
    /// per call so the long-lived progress stream is not cut off.
    pub fn with_timeouts(
        base_url: impl Into<String>,
        api_key: Option<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Connect(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            request_timeout,
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, TransportError> {
        Self::with_timeouts(
            config.base_url.clone(),
            config.api_key.clone(),
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, TransportError> {
        let response = self
            .authorize(builder)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(map_http_error)?;
        ensure_success(response).await
    }
}

async fn ensure_success(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(TransportError::Status {
        status: status.as_u16(),
        message: extract_error_message(&message),
    })
}

/// Pull a human-readable message out of a JSON error body when there is one.
fn extract_error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(alias = "message", alias = "detail")]
        error: String,
    }
    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().to_string())
}

#[async_trait]
impl SessionBackend for HttpBackend {
    async fn start_session(&self, request: &StartRequest) -> Result<String, TransportError> {
        let response = self
            .send(self.client.post(self.url("generation/sessions")).json(request))
            .await?;
        let created: SessionCreated = response.json().await.map_err(map_http_error)?;
        Ok(created.session_id)
    }

    async fn open_stream(&self, session_id: &str) -> Result<ProgressStream, TransportError> {
        let url = self.url(&format!("generation/sessions/{session_id}/events"));
        let response = self
            .authorize(self.client.get(url).header("Accept", "text/event-stream"))
            .send()
            .await
            .map_err(map_http_error)?;
        let response = ensure_success(response).await?;
        debug!(session_id = %session_id, "progress stream opened");

        let stream = response
            .bytes_stream()
            .scan(SseDecoder::default(), |decoder, chunk| {
                let items = match chunk {
                    Ok(bytes) => decoder.push(&bytes),
                    Err(err) => vec![Err(map_http_error(err))],
                };
                futures::future::ready(Some(futures::stream::iter(items)))
            })
            .flatten();
        Ok(Box::pin(stream))
    }

    async fn poll_status(&self, session_id: &str) -> Result<ProgressEvent, TransportError> {
        let url = self.url(&format!("generation/sessions/{session_id}"));
        let response = self.send(self.client.get(url)).await?;
        response.json().await.map_err(map_http_error)
    }

    async fn fetch_section(&self, session_id: &str, key: &str) -> Result<SectionContent, TransportError> {
        let url = self.url(&format!("generation/sessions/{session_id}/sections/{key}"));
        let response = self.send(self.client.get(url)).await?;
        let payload: SectionPayload = response.json().await.map_err(map_http_error)?;
        payload
            .answers
            .ok_or_else(|| TransportError::Decode(format!("section '{key}' has no answers")))
    }

    async fn retry_section(&self, session_id: &str, key: &str) -> Result<(), TransportError> {
        let url = self.url(&format!("generation/sessions/{session_id}/sections/{key}/retry"));
        self.send(self.client.post(url)).await?;
        Ok(())
    }

    async fn cancel(&self, session_id: &str) -> Result<(), TransportError> {
        let url = self.url(&format!("generation/sessions/{session_id}/cancel"));
        self.send(self.client.post(url)).await?;
        Ok(())
    }
}

#[async_trait]
impl SectionGenerator for HttpBackend {
    async fn generate(&self, request: &SectionRequest) -> Result<SectionContent, SectionGenerationError> {
        let url = self.url(&format!("generation/sections/{}", request.section_key));
        let response = self.send(self.client.post(url).json(request)).await?;
        let payload: SectionPayload = response
            .json()
            .await
            .map_err(|e| SectionGenerationError::InvalidPayload(e.to_string()))?;
        match (payload.answers, payload.error) {
            (_, Some(error)) => Err(SectionGenerationError::Remote(error)),
            (Some(answers), None) => Ok(answers),
            (None, None) => Err(SectionGenerationError::InvalidPayload(format!(
                "section '{}' returned no answers",
                request.section_key
            ))),
        }
    }
}

/// Incremental server-sent-events decoder. Data blocks become progress
/// messages; comment-only blocks (`: keep-alive`) become keep-alives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<StreamMessage, TransportError>> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut out = Vec::new();
        while let Some(end) = find_block_end(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&block[..end]);
            if let Some(data) = block_data(&text) {
                out.push(
                    serde_json::from_str::<ProgressEvent>(&data)
                        .map(StreamMessage::Progress)
                        .map_err(|e| TransportError::Decode(e.to_string())),
                );
            } else if text.lines().any(|line| line.starts_with(':')) {
                out.push(Ok(StreamMessage::KeepAlive));
            }
        }
        out
    }
}

fn find_block_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn block_data(block: &str) -> Option<String> {
    let lines: Vec<&str> = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
