//! Backend contracts: session-managed generation and per-section generation.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::SectionCatalog;
use crate::error::{SectionGenerationError, TransportError};
use crate::progress::ProgressEvent;
use crate::session::{ResultMap, SectionContent};

/// One message on the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Progress(ProgressEvent),
    /// Keep-alive without progress. Counts as activity for stall detection.
    KeepAlive,
}

/// Push channel of progress messages for one session.
pub type ProgressStream = Pin<Box<dyn Stream<Item = Result<StreamMessage, TransportError>> + Send>>;

/// Request that opens a server-managed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub section_keys: Vec<String>,
    pub context: Value,
}

impl StartRequest {
    pub fn new(catalog: &SectionCatalog, context: Value) -> Self {
        Self {
            section_keys: catalog.keys().map(String::from).collect(),
            context,
        }
    }
}

/// Request for exactly one section, carrying every earlier result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionRequest {
    pub section_key: String,
    pub display_name: String,
    pub expected_unit_count: u32,
    pub context: Value,
    pub previous_sections: ResultMap,
}

/// Backend that runs the whole plan server-side and reports progress.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Open a session; returns the server-issued session id.
    async fn start_session(&self, request: &StartRequest) -> Result<String, TransportError>;

    /// Subscribe to the push progress channel.
    async fn open_stream(&self, session_id: &str) -> Result<ProgressStream, TransportError>;

    /// Fetch current status on demand.
    async fn poll_status(&self, session_id: &str) -> Result<ProgressEvent, TransportError>;

    /// Fetch a finished section's payload.
    async fn fetch_section(&self, session_id: &str, key: &str) -> Result<SectionContent, TransportError>;

    /// Ask the server to re-run a failed section and continue from it.
    async fn retry_section(&self, session_id: &str, key: &str) -> Result<(), TransportError>;

    /// Best-effort stop request.
    async fn cancel(&self, session_id: &str) -> Result<(), TransportError>;
}

/// Backend that only exposes synchronous per-section calls.
#[async_trait]
pub trait SectionGenerator: Send + Sync {
    async fn generate(&self, request: &SectionRequest) -> Result<SectionContent, SectionGenerationError>;
}
