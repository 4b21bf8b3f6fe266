//! Scripted in-memory backends shared by the integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use grantflow::catalog::SectionCatalog;
use grantflow::error::{SectionGenerationError, TransportError};
use grantflow::progress::ProgressEvent;
use grantflow::session::{ResultMap, SectionContent};
use grantflow::transport::{
    ProgressStream, SectionGenerator, SectionRequest, SessionBackend, StartRequest, StreamMessage,
};

pub fn small_catalog() -> SectionCatalog {
    SectionCatalog::from_entries(&[("a", "Alpha", 1), ("b", "Beta", 2), ("c", "Gamma", 1)]).unwrap()
}

pub fn answer(key: &str) -> SectionContent {
    let mut content = SectionContent::new();
    content.insert(format!("{key}-q1"), format!("{key} answer"));
    content
}

/// Inline payloads for `keys`.
pub fn results_for(keys: &[&str]) -> ResultMap {
    keys.iter().map(|k| (k.to_string(), answer(k))).collect()
}

/// Per-section generator with queued failures and optional delays.
#[derive(Default)]
pub struct ScriptedGenerator {
    failures: Mutex<HashMap<String, VecDeque<SectionGenerationError>>>,
    delays: Mutex<HashMap<String, Duration>>,
    pub calls: Mutex<Vec<(String, usize)>>,
}

impl ScriptedGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(self: &Arc<Self>, key: &str, error: SectionGenerationError) -> Arc<Self> {
        self.failures
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(error);
        Arc::clone(self)
    }

    pub fn delay(self: &Arc<Self>, key: &str, delay: Duration) -> Arc<Self> {
        self.delays.lock().insert(key.to_string(), delay);
        Arc::clone(self)
    }

    pub fn called_keys(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(k, _)| k.clone()).collect()
    }
}

#[async_trait]
impl SectionGenerator for ScriptedGenerator {
    async fn generate(&self, request: &SectionRequest) -> Result<SectionContent, SectionGenerationError> {
        self.calls
            .lock()
            .push((request.section_key.clone(), request.previous_sections.len()));
        let delay = self.delays.lock().get(&request.section_key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .failures
            .lock()
            .get_mut(&request.section_key)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(error) => Err(error),
            None => Ok(answer(&request.section_key)),
        }
    }
}

pub type Script = Vec<Result<ProgressEvent, TransportError>>;

/// One scripted stream per `open_stream` call. A script either ends (the
/// stream closes) or hangs after its last item.
pub struct StreamScript {
    pub items: Script,
    pub hang: bool,
}

impl StreamScript {
    pub fn closing(items: Script) -> Self {
        Self { items, hang: false }
    }

    pub fn hanging(items: Script) -> Self {
        Self { items, hang: true }
    }
}

/// Session backend driven entirely by scripts.
#[derive(Default)]
pub struct ScriptedBackend {
    pub start_error: Mutex<Option<TransportError>>,
    streams: Mutex<VecDeque<Result<StreamScript, TransportError>>>,
    polls: Mutex<VecDeque<Result<ProgressEvent, TransportError>>>,
    pub opens: Mutex<usize>,
    pub poll_count: Mutex<usize>,
    pub fetched: Mutex<Vec<String>>,
    pub retried: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stream(self: &Arc<Self>, script: StreamScript) -> Arc<Self> {
        self.streams.lock().push_back(Ok(script));
        Arc::clone(self)
    }

    pub fn stream_error(self: &Arc<Self>, error: TransportError) -> Arc<Self> {
        self.streams.lock().push_back(Err(error));
        Arc::clone(self)
    }

    pub fn poll(self: &Arc<Self>, response: Result<ProgressEvent, TransportError>) -> Arc<Self> {
        self.polls.lock().push_back(response);
        Arc::clone(self)
    }
}

pub const REMOTE_ID: &str = "remote-1";

#[async_trait]
impl SessionBackend for ScriptedBackend {
    async fn start_session(&self, _request: &StartRequest) -> Result<String, TransportError> {
        match self.start_error.lock().take() {
            Some(error) => Err(error),
            None => Ok(REMOTE_ID.to_string()),
        }
    }

    async fn open_stream(&self, _session_id: &str) -> Result<ProgressStream, TransportError> {
        *self.opens.lock() += 1;
        let script = self
            .streams
            .lock()
            .pop_front()
            .unwrap_or(Err(TransportError::Connect("no stream scripted".to_string())))?;
        let head = futures::stream::iter(
            script
                .items
                .into_iter()
                .map(|item| item.map(StreamMessage::Progress)),
        );
        if script.hang {
            Ok(Box::pin(head.chain(futures::stream::pending())))
        } else {
            Ok(Box::pin(head))
        }
    }

    async fn poll_status(&self, _session_id: &str) -> Result<ProgressEvent, TransportError> {
        *self.poll_count.lock() += 1;
        self.polls
            .lock()
            .pop_front()
            .unwrap_or(Err(TransportError::Connect("no poll scripted".to_string())))
    }

    async fn fetch_section(&self, _session_id: &str, key: &str) -> Result<SectionContent, TransportError> {
        self.fetched.lock().push(key.to_string());
        Ok(answer(key))
    }

    async fn retry_section(&self, _session_id: &str, key: &str) -> Result<(), TransportError> {
        self.retried.lock().push(key.to_string());
        Ok(())
    }

    async fn cancel(&self, session_id: &str) -> Result<(), TransportError> {
        self.cancelled.lock().push(session_id.to_string());
        Ok(())
    }
}
