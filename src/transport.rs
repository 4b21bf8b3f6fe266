//! Generation Transport
//!
//! How progress is observed for a server-managed session. Two interchangeable
//! strategies, push-mode streaming and pull-mode polling, report through the
//! same `TransportSignal` channel so the orchestrator does not care which one is
//! attached. Each attached strategy runs as its own task and stops when its
//! handle is stopped or dropped.

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::progress::ProgressEvent;
use crate::session::TransportMode;

pub mod backend;
pub mod http;
pub mod poll;
pub mod stream;

pub use backend::{
    ProgressStream, SectionGenerator, SectionRequest, SessionBackend, StartRequest, StreamMessage,
};
pub use http::HttpBackend;
pub use poll::PollingTransport;
pub use stream::StreamingTransport;

/// Output of an attached transport.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    Event {
        mode: TransportMode,
        event: ProgressEvent,
    },
    Failed {
        mode: TransportMode,
        error: TransportError,
    },
}

impl TransportSignal {
    pub fn mode(&self) -> TransportMode {
        match self {
            TransportSignal::Event { mode, .. } | TransportSignal::Failed { mode, .. } => *mode,
        }
    }
}

/// A progress observation strategy.
pub trait GenerationTransport: Send + Sync {
    fn mode(&self) -> TransportMode;

    /// Start observing `session_id`, delivering signals into `sink` until
    /// `cancel` fires. Must be called from within a tokio runtime.
    fn attach(
        &self,
        session_id: &str,
        sink: UnboundedSender<TransportSignal>,
        cancel: CancellationToken,
    ) -> TransportHandle;
}

/// Owner of a running transport task.
#[derive(Debug)]
pub struct TransportHandle {
    mode: TransportMode,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    pub(crate) fn new(mode: TransportMode, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            mode,
            cancel,
            task: Some(task),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
            || self.task.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }

    /// Stop the task and wait until it has exited.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(crate) fn is_terminal(event: &ProgressEvent) -> bool {
    use crate::session::OverallStatus;
    matches!(
        event.overall_status,
        OverallStatus::Completed | OverallStatus::Failed | OverallStatus::Cancelled
    )
}
