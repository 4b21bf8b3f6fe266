//! Push-mode transport: forwards server stream messages until the stream ends.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::session::TransportMode;
use crate::transport::poll::DEFAULT_POLL_INTERVAL;
use crate::transport::{
    is_terminal, GenerationTransport, SessionBackend, StreamMessage, TransportHandle,
    TransportSignal,
};

pub struct StreamingTransport {
    backend: Arc<dyn SessionBackend>,
    stall_timeout: Duration,
}

impl StreamingTransport {
    /// A stream quieter than one poll interval has fallen behind polling.
    pub const DEFAULT_STALL_TIMEOUT: Duration = DEFAULT_POLL_INTERVAL;

    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend,
            stall_timeout: Self::DEFAULT_STALL_TIMEOUT,
        }
    }

    /// Silence longer than this is treated as a dead channel. Keep-alives
    /// count as activity.
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }
}

impl GenerationTransport for StreamingTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Streaming
    }

    fn attach(
        &self,
        session_id: &str,
        sink: UnboundedSender<TransportSignal>,
        cancel: CancellationToken,
    ) -> TransportHandle {
        let token = cancel.clone();
        let backend = Arc::clone(&self.backend);
        let stall_timeout = self.stall_timeout;
        let session_id = session_id.to_string();

        let task = tokio::spawn(async move {
            let fail = |error: TransportError| {
                let _ = sink.send(TransportSignal::Failed {
                    mode: TransportMode::Streaming,
                    error,
                });
            };

            let opened = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                opened = backend.open_stream(&session_id) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "failed to open progress stream");
                    fail(err);
                    return;
                }
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(session_id = %session_id, "progress stream stopped");
                        return;
                    }
                    next = tokio::time::timeout(stall_timeout, stream.next()) => next,
                };
                match next {
                    Err(_) => {
                        fail(TransportError::Stalled(stall_timeout.as_millis() as u64));
                        return;
                    }
                    Ok(None) => {
                        fail(TransportError::StreamClosed);
                        return;
                    }
                    Ok(Some(Err(err))) => {
                        fail(err);
                        return;
                    }
                    Ok(Some(Ok(StreamMessage::KeepAlive))) => {
                        trace!(session_id = %session_id, "progress stream keep-alive");
                    }
                    Ok(Some(Ok(StreamMessage::Progress(event)))) => {
                        let terminal = is_terminal(&event);
                        let delivered = sink
                            .send(TransportSignal::Event {
                                mode: TransportMode::Streaming,
                                event,
                            })
                            .is_ok();
                        if terminal || !delivered {
                            return;
                        }
                    }
                }
            }
        });

        TransportHandle::new(TransportMode::Streaming, cancel, task)
    }
}
