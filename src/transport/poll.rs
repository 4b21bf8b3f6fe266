//! Pull-mode transport: requests session status on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::session::TransportMode;
use crate::transport::{
    is_terminal, GenerationTransport, SessionBackend, TransportHandle, TransportSignal,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct PollingTransport {
    backend: Arc<dyn SessionBackend>,
    interval: Duration,
}

impl PollingTransport {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl GenerationTransport for PollingTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Polling
    }

    /// The first poll fires immediately. Polls never overlap: a tick that comes
    /// due while a request is in flight is skipped.
    fn attach(
        &self,
        session_id: &str,
        sink: UnboundedSender<TransportSignal>,
        cancel: CancellationToken,
    ) -> TransportHandle {
        let token = cancel.clone();
        let backend = Arc::clone(&self.backend);
        let interval = self.interval;
        let session_id = session_id.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                trace!(session_id = %session_id, "polling session status");
                let polled = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    polled = backend.poll_status(&session_id) => polled,
                };

                match polled {
                    Ok(event) => {
                        let terminal = is_terminal(&event);
                        let delivered = sink
                            .send(TransportSignal::Event {
                                mode: TransportMode::Polling,
                                event,
                            })
                            .is_ok();
                        if terminal || !delivered {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(session_id = %session_id, error = %error, "status poll failed");
                        let _ = sink.send(TransportSignal::Failed {
                            mode: TransportMode::Polling,
                            error,
                        });
                        break;
                    }
                }
            }
            debug!(session_id = %session_id, "polling stopped");
        });

        TransportHandle::new(TransportMode::Polling, cancel, task)
    }
}
