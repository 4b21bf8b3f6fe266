//! Server-managed sessions: the backend generates, we watch.
//!
//! Progress arrives through an attached transport. Streaming is tried first;
//! its first failure switches the session to polling, once. A polling failure
//! leaves the session in progress with a visible transport error.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::SectionCatalog;
use crate::error::{OrchestratorError, SectionGenerationError, TransportError};
use crate::executor::SectionFailure;
use crate::orchestrator::hooks::Effect;
use crate::orchestrator::Shared;
use crate::progress::ProgressEvent;
use crate::session::{GenerationSession, OverallStatus, SectionContent, SectionStatus, TransportMode};
use crate::transport::{
    GenerationTransport, SessionBackend, StartRequest, TransportHandle, TransportSignal,
};

/// Ask the backend for a session, then follow it until it settles.
pub(super) async fn open(
    shared: &Arc<Shared>,
    backend: &Arc<dyn SessionBackend>,
    local_id: &str,
    catalog: &SectionCatalog,
    context: serde_json::Value,
    token: &CancellationToken,
) -> Result<(), OrchestratorError> {
    let request = StartRequest::new(catalog, context);
    let started = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(()),
        started = backend.start_session(&request) => started,
    };

    let remote_id = match started {
        Ok(id) => id,
        Err(error) => {
            let mut state = shared.state.lock();
            if let Some(session) = state.as_mut().filter(|s| s.id == local_id) {
                if session.overall_status == OverallStatus::Starting {
                    session.overall_status = OverallStatus::Idle;
                }
            }
            warn!(session_id = %local_id, error = %error, "backend refused to start session");
            return Err(OrchestratorError::SessionStart(error));
        }
    };

    let attached = {
        let mut state = shared.state.lock();
        match state.as_mut().filter(|s| s.id == local_id) {
            Some(session) if session.overall_status == OverallStatus::Starting => {
                session.id = remote_id.clone();
                session.overall_status = OverallStatus::InProgress;
                session.transport_mode = TransportMode::Streaming;
                true
            }
            _ => false,
        }
    };
    if !attached {
        // Cancelled while the start call was in flight.
        notify_cancel(backend, remote_id);
        return Ok(());
    }
    info!(session_id = %remote_id, "backend session opened");

    pump(shared, backend, &remote_id, TransportMode::Streaming, token).await;
    Ok(())
}

/// Ask the backend to regenerate `key`, then follow the session again.
pub(super) async fn retry(
    shared: &Arc<Shared>,
    backend: &Arc<dyn SessionBackend>,
    session_id: &str,
    key: &str,
    mode: TransportMode,
    token: &CancellationToken,
) -> Result<(), OrchestratorError> {
    let requested = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(()),
        requested = backend.retry_section(session_id, key) => requested,
    };

    if let Err(error) = requested {
        let failure = SectionFailure {
            key: key.to_string(),
            error: SectionGenerationError::from(error.clone()),
        };
        let failed = {
            let mut state = shared.state.lock();
            match state.as_mut().filter(|s| s.id == session_id) {
                Some(session) if session.overall_status == OverallStatus::InProgress => {
                    session.mark_failed(key, failure.message(), Utc::now());
                    session.overall_status = OverallStatus::Failed;
                    true
                }
                _ => false,
            }
        };
        warn!(session_id = %session_id, section = %key, error = %error, "retry request failed");
        if failed {
            shared.dispatch(vec![Effect::Failed(failure)]);
        }
        return Err(OrchestratorError::RetryRequest {
            key: key.to_string(),
            error,
        });
    }

    {
        let mut state = shared.state.lock();
        if let Some(session) = state.as_mut().filter(|s| s.id == session_id) {
            if session.overall_status == OverallStatus::InProgress {
                if let Err(violation) = session.mark_started(key, Utc::now()) {
                    debug!(section = %key, error = %violation, "retried section not marked started");
                }
            }
        }
    }

    pump(shared, backend, session_id, mode, token).await;
    Ok(())
}

/// Best-effort cancel notice. Never awaited by the caller.
pub(super) fn notify_cancel(backend: &Arc<dyn SessionBackend>, session_id: String) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(session_id = %session_id, "no runtime available, cancel notice not sent");
        return;
    };
    let backend = Arc::clone(backend);
    runtime.spawn(async move {
        match backend.cancel(&session_id).await {
            Ok(()) => debug!(session_id = %session_id, "backend acknowledged cancel"),
            Err(error) => warn!(session_id = %session_id, error = %error, "cancel notice failed"),
        }
    });
}

fn attach(
    shared: &Shared,
    backend: &Arc<dyn SessionBackend>,
    mode: TransportMode,
    session_id: &str,
    token: &CancellationToken,
) -> (TransportHandle, mpsc::UnboundedReceiver<TransportSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = match mode {
        TransportMode::Polling => shared
            .polling(backend)
            .attach(session_id, tx, token.child_token()),
        _ => shared
            .streaming(backend)
            .attach(session_id, tx, token.child_token()),
    };
    debug!(session_id = %session_id, mode = ?handle.mode(), "transport attached");
    (handle, rx)
}

/// Route transport signals into the session until it settles, the run is
/// cancelled, or polling gives up. The attached transport stops on return.
async fn pump(
    shared: &Arc<Shared>,
    backend: &Arc<dyn SessionBackend>,
    session_id: &str,
    mode: TransportMode,
    token: &CancellationToken,
) {
    let (mut handle, mut rx) = attach(shared, backend, mode, session_id, token);

    loop {
        let signal = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            signal = rx.recv() => signal,
        };
        // A transport that exits without a signal is treated as a failure.
        let signal = signal.unwrap_or_else(|| TransportSignal::Failed {
            mode: handle.mode(),
            error: TransportError::StreamClosed,
        });

        match signal {
            TransportSignal::Event { event, .. } => {
                if shared.apply_event(backend, session_id, event, token).await {
                    break;
                }
            }
            TransportSignal::Failed {
                mode: TransportMode::Streaming,
                error,
            } => {
                if !shared.begin_failover(session_id, &error) {
                    break;
                }
                handle.stop();
                (handle, rx) = attach(shared, backend, TransportMode::Polling, session_id, token);
            }
            TransportSignal::Failed { error, .. } => {
                shared.record_transport_error(session_id, &error);
                break;
            }
        }
    }
    handle.stop();
}

impl Shared {
    /// Switch a streaming session to polling. Only ever succeeds once.
    fn begin_failover(&self, session_id: &str, error: &TransportError) -> bool {
        let mut state = self.state.lock();
        let Some(session) = state.as_mut().filter(|s| s.id == session_id) else {
            return false;
        };
        if matches!(
            session.overall_status,
            OverallStatus::Completed | OverallStatus::Cancelled
        ) || session.failed_over
            || session.transport_mode != TransportMode::Streaming
        {
            debug!(session_id = %session_id, error = %error, "stream failure ignored");
            return false;
        }
        session.transport_mode = TransportMode::Polling;
        session.failed_over = true;
        info!(session_id = %session_id, error = %error, "progress stream failed, falling back to polling");
        true
    }

    fn record_transport_error(&self, session_id: &str, error: &TransportError) {
        let mut state = self.state.lock();
        if let Some(session) = state.as_mut().filter(|s| s.id == session_id) {
            if session.overall_status == OverallStatus::InProgress {
                warn!(session_id = %session_id, error = %error, "polling failed, progress updates stopped");
                session.transport_error = Some(error.to_string());
            }
        }
    }

    /// Apply one progress event. Returns true once the session has settled.
    ///
    /// Events reporting less than the session already knows are dropped.
    /// Newly completed sections are applied strictly in catalog order; payloads
    /// missing from the event are fetched from `backend`.
    pub(super) async fn apply_event(
        &self,
        backend: &Arc<dyn SessionBackend>,
        session_id: &str,
        event: ProgressEvent,
        token: &CancellationToken,
    ) -> bool {
        let newly_completed = {
            let state = self.state.lock();
            let Some(session) = state.as_ref().filter(|s| s.id == session_id) else {
                return true;
            };
            if session.overall_status != OverallStatus::InProgress {
                return session.overall_status.is_settled();
            }
            if event.lags(session) {
                debug!(
                    session_id = %session_id,
                    reported = event.completed_keys.len(),
                    known = session.completed_count(),
                    "discarding stale progress event"
                );
                return false;
            }
            completion_prefix(session, &event)
        };

        let mut payloads: Vec<(String, SectionContent)> = Vec::with_capacity(newly_completed.len());
        let mut fetch_error: Option<TransportError> = None;
        for key in newly_completed {
            if let Some(content) = event.results.get(&key) {
                payloads.push((key, content.clone()));
                continue;
            }
            let fetched = tokio::select! {
                biased;
                _ = token.cancelled() => return true,
                fetched = backend.fetch_section(session_id, &key) => fetched,
            };
            match fetched {
                Ok(content) => payloads.push((key, content)),
                Err(error) => {
                    warn!(session_id = %session_id, section = %key, error = %error, "failed to fetch section result");
                    fetch_error = Some(error);
                    break;
                }
            }
        }

        let (effects, settled) = {
            let mut state = self.state.lock();
            let Some(session) = state.as_mut().filter(|s| s.id == session_id) else {
                return true;
            };
            if session.overall_status != OverallStatus::InProgress {
                debug!(session_id = %session_id, "discarding event applied after cancellation");
                return session.overall_status.is_settled();
            }
            let effects = apply_to_session(session, event, payloads, fetch_error);
            (effects, session.overall_status.is_settled())
        };
        self.dispatch(effects);
        settled
    }
}

/// Keys the event reports as completed that extend the session's completed
/// prefix without gaps.
fn completion_prefix(session: &GenerationSession, event: &ProgressEvent) -> Vec<String> {
    let mut keys = Vec::new();
    for state in session.sections.values() {
        if state.status == SectionStatus::Completed {
            continue;
        }
        if !event.completed_keys.contains(&state.key) {
            break;
        }
        keys.push(state.key.clone());
    }
    keys
}

fn apply_to_session(
    session: &mut GenerationSession,
    event: ProgressEvent,
    payloads: Vec<(String, SectionContent)>,
    fetch_error: Option<TransportError>,
) -> Vec<Effect> {
    let now = Utc::now();
    let mut effects = Vec::new();

    if let Some(percent) = event.server_progress_percent {
        let percent = percent.clamp(0.0, 100.0);
        session.server_percent = Some(percent);
        session.percent_floor = session.percent_floor.max(percent);
    }

    for (key, content) in payloads {
        if !session.mark_completed(&key, content.clone(), now) {
            continue;
        }
        info!(
            session_id = %session.id,
            section = %key,
            completed = session.completed_count(),
            total = session.total(),
            "section completed"
        );
        effects.push(Effect::SectionCompleted {
            session_id: session.id.clone(),
            key,
            result: content,
            accumulated: session.results(),
        });
    }

    if let Some(current) = event.current_section_key.as_deref() {
        if session.next_runnable().map(|spec| spec.key.as_str()) == Some(current) {
            match session.mark_started(current, now) {
                Ok(()) => info!(session_id = %session.id, section = %current, "section started"),
                Err(violation) => debug!(section = %current, error = %violation, "current section not started"),
            }
        }
    }

    match event.overall_status {
        OverallStatus::Failed => {
            // The failing section is always the first unfinished one.
            let key = first_unfinished(session);
            if let Some(reported) = event.current_section_key.as_deref() {
                if key.as_deref() != Some(reported) {
                    debug!(
                        session_id = %session.id,
                        reported = %reported,
                        failing = ?key,
                        "failure reported against a later section"
                    );
                }
            }
            let message = event
                .error_message
                .clone()
                .unwrap_or_else(|| "generation failed".to_string());
            fail_section(session, key, SectionGenerationError::Remote(message), &mut effects);
        }
        OverallStatus::Completed => {
            if session.all_completed() {
                session.overall_status = OverallStatus::Completed;
                session.percent_floor = 100.0;
                info!(session_id = %session.id, "generation completed");
                effects.push(Effect::Completed(session.results()));
            } else {
                let error = match fetch_error {
                    Some(error) => SectionGenerationError::from(error),
                    None => SectionGenerationError::InvalidPayload(
                        "backend reported completion without section result".to_string(),
                    ),
                };
                let key = first_unfinished(session);
                fail_section(session, key, error, &mut effects);
            }
        }
        OverallStatus::Cancelled => {
            session.overall_status = OverallStatus::Cancelled;
            info!(session_id = %session.id, "backend cancelled the session");
        }
        OverallStatus::Idle | OverallStatus::Starting | OverallStatus::InProgress => {}
    }
    effects
}

fn first_unfinished(session: &GenerationSession) -> Option<String> {
    session
        .sections
        .values()
        .find(|s| s.status != SectionStatus::Completed)
        .map(|s| s.key.clone())
}

fn fail_section(
    session: &mut GenerationSession,
    key: Option<String>,
    error: SectionGenerationError,
    effects: &mut Vec<Effect>,
) {
    let Some(key) = key else {
        return;
    };
    session.mark_failed(&key, error.to_string(), Utc::now());
    session.overall_status = OverallStatus::Failed;
    warn!(session_id = %session.id, section = %key, error = %error, "section failed, generation halted");
    effects.push(Effect::Failed(SectionFailure { key, error }));
}
