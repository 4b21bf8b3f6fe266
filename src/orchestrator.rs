//! Generation Orchestrator
//!
//! Owns the session state machine. Drives either a server-managed session
//! (start call, progress transport with one-way failover) or a self-driven loop
//! that runs the section executor one section at a time. Every state change goes
//! through a single mutex-guarded `GenerationSession`; the lock is never held
//! across an await point.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::autosave::AutoSave;
use crate::catalog::SectionCatalog;
use crate::config::{BackendMode, GrantflowConfig};
use crate::error::{OrchestratorError, SequencingViolation};
use crate::executor::{SectionExecutor, SectionFailure};
use crate::progress::{self, EstimatorSettings, ProgressEvent, TimeRemaining};
use crate::session::{
    new_session_id, GenerationSession, OverallStatus, ResultMap, SectionStatus, SessionSnapshot,
    TransportMode,
};
use crate::transport::{HttpBackend, PollingTransport, SessionBackend, StreamingTransport};

pub mod hooks;
mod local;
mod server;

pub use hooks::{CompletedHook, FailedHook, SectionCompleted, SectionCompletedHook};

use hooks::Hooks;

/// How sections get produced.
#[derive(Clone)]
pub enum Driver {
    /// The backend runs the whole session; progress arrives over a transport.
    ServerManaged(Arc<dyn SessionBackend>),
    /// Sections are generated locally, one call per section.
    SelfDriven(SectionExecutor),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
    pub estimator: EstimatorSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: crate::transport::poll::DEFAULT_POLL_INTERVAL,
            stall_timeout: StreamingTransport::DEFAULT_STALL_TIMEOUT,
            estimator: EstimatorSettings::default(),
        }
    }
}

pub(crate) struct Shared {
    driver: Driver,
    settings: OrchestratorSettings,
    state: Mutex<Option<GenerationSession>>,
    context: Mutex<Value>,
    /// Cancelled by `cancel()`; transports and the local loop run on child tokens.
    run: Mutex<CancellationToken>,
    hooks: Mutex<Hooks>,
}

impl Shared {
    fn streaming(&self, backend: &Arc<dyn SessionBackend>) -> StreamingTransport {
        StreamingTransport::new(Arc::clone(backend)).with_stall_timeout(self.settings.stall_timeout)
    }

    fn polling(&self, backend: &Arc<dyn SessionBackend>) -> PollingTransport {
        PollingTransport::new(Arc::clone(backend)).with_interval(self.settings.poll_interval)
    }

    fn current_token(&self) -> CancellationToken {
        self.run.lock().clone()
    }
}

/// Cloneable handle; clones share one session.
#[derive(Clone)]
pub struct GenerationOrchestrator {
    shared: Arc<Shared>,
}

impl GenerationOrchestrator {
    pub fn new(driver: Driver, settings: OrchestratorSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver,
                settings,
                state: Mutex::new(None),
                context: Mutex::new(Value::Null),
                run: Mutex::new(CancellationToken::new()),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    pub fn self_driven(executor: SectionExecutor) -> Self {
        Self::new(Driver::SelfDriven(executor), OrchestratorSettings::default())
    }

    pub fn server_managed(backend: Arc<dyn SessionBackend>) -> Self {
        Self::new(Driver::ServerManaged(backend), OrchestratorSettings::default())
    }

    /// Build an orchestrator talking HTTP to the configured backend.
    pub fn from_config(config: &GrantflowConfig) -> Result<Self, OrchestratorError> {
        let http = Arc::new(
            HttpBackend::from_config(&config.backend)
                .map_err(|e| OrchestratorError::Config(e.to_string()))?,
        );
        let driver = match config.backend.mode {
            BackendMode::ServerManaged => Driver::ServerManaged(http),
            BackendMode::SelfDriven => Driver::SelfDriven(SectionExecutor::with_timeouts(
                http,
                config.generation.timeout_policy(),
            )),
        };
        let settings = OrchestratorSettings {
            poll_interval: config.generation.poll_interval(),
            stall_timeout: config.generation.stall_timeout(),
            estimator: config.generation.estimator(),
        };
        Ok(Self::new(driver, settings))
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.shared.settings
    }

    pub fn on_section_completed<F>(&self, hook: F) -> &Self
    where
        F: Fn(&SectionCompleted<'_>) -> Result<(), crate::error::PersistError> + Send + Sync + 'static,
    {
        self.shared.hooks.lock().section_completed.push(Arc::new(hook));
        self
    }

    pub fn on_completed<F>(&self, hook: F) -> &Self
    where
        F: Fn(ResultMap) + Send + Sync + 'static,
    {
        self.shared.hooks.lock().completed.push(Arc::new(hook));
        self
    }

    pub fn on_failed<F>(&self, hook: F) -> &Self
    where
        F: Fn(&SectionFailure) + Send + Sync + 'static,
    {
        self.shared.hooks.lock().failed.push(Arc::new(hook));
        self
    }

    /// Persist after every completed section. Save failures are recorded on the
    /// session and never block generation.
    pub fn with_auto_save(self, saver: Arc<dyn AutoSave>) -> Self {
        self.on_section_completed(move |done| saver.persist(done.key, done.result, done.accumulated));
        self
    }

    /// Open a session and drive it until it settles: completed, failed,
    /// cancelled, or waiting on a dead transport.
    pub async fn start(
        &self,
        catalog: SectionCatalog,
        context: Value,
    ) -> Result<SessionSnapshot, OrchestratorError> {
        let catalog = Arc::new(catalog);
        let token = CancellationToken::new();
        let session_id = {
            let mut state = self.shared.state.lock();
            if let Some(current) = state.as_ref() {
                if !current.overall_status.is_settled() {
                    return Err(SequencingViolation::AlreadyRunning.into());
                }
            }
            let mut session = GenerationSession::new(new_session_id(), Arc::clone(&catalog));
            session.overall_status = OverallStatus::Starting;
            session.started_at = Some(Utc::now());
            let id = session.id.clone();
            *state = Some(session);
            *self.shared.context.lock() = context.clone();
            let previous = std::mem::replace(&mut *self.shared.run.lock(), token.clone());
            previous.cancel();
            id
        };
        info!(session_id = %session_id, sections = catalog.len(), "generation starting");

        match &self.shared.driver {
            Driver::SelfDriven(executor) => {
                {
                    let mut state = self.shared.state.lock();
                    if let Some(session) = state.as_mut().filter(|s| s.id == session_id) {
                        if session.overall_status == OverallStatus::Starting {
                            session.overall_status = OverallStatus::InProgress;
                        }
                    }
                }
                local::run(&self.shared, executor, &token).await;
            }
            Driver::ServerManaged(backend) => {
                server::open(&self.shared, backend, &session_id, &catalog, context, &token).await?;
            }
        }
        self.snapshot()
            .ok_or_else(|| SequencingViolation::NoActiveSession.into())
    }

    /// Re-run the first failed section and continue forward from it.
    pub async fn retry_section(&self, key: &str) -> Result<SessionSnapshot, OrchestratorError> {
        let token = self.shared.current_token();
        let (session_id, resume_mode) = {
            let mut state = self.shared.state.lock();
            let session = state.as_mut().ok_or(SequencingViolation::NoActiveSession)?;
            if session.overall_status == OverallStatus::Cancelled {
                return Err(SequencingViolation::Cancelled.into());
            }
            let status = session
                .section(key)
                .map(|s| s.status)
                .ok_or_else(|| SequencingViolation::UnknownSection(key.to_string()))?;
            if status != SectionStatus::Failed {
                return Err(SequencingViolation::NotFailed(key.to_string()).into());
            }
            if let Some(first) = session.first_failed() {
                if first.key != key {
                    return Err(SequencingViolation::OutOfOrderRetry {
                        requested: key.to_string(),
                        first_failed: first.key.clone(),
                    }
                    .into());
                }
            }

            session.reset_section(key);
            session.overall_status = OverallStatus::InProgress;
            session.transport_error = None;
            let resume_mode = if session.failed_over {
                TransportMode::Polling
            } else {
                TransportMode::Streaming
            };
            if matches!(self.shared.driver, Driver::ServerManaged(_)) {
                session.transport_mode = resume_mode;
            }
            (session.id.clone(), resume_mode)
        };
        info!(session_id = %session_id, section = %key, "retrying section");

        match &self.shared.driver {
            Driver::SelfDriven(executor) => local::run(&self.shared, executor, &token).await,
            Driver::ServerManaged(backend) => {
                server::retry(&self.shared, backend, &session_id, key, resume_mode, &token).await?
            }
        }
        self.snapshot()
            .ok_or_else(|| SequencingViolation::NoActiveSession.into())
    }

    /// Freeze the session immediately. Transports stop, a backend cancel notice
    /// is sent without waiting, and any result arriving later is dropped.
    pub fn cancel(&self) -> Result<(), SequencingViolation> {
        let notify = {
            let mut state = self.shared.state.lock();
            let session = state.as_mut().ok_or(SequencingViolation::NoActiveSession)?;
            match session.overall_status {
                OverallStatus::Idle => return Err(SequencingViolation::NoActiveSession),
                OverallStatus::Cancelled => return Err(SequencingViolation::Cancelled),
                OverallStatus::Completed => return Err(SequencingViolation::AlreadyCompleted),
                OverallStatus::Starting | OverallStatus::InProgress | OverallStatus::Failed => {}
            }
            // A session still starting has no server-side id yet.
            let remote = session.overall_status != OverallStatus::Starting;
            session.overall_status = OverallStatus::Cancelled;
            info!(
                session_id = %session.id,
                completed = session.completed_count(),
                "generation cancelled"
            );
            remote.then(|| session.id.clone())
        };
        self.shared.current_token().cancel();

        if let (Driver::ServerManaged(backend), Some(session_id)) = (&self.shared.driver, notify) {
            server::notify_cancel(backend, session_id);
        }
        Ok(())
    }

    /// Apply one externally delivered progress event to the active session.
    ///
    /// Only server-managed sessions take events; a self-driven session owns its
    /// section transitions through the local loop.
    pub async fn handle_event(&self, event: ProgressEvent) -> Result<(), OrchestratorError> {
        let Driver::ServerManaged(backend) = &self.shared.driver else {
            return Err(SequencingViolation::EventsNotAccepted.into());
        };
        let session_id = self
            .shared
            .state
            .lock()
            .as_ref()
            .map(|s| s.id.clone())
            .ok_or(SequencingViolation::NoActiveSession)?;
        let token = self.shared.current_token();
        self.shared
            .apply_event(backend, &session_id, event, &token)
            .await;
        Ok(())
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.shared.state.lock().as_ref().map(GenerationSession::snapshot)
    }

    pub fn status(&self) -> OverallStatus {
        self.shared
            .state
            .lock()
            .as_ref()
            .map(|s| s.overall_status)
            .unwrap_or(OverallStatus::Idle)
    }

    /// Accumulated results of the active session, in catalog order.
    pub fn results(&self) -> ResultMap {
        self.shared
            .state
            .lock()
            .as_ref()
            .map(GenerationSession::results)
            .unwrap_or_default()
    }

    /// Current completion percentage. Never lower than a value returned before
    /// for the same session.
    pub fn overall_percent(&self) -> f64 {
        let mut state = self.shared.state.lock();
        let Some(session) = state.as_mut() else {
            return 0.0;
        };
        let percent = progress::overall_percent(session, Utc::now(), &self.shared.settings.estimator);
        session.percent_floor = session.percent_floor.max(percent);
        percent
    }

    pub fn estimated_time_remaining(&self) -> Option<TimeRemaining> {
        let state = self.shared.state.lock();
        let session = state.as_ref()?;
        if session.overall_status != OverallStatus::InProgress {
            return None;
        }
        Some(progress::estimated_time_remaining(
            session,
            Utc::now(),
            &self.shared.settings.estimator,
        ))
    }
}

impl Shared {
    /// Record the outcome of a locally executed section. Returns true when the
    /// loop should move on to the next section.
    fn apply_section_outcome(
        &self,
        session_id: &str,
        key: &str,
        outcome: Result<crate::session::SectionContent, SectionFailure>,
    ) -> bool {
        let (effects, proceed) = {
            let mut state = self.state.lock();
            let Some(session) = state.as_mut().filter(|s| s.id == session_id) else {
                debug!(session_id = %session_id, section = %key, "discarding result for replaced session");
                return false;
            };
            if session.overall_status != OverallStatus::InProgress {
                debug!(
                    session_id = %session_id,
                    section = %key,
                    status = session.overall_status.as_str(),
                    "discarding late section result"
                );
                return false;
            }

            let now = Utc::now();
            let mut effects = Vec::new();
            match outcome {
                Ok(content) => {
                    if !session.mark_completed(key, content.clone(), now) {
                        return false;
                    }
                    info!(
                        session_id = %session_id,
                        section = %key,
                        completed = session.completed_count(),
                        total = session.total(),
                        "section completed"
                    );
                    effects.push(hooks::Effect::SectionCompleted {
                        session_id: session_id.to_string(),
                        key: key.to_string(),
                        result: content,
                        accumulated: session.results(),
                    });
                    if session.all_completed() {
                        session.overall_status = OverallStatus::Completed;
                        session.percent_floor = 100.0;
                        info!(session_id = %session_id, "generation completed");
                        effects.push(hooks::Effect::Completed(session.results()));
                    }
                }
                Err(failure) => {
                    session.mark_failed(key, failure.message(), now);
                    session.overall_status = OverallStatus::Failed;
                    warn!(
                        session_id = %session_id,
                        section = %key,
                        error = %failure.error,
                        "section failed, generation halted"
                    );
                    effects.push(hooks::Effect::Failed(failure));
                }
            }
            let proceed = session.overall_status == OverallStatus::InProgress;
            (effects, proceed)
        };
        self.dispatch(effects);
        proceed
    }
}
