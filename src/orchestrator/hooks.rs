//! Lifecycle callbacks and their dispatch.
//!
//! Effects are collected while the session lock is held and dispatched after it
//! is released, so a hook may call back into the orchestrator.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::PersistError;
use crate::executor::SectionFailure;
use crate::orchestrator::Shared;
use crate::session::{ResultMap, SectionContent};

/// Arguments of the section-completed callback.
#[derive(Debug, Clone, Copy)]
pub struct SectionCompleted<'a> {
    pub key: &'a str,
    pub result: &'a SectionContent,
    /// Every completed section so far, including this one.
    pub accumulated: &'a ResultMap,
}

pub type SectionCompletedHook =
    Arc<dyn Fn(&SectionCompleted<'_>) -> Result<(), PersistError> + Send + Sync>;
pub type CompletedHook = Arc<dyn Fn(ResultMap) + Send + Sync>;
pub type FailedHook = Arc<dyn Fn(&SectionFailure) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) section_completed: Vec<SectionCompletedHook>,
    pub(crate) completed: Vec<CompletedHook>,
    pub(crate) failed: Vec<FailedHook>,
}

/// A state transition that callers must hear about.
#[derive(Debug, Clone)]
pub(crate) enum Effect {
    SectionCompleted {
        session_id: String,
        key: String,
        result: SectionContent,
        accumulated: ResultMap,
    },
    Completed(ResultMap),
    Failed(SectionFailure),
}

impl Shared {
    /// Run hooks for `effects` in order. Must not be called with the state lock held.
    pub(crate) fn dispatch(&self, effects: Vec<Effect>) {
        if effects.is_empty() {
            return;
        }
        let (section_hooks, completed_hooks, failed_hooks) = {
            let hooks = self.hooks.lock();
            (
                hooks.section_completed.clone(),
                hooks.completed.clone(),
                hooks.failed.clone(),
            )
        };

        for effect in effects {
            match effect {
                Effect::SectionCompleted {
                    session_id,
                    key,
                    result,
                    accumulated,
                } => {
                    let args = SectionCompleted {
                        key: &key,
                        result: &result,
                        accumulated: &accumulated,
                    };
                    for hook in &section_hooks {
                        if let Err(err) = hook(&args) {
                            warn!(
                                session_id = %session_id,
                                section = %key,
                                error = %err,
                                "section-completed hook failed"
                            );
                            self.record_save_error(&session_id, err.to_string());
                        }
                    }
                }
                Effect::Completed(results) => {
                    debug!(sections = results.len(), hooks = completed_hooks.len(), "dispatching completion");
                    for hook in &completed_hooks {
                        hook(results.clone());
                    }
                }
                Effect::Failed(failure) => {
                    for hook in &failed_hooks {
                        hook(&failure);
                    }
                }
            }
        }
    }

    fn record_save_error(&self, session_id: &str, message: String) {
        let mut guard = self.state.lock();
        if let Some(session) = guard.as_mut().filter(|s| s.id == session_id) {
            session.save_error = Some(message);
        }
    }
}
