//! Self-driven loop: one executor call per section, strictly in catalog order.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SectionGenerationError;
use crate::executor::{SectionExecutor, SectionFailure};
use crate::orchestrator::Shared;
use crate::session::OverallStatus;

/// Run sections until the session completes, fails or is cancelled.
///
/// Cancellation does not abort the in-flight call; it is left to finish on its
/// own and its result is discarded.
pub(super) async fn run(shared: &Arc<Shared>, executor: &SectionExecutor, token: &CancellationToken) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            let Some(session) = state.as_mut() else {
                return;
            };
            if session.overall_status != OverallStatus::InProgress || token.is_cancelled() {
                return;
            }
            let Some(spec) = session.next_runnable().cloned() else {
                return;
            };
            if let Err(violation) = session.mark_started(&spec.key, Utc::now()) {
                warn!(session_id = %session.id, section = %spec.key, error = %violation, "cannot start section");
                return;
            }
            info!(
                session_id = %session.id,
                section = %spec.key,
                ordinal = spec.ordinal,
                "section started"
            );
            (session.id.clone(), spec, session.results())
        };
        let (session_id, spec, accumulated) = job;
        let context = shared.context.lock().clone();

        let call_executor = executor.clone();
        let call_spec = spec.clone();
        let mut call = tokio::spawn(async move {
            call_executor
                .execute(&call_spec, &context, &accumulated)
                .await
        });

        let joined = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            joined = &mut call => Some(joined),
        };
        let Some(joined) = joined else {
            debug!(session_id = %session_id, section = %spec.key, "leaving in-flight section to finish detached");
            let late = Arc::clone(shared);
            tokio::spawn(async move {
                if let Ok(outcome) = call.await {
                    late.apply_section_outcome(&session_id, &spec.key, outcome);
                }
            });
            return;
        };

        let outcome = joined.map_err(|join_error| SectionFailure {
            key: spec.key.clone(),
            error: SectionGenerationError::Remote(format!("section task aborted: {join_error}")),
        });
        if !shared.apply_section_outcome(&session_id, &spec.key, outcome.and_then(|r| r)) {
            return;
        }
    }
}
