//! Section executor: runs generation for exactly one section with a bounded timeout.
//! Never touches session state; the orchestrator applies the outcome.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::catalog::SectionSpec;
use crate::error::SectionGenerationError;
use crate::session::{ResultMap, SectionContent};
use crate::transport::{SectionGenerator, SectionRequest};

/// Per-section time budget: an explicit spec timeout, or base plus a share per
/// expected answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub base: Duration,
    pub per_unit: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(20),
            per_unit: Duration::from_secs(5),
        }
    }
}

impl TimeoutPolicy {
    pub fn for_section(&self, spec: &SectionSpec) -> Duration {
        spec.timeout
            .unwrap_or_else(|| self.base + self.per_unit * spec.expected_unit_count)
    }
}

/// Typed failure for one section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionFailure {
    pub key: String,
    pub error: SectionGenerationError,
}

impl SectionFailure {
    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

#[derive(Clone)]
pub struct SectionExecutor {
    generator: Arc<dyn SectionGenerator>,
    timeouts: TimeoutPolicy,
}

impl SectionExecutor {
    pub fn new(generator: Arc<dyn SectionGenerator>) -> Self {
        Self {
            generator,
            timeouts: TimeoutPolicy::default(),
        }
    }

    pub fn with_timeouts(generator: Arc<dyn SectionGenerator>, timeouts: TimeoutPolicy) -> Self {
        Self {
            generator,
            timeouts,
        }
    }

    pub fn timeouts(&self) -> TimeoutPolicy {
        self.timeouts
    }

    /// Generate `spec` given every earlier section's result.
    pub async fn execute(
        &self,
        spec: &SectionSpec,
        context: &Value,
        accumulated: &ResultMap,
    ) -> Result<SectionContent, SectionFailure> {
        let request = SectionRequest {
            section_key: spec.key.clone(),
            display_name: spec.display_name.clone(),
            expected_unit_count: spec.expected_unit_count,
            context: context.clone(),
            previous_sections: accumulated.clone(),
        };
        let budget = self.timeouts.for_section(spec);
        debug!(
            section = %spec.key,
            previous = accumulated.len(),
            timeout_secs = budget.as_secs(),
            "generating section"
        );

        let outcome = match tokio::time::timeout(budget, self.generator.generate(&request)).await {
            Ok(result) => result,
            Err(_) => Err(SectionGenerationError::Timeout {
                key: spec.key.clone(),
                seconds: budget.as_secs(),
            }),
        };

        outcome.map_err(|error| {
            warn!(section = %spec.key, error = %error, "section generation failed");
            SectionFailure {
                key: spec.key.clone(),
                error,
            }
        })
    }
}
