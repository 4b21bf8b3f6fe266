//! Progress event schema shared by the stream and poll transports.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};

use crate::session::{GenerationSession, OverallStatus, ResultMap, SectionStatus};

/// One progress signal. Consumed once by the orchestrator, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(default, alias = "currentSection", alias = "current_section")]
    pub current_section_key: Option<String>,

    #[serde(default, alias = "completedSections", alias = "completed_sections")]
    pub completed_keys: BTreeSet<String>,

    /// Authoritative when present.
    #[serde(default, alias = "progress")]
    pub server_progress_percent: Option<f64>,

    #[serde(
        default = "default_status",
        alias = "status",
        deserialize_with = "deserialize_status"
    )]
    pub overall_status: OverallStatus,

    #[serde(default, alias = "error", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Finished section payloads delivered inline; missing ones are fetched by key.
    #[serde(default, skip_serializing_if = "ResultMap::is_empty")]
    pub results: ResultMap,
}

impl ProgressEvent {
    pub fn in_progress(current: Option<&str>, completed: &[&str]) -> Self {
        Self {
            current_section_key: current.map(String::from),
            completed_keys: completed.iter().map(|k| k.to_string()).collect(),
            server_progress_percent: None,
            overall_status: OverallStatus::InProgress,
            error_message: None,
            results: ResultMap::new(),
        }
    }

    pub fn with_percent(mut self, percent: f64) -> Self {
        self.server_progress_percent = Some(percent);
        self
    }

    pub fn with_status(mut self, status: OverallStatus) -> Self {
        self.overall_status = status;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// True when this event reports less progress than the session already
    /// knows about: a section the session holds as completed is missing, or
    /// the authoritative percentage went backwards.
    pub fn lags(&self, session: &GenerationSession) -> bool {
        let missing_completion = session
            .sections
            .values()
            .filter(|s| s.status == SectionStatus::Completed)
            .any(|s| !self.completed_keys.contains(&s.key));
        if missing_completion {
            return true;
        }
        match (self.server_progress_percent, session.server_percent) {
            (Some(incoming), Some(known)) => incoming < known,
            _ => false,
        }
    }
}

fn default_status() -> OverallStatus {
    OverallStatus::InProgress
}

/// Map backend status strings onto the lifecycle enum.
pub fn parse_wire_status(raw: &str) -> Option<OverallStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "idle" | "pending" | "queued" => Some(OverallStatus::Idle),
        "starting" => Some(OverallStatus::Starting),
        "in_progress" | "in-progress" | "processing" | "running" | "generating" => {
            Some(OverallStatus::InProgress)
        }
        "completed" | "complete" | "done" => Some(OverallStatus::Completed),
        "failed" | "error" => Some(OverallStatus::Failed),
        "cancelled" | "canceled" => Some(OverallStatus::Cancelled),
        _ => None,
    }
}

fn deserialize_status<'de, D>(deserializer: D) -> Result<OverallStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_wire_status(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unknown generation status '{raw}'")))
}
