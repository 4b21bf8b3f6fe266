//! Generation session state: per-section status plus overall lifecycle.
//!
//! The orchestrator is the only writer. Every transition goes through the
//! `mark_*` methods here so ordering and single-flight hold no matter which
//! driver (self-driven or server-managed) is feeding results in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::catalog::{SectionCatalog, SectionSpec};
use crate::error::SequencingViolation;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generated answers for one section, keyed by question in output order.
pub type SectionContent = IndexMap<String, String>;

/// Accumulated results keyed by section, in catalog order.
pub type ResultMap = IndexMap<String, SectionContent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Idle,
    Starting,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl OverallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::Idle => "idle",
            OverallStatus::Starting => "starting",
            OverallStatus::InProgress => "in_progress",
            OverallStatus::Completed => "completed",
            OverallStatus::Failed => "failed",
            OverallStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that a new `start` may replace.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            OverallStatus::Idle
                | OverallStatus::Completed
                | OverallStatus::Failed
                | OverallStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Streaming,
    Polling,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionState {
    pub key: String,
    pub status: SectionStatus,
    pub result: Option<SectionContent>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SectionState {
    fn pending(key: &str) -> Self {
        Self {
            key: key.to_string(),
            status: SectionStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationSession {
    pub id: String,
    pub catalog: Arc<SectionCatalog>,
    pub sections: IndexMap<String, SectionState>,
    pub overall_status: OverallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub transport_mode: TransportMode,
    /// Last authoritative percentage reported by the backend.
    pub server_percent: Option<f64>,
    /// Highest percentage ever reported; estimates never fall below it.
    pub percent_floor: f64,
    pub failed_over: bool,
    /// Set when the fallback transport also failed.
    pub transport_error: Option<String>,
    pub save_error: Option<String>,
}

impl GenerationSession {
    pub fn new(id: impl Into<String>, catalog: Arc<SectionCatalog>) -> Self {
        let sections = catalog
            .iter()
            .map(|spec| (spec.key.clone(), SectionState::pending(&spec.key)))
            .collect();
        Self {
            id: id.into(),
            catalog,
            sections,
            overall_status: OverallStatus::Idle,
            started_at: None,
            transport_mode: TransportMode::None,
            server_percent: None,
            percent_floor: 0.0,
            failed_over: false,
            transport_error: None,
            save_error: None,
        }
    }

    pub fn section(&self, key: &str) -> Option<&SectionState> {
        self.sections.get(key)
    }

    pub fn total(&self) -> usize {
        self.sections.len()
    }

    pub fn completed_count(&self) -> usize {
        self.count(SectionStatus::Completed)
    }

    pub fn count(&self, status: SectionStatus) -> usize {
        self.sections.values().filter(|s| s.status == status).count()
    }

    pub fn in_progress(&self) -> Option<&SectionState> {
        self.sections
            .values()
            .find(|s| s.status == SectionStatus::InProgress)
    }

    pub fn first_failed(&self) -> Option<&SectionState> {
        self.sections
            .values()
            .find(|s| s.status == SectionStatus::Failed)
    }

    pub fn all_completed(&self) -> bool {
        self.sections
            .values()
            .all(|s| s.status == SectionStatus::Completed)
    }

    /// The next section that may enter `in_progress`, if any.
    pub fn next_runnable(&self) -> Option<&SectionSpec> {
        if self.in_progress().is_some() {
            return None;
        }
        let next = self
            .sections
            .values()
            .find(|s| s.status != SectionStatus::Completed)?;
        if next.status == SectionStatus::Failed {
            return None;
        }
        self.catalog.get(&next.key)
    }

    pub fn mark_started(&mut self, key: &str, now: DateTime<Utc>) -> Result<(), SequencingViolation> {
        let position = self
            .catalog
            .position(key)
            .ok_or_else(|| SequencingViolation::UnknownSection(key.to_string()))?;
        if let Some(running) = self.in_progress() {
            if running.key != key {
                return Err(SequencingViolation::SingleFlight {
                    running: running.key.clone(),
                });
            }
        }
        if let Some(blocking) = self
            .sections
            .values()
            .take(position)
            .find(|s| s.status != SectionStatus::Completed)
        {
            return Err(SequencingViolation::PredecessorIncomplete {
                key: key.to_string(),
                blocking: blocking.key.clone(),
            });
        }
        if let Some(state) = self.sections.get_mut(key) {
            state.status = SectionStatus::InProgress;
            state.error = None;
            state.result = None;
            state.started_at = Some(now);
            state.finished_at = None;
        }
        Ok(())
    }

    /// Record a completed section. Returns false when the key is unknown or
    /// already completed.
    pub fn mark_completed(&mut self, key: &str, content: SectionContent, now: DateTime<Utc>) -> bool {
        let Some(state) = self.sections.get_mut(key) else {
            return false;
        };
        if state.status == SectionStatus::Completed {
            return false;
        }
        state.status = SectionStatus::Completed;
        state.started_at.get_or_insert(now);
        state.result = Some(content);
        state.error = None;
        state.finished_at = Some(now);
        true
    }

    pub fn mark_failed(&mut self, key: &str, message: impl Into<String>, now: DateTime<Utc>) -> bool {
        let Some(state) = self.sections.get_mut(key) else {
            return false;
        };
        if state.status == SectionStatus::Completed {
            return false;
        }
        state.status = SectionStatus::Failed;
        state.result = None;
        state.error = Some(message.into());
        state.finished_at = Some(now);
        true
    }

    /// Put a failed section back to pending. Completed sections are left alone.
    pub fn reset_section(&mut self, key: &str) -> bool {
        let Some(state) = self.sections.get_mut(key) else {
            return false;
        };
        if state.status == SectionStatus::Completed {
            return false;
        }
        *state = SectionState::pending(key);
        true
    }

    /// Completed results in catalog order.
    pub fn results(&self) -> ResultMap {
        self.sections
            .values()
            .filter_map(|s| s.result.clone().map(|r| (s.key.clone(), r)))
            .collect()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            overall_status: self.overall_status,
            transport_mode: self.transport_mode,
            started_at: self.started_at,
            sections: self.sections.values().cloned().collect(),
            transport_error: self.transport_error.clone(),
            save_error: self.save_error.clone(),
        }
    }
}

/// Read-only view for presentation adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub overall_status: OverallStatus,
    pub transport_mode: TransportMode,
    pub started_at: Option<DateTime<Utc>>,
    pub sections: Vec<SectionState>,
    pub transport_error: Option<String>,
    pub save_error: Option<String>,
}

impl SessionSnapshot {
    pub fn section(&self, key: &str) -> Option<&SectionState> {
        self.sections.iter().find(|s| s.key == key)
    }

    pub fn status_of(&self, key: &str) -> Option<SectionStatus> {
        self.section(key).map(|s| s.status)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn new_session_id() -> String {
    let ts = now_millis();
    let pid = std::process::id();
    let seq = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("gen-{ts}-{pid}-{seq}")
}
