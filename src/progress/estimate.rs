//! Progress estimation from sparse signals.
//!
//! Pure functions over a session snapshot and a wall-clock instant. The backend
//! does not always report a percentage, so elapsed time stands in for it.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::SectionSpec;
use crate::session::{GenerationSession, OverallStatus, SectionStatus};

/// Partial credit for the running section never reaches a full unit.
pub const PARTIAL_CREDIT_CAP: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatorSettings {
    /// Assumed generation time per expected answer.
    pub seconds_per_unit: f64,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            seconds_per_unit: 12.0,
        }
    }
}

impl EstimatorSettings {
    pub fn assumed_duration(&self, spec: &SectionSpec) -> Duration {
        let secs = self.seconds_per_unit.max(0.0) * f64::from(spec.expected_unit_count);
        Duration::from_secs_f64(secs)
    }
}

/// Overall completion percentage in `0..=100`.
pub fn overall_percent(session: &GenerationSession, now: DateTime<Utc>, settings: &EstimatorSettings) -> f64 {
    let raw = if session.overall_status == OverallStatus::Completed {
        100.0
    } else if let Some(server) = session.server_percent {
        server
    } else {
        local_percent(session, now, settings)
    };
    raw.max(session.percent_floor).clamp(0.0, 100.0)
}

fn local_percent(session: &GenerationSession, now: DateTime<Utc>, settings: &EstimatorSettings) -> f64 {
    let total = session.total();
    if total == 0 {
        return 0.0;
    }
    let unit_share = 100.0 / total as f64;
    let mut percent = session.completed_count() as f64 * unit_share;

    if let Some(running) = session.in_progress() {
        let assumed = session
            .catalog
            .get(&running.key)
            .map(|spec| settings.assumed_duration(spec))
            .unwrap_or_default();
        let elapsed = running
            .started_at
            .map(|start| seconds_between(start, now))
            .unwrap_or(0.0);
        let fraction = if assumed.is_zero() {
            PARTIAL_CREDIT_CAP
        } else {
            (elapsed / assumed.as_secs_f64()).min(PARTIAL_CREDIT_CAP)
        };
        percent += fraction.max(0.0) * unit_share;
    }
    percent
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeRemaining {
    LessThanAMinute,
    Minutes(u64),
}

impl fmt::Display for TimeRemaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeRemaining::LessThanAMinute => write!(f, "less than 1 minute"),
            TimeRemaining::Minutes(1) => write!(f, "about 1 minute"),
            TimeRemaining::Minutes(n) => write!(f, "about {n} minutes"),
        }
    }
}

impl TimeRemaining {
    fn from_seconds(secs: f64) -> Self {
        if !secs.is_finite() || secs < 60.0 {
            return TimeRemaining::LessThanAMinute;
        }
        TimeRemaining::Minutes((secs / 60.0).ceil() as u64)
    }
}

/// Projected time until every section is completed.
pub fn estimated_time_remaining(
    session: &GenerationSession,
    now: DateTime<Utc>,
    settings: &EstimatorSettings,
) -> TimeRemaining {
    let completed = session.completed_count();
    let remaining: Vec<&SectionSpec> = session
        .sections
        .values()
        .filter(|s| s.status != SectionStatus::Completed)
        .filter_map(|s| session.catalog.get(&s.key))
        .collect();

    if remaining.is_empty() {
        return TimeRemaining::LessThanAMinute;
    }

    let secs = if completed == 0 {
        remaining
            .iter()
            .map(|spec| settings.assumed_duration(spec).as_secs_f64())
            .sum()
    } else {
        let elapsed = session
            .started_at
            .map(|start| seconds_between(start, now))
            .unwrap_or(0.0);
        elapsed / completed as f64 * remaining.len() as f64
    };
    TimeRemaining::from_seconds(secs)
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}
