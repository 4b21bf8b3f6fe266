//! Section catalog: the ordered generation plan.
//!
//! Each section implicitly depends on every section before it. Ordinals are the
//! single source of truth for "how many units, in what order".

use crate::error::CatalogError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// One named unit of work in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionSpec {
    pub key: String,
    pub display_name: String,
    /// Expected number of answers; weights duration heuristics and timeouts.
    pub expected_unit_count: u32,
    pub ordinal: usize,
    /// Explicit per-section timeout; falls back to the executor policy.
    #[serde(default, with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl SectionSpec {
    pub fn new(
        key: impl Into<String>,
        display_name: impl Into<String>,
        expected_unit_count: u32,
        ordinal: usize,
    ) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
            expected_unit_count,
            ordinal,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Validated, immutable list of sections in dependency order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionCatalog {
    sections: Vec<SectionSpec>,
}

impl SectionCatalog {
    pub fn new(sections: Vec<SectionSpec>) -> Result<Self, CatalogError> {
        if sections.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut seen = HashSet::new();
        for (expected, spec) in sections.iter().enumerate() {
            if spec.key.trim().is_empty() {
                return Err(CatalogError::EmptyKey(spec.ordinal));
            }
            if spec.ordinal != expected {
                return Err(CatalogError::NonContiguousOrdinal {
                    key: spec.key.clone(),
                    expected,
                    found: spec.ordinal,
                });
            }
            if spec.expected_unit_count == 0 {
                return Err(CatalogError::ZeroUnits(spec.key.clone()));
            }
            if !seen.insert(spec.key.as_str()) {
                return Err(CatalogError::DuplicateKey(spec.key.clone()));
            }
        }
        Ok(Self { sections })
    }

    /// Build a catalog from `(key, display_name, expected_unit_count)` triples,
    /// assigning ordinals in list order.
    pub fn from_entries(entries: &[(&str, &str, u32)]) -> Result<Self, CatalogError> {
        let sections = entries
            .iter()
            .enumerate()
            .map(|(ordinal, (key, name, units))| SectionSpec::new(*key, *name, *units, ordinal))
            .collect();
        Self::new(sections)
    }

    /// Default plan for a grant application narrative.
    pub fn grant_application() -> Self {
        let sections = vec![
            SectionSpec::new("project_summary", "Project Summary", 3, 0),
            SectionSpec::new("relevance", "Relevance and Objectives", 4, 1),
            SectionSpec::new("methodology", "Methodology and Work Plan", 5, 2),
            SectionSpec::new("impact", "Expected Impact", 4, 3),
            SectionSpec::new("partnership", "Partnership and Management", 3, 4),
            SectionSpec::new("budget", "Budget Justification", 3, 5),
        ];
        Self { sections }
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SectionSpec> {
        self.sections.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.key.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&SectionSpec> {
        self.sections.iter().find(|s| s.key == key)
    }

    pub fn at(&self, ordinal: usize) -> Option<&SectionSpec> {
        self.sections.get(ordinal)
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.key == key)
    }

    /// Sections that must be completed before `key` may run.
    pub fn predecessors(&self, key: &str) -> &[SectionSpec] {
        match self.position(key) {
            Some(idx) => &self.sections[..idx],
            None => &[],
        }
    }
}

impl<'de> Deserialize<'de> for SectionCatalog {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            sections: Vec<SectionSpec>,
        }
        let raw = Raw::deserialize(deserializer)?;
        SectionCatalog::new(raw.sections).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
