//! Auto-save: persistence of accumulated results after each completed section.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PersistError;
use crate::session::{ResultMap, SectionContent};

/// External persistence collaborator. Failures are logged by the caller and
/// never stop generation.
pub trait AutoSave: Send + Sync {
    fn persist(
        &self,
        section_key: &str,
        section_result: &SectionContent,
        full_result: &ResultMap,
    ) -> Result<(), PersistError>;
}

/// On-disk document written by [`JsonFileAutoSave`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedResults {
    pub last_section: String,
    pub saved_at: DateTime<Utc>,
    pub sections: ResultMap,
}

/// Writes the accumulated map as pretty JSON, replacing the file atomically.
pub struct JsonFileAutoSave {
    path: PathBuf,
    // Hooks may fire from more than one task; writes must not interleave.
    write_lock: Mutex<()>,
}

impl JsonFileAutoSave {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(path: &Path) -> Result<SavedResults, PersistError> {
        let raw = fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

impl AutoSave for JsonFileAutoSave {
    fn persist(
        &self,
        section_key: &str,
        _section_result: &SectionContent,
        full_result: &ResultMap,
    ) -> Result<(), PersistError> {
        let document = SavedResults {
            last_section: section_key.to_string(),
            saved_at: Utc::now(),
            sections: full_result.clone(),
        };
        let serialized = serde_json::to_vec_pretty(&document)?;

        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &serialized)?;
        fs::rename(&temp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            PersistError::Io(e)
        })?;
        debug!(
            path = %self.path.display(),
            section = %section_key,
            sections = full_result.len(),
            "results auto-saved"
        );
        Ok(())
    }
}
