//! Configuration System
//!
//! Layered configuration built with the `config` crate. Sources, lowest to
//! highest precedence: merge-policy defaults, the global file
//! (`$XDG_CONFIG_HOME/grantflow/config.toml`), workspace `config/config.toml`,
//! workspace `config/{GRANTFLOW_ENV}.toml`, then `GRANTFLOW__*` environment
//! variables (`GRANTFLOW__BACKEND__BASE_URL=...`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::catalog::SectionCatalog;
use crate::error::ConfigError;
use crate::executor::TimeoutPolicy;
use crate::logging::LoggingConfig;
use crate::progress::EstimatorSettings;

mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrantflowConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    /// Replaces the built-in grant application plan when present.
    #[serde(default)]
    pub catalog: Option<SectionCatalog>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// The backend owns the session and reports progress.
    #[default]
    ServerManaged,
    /// Sections are requested one by one from this process.
    SelfDriven,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub mode: BackendMode,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            mode: BackendMode::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.trim().is_empty() {
            return Err("base_url cannot be empty".to_string());
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(format!("base_url must be an http(s) URL, got '{}'", self.base_url));
        }
        if self.connect_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err("timeouts must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Stream silence longer than this triggers failover to polling.
    /// Defaults to one poll interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_stall_timeout_ms: Option<u64>,

    #[serde(default = "default_section_base_timeout_secs")]
    pub section_base_timeout_secs: u64,

    #[serde(default = "default_section_per_unit_timeout_secs")]
    pub section_per_unit_timeout_secs: u64,

    /// Assumed generation time per expected answer, for estimates.
    #[serde(default = "default_seconds_per_unit")]
    pub seconds_per_unit: f64,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_section_base_timeout_secs() -> u64 {
    20
}

fn default_section_per_unit_timeout_secs() -> u64 {
    5
}

fn default_seconds_per_unit() -> f64 {
    12.0
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stream_stall_timeout_ms: None,
            section_base_timeout_secs: default_section_base_timeout_secs(),
            section_per_unit_timeout_secs: default_section_per_unit_timeout_secs(),
            seconds_per_unit: default_seconds_per_unit(),
        }
    }
}

impl GenerationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        self.stream_stall_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.poll_interval())
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            base: Duration::from_secs(self.section_base_timeout_secs),
            per_unit: Duration::from_secs(self.section_per_unit_timeout_secs),
        }
    }

    pub fn estimator(&self) -> EstimatorSettings {
        EstimatorSettings {
            seconds_per_unit: self.seconds_per_unit,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than zero".to_string());
        }
        if self.stream_stall_timeout_ms == Some(0) {
            return Err("stream_stall_timeout_ms must be greater than zero".to_string());
        }
        if self.section_base_timeout_secs == 0 && self.section_per_unit_timeout_secs == 0 {
            return Err("section timeout cannot be zero".to_string());
        }
        if !self.seconds_per_unit.is_finite() || self.seconds_per_unit <= 0.0 {
            return Err(format!(
                "seconds_per_unit must be a positive number, got {}",
                self.seconds_per_unit
            ));
        }
        Ok(())
    }
}

impl GrantflowConfig {
    /// Collect every problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if let Err(e) = self.backend.validate() {
            errors.push(format!("backend: {}", e));
        }
        if let Err(e) = self.generation.validate() {
            errors.push(format!("generation: {}", e));
        }
        if let Err(e) = self.logging.validate() {
            errors.push(format!("logging: {}", e));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The configured catalog, or the built-in grant application plan.
    pub fn catalog(&self) -> SectionCatalog {
        self.catalog
            .clone()
            .unwrap_or_else(SectionCatalog::grant_application)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the layered configuration for `workspace_root` and validate it.
    pub fn load(workspace_root: &Path) -> Result<GrantflowConfig, ConfigError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = builder.add_source(Environment::with_prefix("GRANTFLOW").separator("__"));
        Self::finish(builder.build()?)
    }

    /// Load a single file on top of the defaults, skipping the other layers.
    pub fn load_from_file(path: &Path) -> Result<GrantflowConfig, ConfigError> {
        let builder = merge::merge_policy::builder_with_defaults()?
            .add_source(File::from(path.to_path_buf()).required(true));
        Self::finish(builder.build()?)
    }

    pub fn xdg_config_path() -> Option<PathBuf> {
        global_config_path()
    }

    fn finish(config: Config) -> Result<GrantflowConfig, ConfigError> {
        let loaded: GrantflowConfig = config.try_deserialize()?;
        loaded.validate().map_err(ConfigError::Invalid)?;
        Ok(loaded)
    }
}
