//! CLI route: run context and command dispatch. Orchestration lives in the
//! orchestrator; handlers only wire it up and format results.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::autosave::JsonFileAutoSave;
use crate::cli::output::{
    format_catalog_json, format_catalog_text, format_progress_line, format_section_completed,
    format_section_failed, format_session_json, format_session_text,
};
use crate::cli::parse::{Commands, ModeArg};
use crate::config::{ConfigLoader, GrantflowConfig};
use crate::error::CliError;
use crate::orchestrator::GenerationOrchestrator;
use crate::session::OverallStatus;

const PROGRESS_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Runtime context for CLI execution. Built from workspace path and optional
/// config path using ConfigLoader only.
pub struct RunContext {
    workspace_root: PathBuf,
    config: GrantflowConfig,
}

impl RunContext {
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, CliError> {
        let config = match config_path {
            Some(ref path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(&workspace_root)?,
        };
        Ok(Self {
            workspace_root,
            config,
        })
    }

    pub fn from_config(workspace_root: PathBuf, config: GrantflowConfig) -> Self {
        Self {
            workspace_root,
            config,
        }
    }

    pub fn config(&self) -> &GrantflowConfig {
        &self.config
    }

    pub async fn execute(&self, command: &Commands) -> Result<String, CliError> {
        match command {
            Commands::Generate {
                context,
                mode,
                out,
                retries,
                format,
            } => {
                self.generate(context, *mode, out.as_deref(), *retries, format)
                    .await
            }
            Commands::Catalog { format } => {
                let catalog = self.config.catalog();
                if format == "json" {
                    format_catalog_json(&catalog)
                } else {
                    Ok(format_catalog_text(&catalog))
                }
            }
            Commands::Config => {
                let mut shown = self.config.clone();
                if shown.backend.api_key.is_some() {
                    shown.backend.api_key = Some("********".to_string());
                }
                toml::to_string_pretty(&shown).map_err(|e| CliError::Render(e.to_string()))
            }
        }
    }

    async fn generate(
        &self,
        context_path: &Path,
        mode: Option<ModeArg>,
        out: Option<&Path>,
        retries: u32,
        format: &str,
    ) -> Result<String, CliError> {
        let context = read_context(&self.resolve(context_path))?;
        let catalog = self.config.catalog();

        let mut config = self.config.clone();
        if let Some(mode) = mode {
            config.backend.mode = mode.into();
        }

        let mut orchestrator = GenerationOrchestrator::from_config(&config)?;
        if let Some(out) = out {
            let path = self.resolve(out);
            info!(path = %path.display(), "auto-saving results");
            orchestrator = orchestrator.with_auto_save(Arc::new(JsonFileAutoSave::new(path)));
        }

        let total = catalog.len();
        let names = catalog.clone();
        orchestrator.on_section_completed(move |done| {
            let name = names.get(done.key).map(|s| s.display_name.as_str()).unwrap_or(done.key);
            println!("{}", format_section_completed(done.accumulated.len(), total, name));
            Ok(())
        });
        let names = catalog.clone();
        orchestrator.on_failed(move |failure| {
            let name = names
                .get(&failure.key)
                .map(|s| s.display_name.as_str())
                .unwrap_or(failure.key.as_str());
            eprintln!("{}", format_section_failed(name, &failure.message()));
        });

        let reporting = CancellationToken::new();
        let reporter = spawn_progress_reporter(orchestrator.clone(), reporting.clone());

        let mut outcome = orchestrator.start(catalog.clone(), context).await;
        let mut attempts = 0;
        while let Ok(ref snapshot) = outcome {
            if snapshot.overall_status != OverallStatus::Failed || attempts >= retries {
                break;
            }
            let Some(failed) = snapshot
                .sections
                .iter()
                .find(|s| s.status == crate::session::SectionStatus::Failed)
            else {
                break;
            };
            attempts += 1;
            warn!(section = %failed.key, attempt = attempts, "retrying failed section");
            let key = failed.key.clone();
            outcome = orchestrator.retry_section(&key).await;
        }
        reporting.cancel();
        let _ = reporter.await;

        let snapshot = outcome?;
        let percent = orchestrator.overall_percent();
        let rendered = if format == "json" {
            format_session_json(&snapshot, &orchestrator.results(), percent)?
        } else {
            format_session_text(&snapshot, &catalog, percent)
        };

        match snapshot.overall_status {
            OverallStatus::Completed => Ok(rendered),
            _ => {
                println!("{}", rendered);
                let reason = snapshot
                    .transport_error
                    .clone()
                    .or_else(|| {
                        snapshot
                            .sections
                            .iter()
                            .find_map(|s| s.error.as_ref().map(|e| format!("{}: {}", s.key, e)))
                    })
                    .unwrap_or_else(|| snapshot.overall_status.as_str().to_string());
                Err(CliError::Incomplete(reason))
            }
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

fn read_context(path: &Path) -> Result<Value, CliError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| CliError::InvalidContext {
        path: path.display().to_string(),
        source,
    })
}

/// Print percent and remaining time on stderr while a session is running.
fn spawn_progress_reporter(
    orchestrator: GenerationOrchestrator,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PROGRESS_REPORT_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if orchestrator.status() != OverallStatus::InProgress {
                continue;
            }
            let percent = orchestrator.overall_percent();
            eprintln!(
                "{}",
                format_progress_line(percent, orchestrator.estimated_time_remaining())
            );
        }
    })
}
