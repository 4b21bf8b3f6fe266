//! Logging System
//!
//! Structured logging through `tracing`. Level, format and destination come from
//! the `[logging]` config section and can be overridden per process with
//! `GRANTFLOW_LOG`, `GRANTFLOW_LOG_FORMAT`, `GRANTFLOW_LOG_OUTPUT` and
//! `GRANTFLOW_LOG_MODULES`.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error, off
    #[serde(default = "default_log_level")]
    pub level: String,

    /// json or text
    #[serde(default = "default_format")]
    pub format: String,

    /// stdout, stderr or file
    #[serde(default = "default_output")]
    pub output: String,

    /// Used when `output = "file"`.
    #[serde(default = "default_log_file")]
    pub file: PathBuf,

    /// Text format on a terminal only.
    #[serde(default = "default_true")]
    pub color: bool,

    /// Per-module levels, e.g. `grantflow::transport = "debug"`.
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

// Progress lines own stdout.
fn default_output() -> String {
    "stderr".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from(".grantflow/grantflow.log")
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_format(),
            output: default_output(),
            file: default_log_file(),
            color: default_true(),
            modules: HashMap::new(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), String> {
        parse_format(&self.format)?;
        parse_output(&self.output)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogOutput {
    Stdout,
    Stderr,
    File,
}

/// Install the global subscriber.
///
/// Priority (highest first): environment variables, config, defaults.
pub fn init_logging(config: Option<&LoggingConfig>) -> Result<(), ConfigError> {
    let filter = build_env_filter(config)?;
    let format = determine_format(config)?;
    let output = determine_output(config)?;
    let use_color = config.map(|c| c.color).unwrap_or(true) && output != LogOutput::File;

    let writer = match output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
        LogOutput::File => BoxMakeWriter::new(std::sync::Mutex::new(open_log_file(config)?)),
    };

    let registry = Registry::default().with(filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(use_color)
                    .with_writer(writer),
            )
            .try_init(),
    };
    installed.map_err(|e| ConfigError::Logging(format!("Failed to install subscriber: {}", e)))
}

fn open_log_file(config: Option<&LoggingConfig>) -> Result<std::fs::File, ConfigError> {
    let log_file = config
        .map(|c| c.file.clone())
        .unwrap_or_else(default_log_file);
    if let Some(parent) = log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            ConfigError::Logging(format!("Failed to create log directory: {}", e))
        })?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .map_err(|e| ConfigError::Logging(format!("Failed to open log file {:?}: {}", log_file, e)))
}

fn build_env_filter(config: Option<&LoggingConfig>) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_env("GRANTFLOW_LOG") {
        return Ok(filter);
    }

    let level = config.map(|c| c.level.as_str()).unwrap_or("info");
    if level == "off" {
        return Ok(EnvFilter::new("off"));
    }
    let mut filter = EnvFilter::new(level);

    let mut directives: Vec<String> = config
        .map(|c| {
            c.modules
                .iter()
                .map(|(module, module_level)| format!("{}={}", module, module_level))
                .collect()
        })
        .unwrap_or_default();
    if let Ok(modules) = std::env::var("GRANTFLOW_LOG_MODULES") {
        directives.extend(parse_module_directives(&modules));
    }

    for directive in directives {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| ConfigError::Logging(format!("Invalid log directive '{}': {}", directive, e)))?,
        );
    }
    Ok(filter)
}

/// `a=debug, b = warn` into `["a=debug", "b=warn"]`; malformed entries are skipped.
fn parse_module_directives(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|spec| {
            let (module, level) = spec.split_once('=')?;
            let (module, level) = (module.trim(), level.trim());
            (!module.is_empty() && !level.is_empty()).then(|| format!("{}={}", module, level))
        })
        .collect()
}

fn determine_format(config: Option<&LoggingConfig>) -> Result<LogFormat, ConfigError> {
    if let Ok(format) = std::env::var("GRANTFLOW_LOG_FORMAT") {
        if let Ok(parsed) = parse_format(&format) {
            return Ok(parsed);
        }
    }
    let format = config.map(|c| c.format.as_str()).unwrap_or("text");
    parse_format(format).map_err(ConfigError::Logging)
}

fn determine_output(config: Option<&LoggingConfig>) -> Result<LogOutput, ConfigError> {
    let output = match std::env::var("GRANTFLOW_LOG_OUTPUT") {
        Ok(output) => output,
        Err(_) => config
            .map(|c| c.output.clone())
            .unwrap_or_else(default_output),
    };
    parse_output(&output).map_err(ConfigError::Logging)
}

fn parse_format(format: &str) -> Result<LogFormat, String> {
    match format {
        "json" => Ok(LogFormat::Json),
        "text" => Ok(LogFormat::Text),
        other => Err(format!("Invalid log format: {} (must be 'json' or 'text')", other)),
    }
}

fn parse_output(output: &str) -> Result<LogOutput, String> {
    match output {
        "stdout" => Ok(LogOutput::Stdout),
        "stderr" => Ok(LogOutput::Stderr),
        "file" => Ok(LogOutput::File),
        other => Err(format!(
            "Invalid log output: {} (must be 'stdout', 'stderr' or 'file')",
            other
        )),
    }
}
