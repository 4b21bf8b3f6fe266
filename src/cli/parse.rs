//! CLI parse: clap types for grantflow. No behavior; definitions only.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::BackendMode;

/// Grantflow CLI - progressive multi-section grant content generation
#[derive(Parser, Debug)]
#[command(name = "grantflow")]
#[command(about = "Generate grant application sections in order, with live progress")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a generation session and print the resulting sections
    Generate {
        /// JSON file with the applicant context sent to the backend
        #[arg(long)]
        context: PathBuf,

        /// Override the configured backend mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Auto-save accumulated results to this JSON file after every section
        #[arg(long)]
        out: Option<PathBuf>,

        /// Retry a failed section up to this many times before giving up
        #[arg(long, default_value = "0")]
        retries: u32,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List the sections of the active catalog
    Catalog {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// The backend runs the session; progress is streamed or polled
    Server,
    /// Sections are requested one at a time by this process
    Local,
}

impl From<ModeArg> for BackendMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Server => BackendMode::ServerManaged,
            ModeArg::Local => BackendMode::SelfDriven,
        }
    }
}
