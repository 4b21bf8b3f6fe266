//! Grantflow CLI Binary
//!
//! Command-line interface for progressive multi-section generation.

use anyhow::Context;
use clap::Parser;
use grantflow::cli::{Cli, RunContext};
use grantflow::config::ConfigLoader;
use grantflow::logging::{init_logging, LoggingConfig};
use std::process;
use tracing::{error, info};

fn main() {
    let cli = Cli::parse();

    let logging_config = build_logging_config(&cli);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    if let Err(e) = run(cli) {
        eprintln!("{:#}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    info!("Grantflow CLI starting");
    let context = RunContext::new(cli.workspace.clone(), cli.config.clone())
        .context("Failed to load configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    match runtime.block_on(context.execute(&cli.command)) {
        Ok(output) => {
            info!("Command completed successfully");
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {}", e);
            Err(anyhow::anyhow!(grantflow::cli::map_error(&e)))
        }
    }
}

/// Build logging configuration from CLI args and config file.
/// Precedence: CLI flags override config file override defaults.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    let mut config = match cli.config {
        Some(ref config_path) => ConfigLoader::load_from_file(config_path)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default(),
        None => ConfigLoader::load(&cli.workspace)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default(),
    };

    if cli.verbose {
        config.level = "debug".to_string();
    }
    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.clone();
    }
    if let Some(ref output) = cli.log_output {
        config.output = output.clone();
    }
    if let Some(ref file) = cli.log_file {
        config.file = file.clone();
    }
    config
}
