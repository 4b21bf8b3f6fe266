//! Integration tests for the grantflow generation orchestrator

mod cli_commands;
mod self_driven;
mod server_managed;
pub mod support;
