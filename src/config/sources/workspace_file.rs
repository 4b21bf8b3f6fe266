//! Workspace config file source: config/config.toml and config/{env}.toml

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File};
use std::path::Path;

/// Add workspace config files to the builder.
/// Precedence: config/config.toml (base) then config/{GRANTFLOW_ENV}.toml.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let config_dir = workspace_root.join("config");
    let env_name = std::env::var("GRANTFLOW_ENV").unwrap_or_else(|_| "development".to_string());

    let mut builder = builder;
    for path in [
        config_dir.join("config.toml"),
        config_dir.join(format!("{}.toml", env_name)),
    ] {
        if path.is_file() {
            builder = builder.add_source(File::from(path).required(false));
        }
    }
    Ok(builder)
}
