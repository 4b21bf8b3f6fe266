//! Global config file source: $XDG_CONFIG_HOME/grantflow/config.toml, falling back
//! to the platform config directory.

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File};
use directories::BaseDirs;
use std::path::PathBuf;
use tracing::debug;

/// Path to the global config file, whether or not it exists.
pub fn global_config_path() -> Option<PathBuf> {
    let config_home = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| BaseDirs::new().map(|dirs| dirs.config_dir().to_path_buf()))?;
    Some(config_home.join("grantflow").join("config.toml"))
}

/// Add the global config file to the builder if it exists.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    match global_config_path() {
        Some(path) if path.is_file() => {
            debug!(config_path = %path.display(), "loading global configuration");
            Ok(builder.add_source(File::from(path).required(false)))
        }
        Some(path) => {
            debug!(config_path = %path.display(), "no global configuration file");
            Ok(builder)
        }
        None => Ok(builder),
    }
}
