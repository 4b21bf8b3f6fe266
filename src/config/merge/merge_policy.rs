//! Merge rules: defaults applied beneath every file and environment layer.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError};

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("backend.mode", "server_managed")?
        .set_default("generation.poll_interval_ms", 2_000i64)?
        .set_default("logging.level", "info")
}
