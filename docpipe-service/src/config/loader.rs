//! Configuration loading from files and environment variables.

use config::{Config, Environment, File};

use crate::error::{ServiceError, ServiceResult};

use super::AppConfig;

/// Load configuration from `config.*` and `DOCPIPE__*` env vars, then validate it.
pub fn load_config() -> ServiceResult<AppConfig> {
    let config: AppConfig = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("DOCPIPE")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to build config: {}", e),
        })?
        .try_deserialize()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to deserialize config: {}", e),
        })?;

    config.validate()?;
    Ok(config)
}
