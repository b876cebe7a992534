//! Configuration loading from disk and the process environment.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::{GatewayConfig, RunMode};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value:?}")]
    Env { key: &'static str, value: String },

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load configuration: optional TOML file, then environment overrides, then validation.
pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        }
        None => GatewayConfig::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Overlay environment variables on top of a parsed config.
///
/// `lookup` abstracts the environment so tests don't mutate process state.
pub fn apply_env_overrides<F>(config: &mut GatewayConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("SERVER_PORT") {
        config.listener.port = port.trim().parse().map_err(|_| ConfigError::Env {
            key: "SERVER_PORT",
            value: port.clone(),
        })?;
    }

    if let Some(key) = lookup("API_KEY").or_else(|| lookup("VITE_X_API_KEY")) {
        config.auth.api_key = key;
    }

    if let Some(url) = lookup("CLIENT_URL") {
        config.cors.client_url = url;
    }

    if let Some(mode) = lookup("APP_ENV").or_else(|| lookup("GO_ENV")) {
        config.cors.mode = RunMode::from_env_value(&mode);
    }

    if let Some(bin) = lookup("YT_DLP_BIN") {
        config.workers.binary_path = PathBuf::from(bin);
    }

    if let Some(max) = lookup("MAX_WORKERS") {
        let parsed: usize = max.trim().parse().map_err(|_| ConfigError::Env {
            key: "MAX_WORKERS",
            value: max.clone(),
        })?;
        config.workers.max_concurrent = Some(parsed);
    }

    if let Some(level) = lookup("LOG_LEVEL") {
        config.observability.log_level = level;
    }

    Ok(())
}
