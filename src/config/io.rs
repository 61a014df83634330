//! Configuration I/O - Loading and saving configuration
//!
//! Handles reading configuration from files and environment variables.

use serde::de::DeserializeOwned;
use std::path::Path;

use super::types::Config;
use crate::error::{Error, Result};

/// Load configuration with layered precedence:
/// 1. Config file (config.json) if it exists, otherwise defaults
/// 2. Environment variable overrides
pub fn load_config() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    parse_structured(path, &content).map_err(Error::Config)
}

/// Parse JSON5 or TOML, chosen by file extension.
///
/// Files with any other extension are tried as JSON5 first, then TOML.
pub(crate) fn parse_structured<T: DeserializeOwned>(
    path: &Path,
    content: &str,
) -> std::result::Result<T, String> {
    if path.extension().map_or(false, |ext| ext == "json") {
        json5::from_str(content).map_err(|e| format!("Invalid JSON in {}: {}", path.display(), e))
    } else if path.extension().map_or(false, |ext| ext == "toml") {
        toml::from_str(content).map_err(|e| format!("Invalid TOML in {}: {}", path.display(), e))
    } else {
        json5::from_str(content)
            .or_else(|_| toml::from_str(content).map_err(|e| e.to_string()))
            .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))
    }
}

/// Apply environment variable overrides to an existing config.
///
/// Loads `.env` first, then overlays any set variables. Env vars have the
/// highest precedence: defaults < file < env.
pub fn apply_env_overrides(config: &mut Config) {
    dotenvy::dotenv().ok();

    if let Ok(image) = std::env::var("MEU_SANDBOX_IMAGE") {
        config.engine.image = image;
    }
    if let Ok(max) = std::env::var("MEU_SANDBOX_MAX_CONCURRENCY") {
        if let Ok(v) = max.parse() {
            config.engine.max_concurrency = v;
        }
    }
    if let Ok(path) = std::env::var("MEU_SANDBOX_POLICY") {
        config.engine.policy_path = std::path::PathBuf::from(path);
    }
    if let Ok(dir) = std::env::var("MEU_SANDBOX_PROJECTS_DIR") {
        config.engine.projects_dir = std::path::PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("MEU_SANDBOX_OUTPUT_DIR") {
        config.engine.output_dir = std::path::PathBuf::from(dir);
    }
    if let Ok(fallback) = std::env::var("MEU_SANDBOX_POLICY_FALLBACK") {
        if let Ok(v) = fallback.parse() {
            config.engine.policy_fallback = v;
        }
    }

    // Reaper overrides
    if let Ok(v) = std::env::var("MEU_SANDBOX_REAPER_ENABLED") {
        config.reaper.enabled = v == "true" || v == "1";
    }
    if let Ok(v) = std::env::var("MEU_SANDBOX_REAPER_INTERVAL") {
        if let Ok(d) = humantime_serde::re::humantime::parse_duration(&v) {
            config.reaper.interval = d;
        }
    }
    if let Ok(v) = std::env::var("MEU_SANDBOX_REAPER_MAX_AGE") {
        if let Ok(d) = humantime_serde::re::humantime::parse_duration(&v) {
            config.reaper.max_age = d;
        }
    }

    // Logging overrides
    if let Ok(v) = std::env::var("MEU_SANDBOX_LOG_JSON") {
        config.logging.json = v == "true" || v == "1";
    }
}

/// Save configuration to a file
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let content = if path.extension().map_or(false, |ext| ext == "toml") {
        toml::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    } else {
        serde_json::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, content)?;
    Ok(())
}
