//! Where configuration and execution state live
//!
//! `MEU_SANDBOX_CONFIG_DIR`, `MEU_SANDBOX_CONFIG` and `MEU_SANDBOX_STATE_DIR`
//! override the platform defaults.

use std::path::PathBuf;

const APP_DIR: &str = "meu-sandbox";

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Directory holding `config.json` and the security policy
pub fn config_dir() -> PathBuf {
    env_path("MEU_SANDBOX_CONFIG_DIR").unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR)
    })
}

pub fn config_path() -> PathBuf {
    env_path("MEU_SANDBOX_CONFIG").unwrap_or_else(|| config_dir().join("config.json"))
}

pub fn policy_path() -> PathBuf {
    config_dir().join("security-policy.json")
}

/// Root of written code and output areas
fn data_dir() -> PathBuf {
    env_path("MEU_SANDBOX_STATE_DIR").unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR)
    })
}

/// Host directories holding each project's code files
pub fn projects_dir() -> PathBuf {
    data_dir().join("projects")
}

/// Host directory under which each execution gets its own output area
pub fn output_dir() -> PathBuf {
    data_dir().join("output")
}
