//! Engine configuration types
//!
//! Configuration for the execution engine itself: which image sandboxes run,
//! where code and artifacts live on the host, how many sandboxes may exist at
//! once, and how stale sandboxes are reaped.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::paths;

/// Execution engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Name prefix of every sandbox this engine creates (the Reaper's filter)
    #[serde(default = "default_prefix")]
    pub container_prefix: String,
    /// Image sandboxes are created from
    #[serde(default = "default_image")]
    pub image: String,
    /// Maximum number of simultaneously tracked sandboxes
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Host directory holding one sub-directory per project
    #[serde(default = "default_projects_dir")]
    pub projects_dir: PathBuf,
    /// Host directory mounted writable into every sandbox for artifacts
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Security policy file
    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,
    /// What to do when the policy file cannot be loaded
    #[serde(default)]
    pub policy_fallback: PolicyFallback,
    /// Delay between the end of an execution and the release of its sandbox
    #[serde(default = "default_release_grace", with = "humantime_serde")]
    pub release_grace: Duration,
    /// Graceful stop window before a sandbox is killed
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
    /// Client-side slack added on top of the substrate-enforced timeout
    #[serde(default = "default_dispatch_overhead", with = "humantime_serde")]
    pub dispatch_overhead: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            container_prefix: default_prefix(),
            image: default_image(),
            max_concurrency: default_max_concurrency(),
            projects_dir: default_projects_dir(),
            output_dir: default_output_dir(),
            policy_path: default_policy_path(),
            policy_fallback: PolicyFallback::default(),
            release_grace: default_release_grace(),
            stop_timeout: default_stop_timeout(),
            dispatch_overhead: default_dispatch_overhead(),
        }
    }
}

fn default_prefix() -> String {
    "meu-exec".to_string()
}

fn default_image() -> String {
    "meu-executor:latest".to_string()
}

fn default_max_concurrency() -> usize {
    5
}

fn default_projects_dir() -> PathBuf {
    paths::projects_dir()
}

fn default_output_dir() -> PathBuf {
    paths::output_dir()
}

fn default_policy_path() -> PathBuf {
    paths::policy_path()
}

fn default_release_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_dispatch_overhead() -> Duration {
    Duration::from_secs(10)
}

/// Behavior when the security policy fails to load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyFallback {
    /// Refuse to start
    #[default]
    Refuse,
    /// Run under the built-in restrictive policy
    Restrictive,
}

impl std::str::FromStr for PolicyFallback {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "refuse" | "none" | "fail" => Ok(PolicyFallback::Refuse),
            "restrictive" | "strict" => Ok(PolicyFallback::Restrictive),
            _ => Err(crate::error::Error::Config(format!(
                "Invalid policy fallback: {}. Valid: refuse, restrictive",
                s
            ))),
        }
    }
}

impl std::fmt::Display for PolicyFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyFallback::Refuse => write!(f, "refuse"),
            PolicyFallback::Restrictive => write!(f, "restrictive"),
        }
    }
}

/// Reaper (stale sandbox cleanup) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Run the background sweep
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Time between sweeps
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Sandboxes older than this are force-removed
    #[serde(default = "default_max_age", with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            enabled: true,
            interval: default_interval(),
            max_age: default_max_age(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_age() -> Duration {
    Duration::from_secs(10 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_fallback_parsing() {
        assert_eq!(
            "restrictive".parse::<PolicyFallback>().unwrap(),
            PolicyFallback::Restrictive
        );
        assert_eq!("Refuse".parse::<PolicyFallback>().unwrap(), PolicyFallback::Refuse);
        assert!("permissive".parse::<PolicyFallback>().is_err());
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.container_prefix, "meu-exec");
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.policy_fallback, PolicyFallback::Refuse);
        assert_eq!(config.release_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_humantime_durations() {
        let reaper: ReaperConfig =
            serde_json::from_str(r#"{ "interval": "30s", "max_age": "2m" }"#).unwrap();
        assert!(reaper.enabled);
        assert_eq!(reaper.interval, Duration::from_secs(30));
        assert_eq!(reaper.max_age, Duration::from_secs(120));
    }
}
