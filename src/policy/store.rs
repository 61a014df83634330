//! Policy loading and hot reload

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::validation::validate_policy;
use super::SecurityPolicy;
use crate::config::parse_structured;
use crate::error::{Error, Result};

/// Parse and validate policy text.
///
/// `path` only selects the format (by extension) and labels errors.
pub fn parse_policy(path: &Path, content: &str) -> Result<SecurityPolicy> {
    let policy: SecurityPolicy = parse_structured(path, content).map_err(Error::Policy)?;

    let report = validate_policy(&policy);
    for warning in &report.warnings {
        warn!(policy = %path.display(), "Policy warning: {}", warning);
    }
    if !report.valid {
        return Err(Error::Policy(format!(
            "Invalid policy {}: {}",
            path.display(),
            report.error_summary()
        )));
    }

    Ok(policy)
}

/// Read, parse and validate a policy file
pub fn load_policy(path: &Path) -> Result<SecurityPolicy> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Policy(format!("Failed to read policy file {}: {}", path.display(), e))
    })?;

    parse_policy(path, &content)
}

/// Holds the active policy.
///
/// Readers get an `Arc` snapshot; a reload swaps the whole policy only after
/// the new one has fully validated, so nobody ever observes a half-applied
/// policy.
pub struct PolicyStore {
    source: Option<PathBuf>,
    current: RwLock<Arc<SecurityPolicy>>,
}

impl PolicyStore {
    /// Load the policy at `path`, failing closed on any error
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let policy = load_policy(&path)?;

        info!(
            policy = %path.display(),
            languages = ?policy.languages(),
            "Security policy loaded"
        );

        Ok(PolicyStore {
            source: Some(path),
            current: RwLock::new(Arc::new(policy)),
        })
    }

    /// Load the policy at `path`, or run under [`SecurityPolicy::restrictive`]
    /// if it cannot be loaded. The source path is kept so a later
    /// [`reload`](Self::reload) can pick up a repaired file.
    pub fn open_or_restrictive(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match load_policy(&path) {
            Ok(policy) => {
                info!(policy = %path.display(), "Security policy loaded");
                PolicyStore {
                    source: Some(path),
                    current: RwLock::new(Arc::new(policy)),
                }
            }
            Err(e) => {
                warn!(
                    policy = %path.display(),
                    error = %e,
                    "Policy failed to load; running under the built-in restrictive policy"
                );
                PolicyStore {
                    source: Some(path),
                    current: RwLock::new(Arc::new(SecurityPolicy::restrictive())),
                }
            }
        }
    }

    /// Wrap an in-memory policy (no reload source)
    pub fn from_policy(policy: SecurityPolicy) -> Self {
        PolicyStore {
            source: None,
            current: RwLock::new(Arc::new(policy)),
        }
    }

    /// Policy file this store reloads from
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Snapshot of the active policy
    pub async fn current(&self) -> Arc<SecurityPolicy> {
        self.current.read().await.clone()
    }

    /// Re-read the policy source.
    ///
    /// On failure the previous policy stays active and the error is returned.
    pub async fn reload(&self) -> Result<Arc<SecurityPolicy>> {
        let path = self
            .source
            .as_deref()
            .ok_or_else(|| Error::Policy("Policy store has no source to reload from".to_string()))?;

        let policy = match load_policy(path) {
            Ok(policy) => Arc::new(policy),
            Err(e) => {
                warn!(policy = %path.display(), error = %e, "Policy reload rejected; keeping previous policy");
                return Err(e);
            }
        };

        *self.current.write().await = policy.clone();
        info!(policy = %path.display(), "Security policy reloaded");
        Ok(policy)
    }
}
