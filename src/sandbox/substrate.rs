//! Isolation substrate interface
//!
//! The narrow set of calls the engine makes against whatever actually
//! enforces process, filesystem and network isolation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Host directory bound into a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    /// Read-only bind
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Mount {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    /// Writable bind
    pub fn writable(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Mount {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }
}

/// A process ulimit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ulimit {
    pub name: &'static str,
    pub soft: i64,
    pub hard: i64,
}

/// Everything the substrate needs to materialize one sandbox
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    /// Main process; keeps the sandbox alive until it exits on its own
    pub command: Vec<String>,
    pub working_dir: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub ulimits: Vec<Ulimit>,
    pub network_mode: String,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub no_new_privileges: bool,
    pub read_only_root: bool,
    pub tmpfs: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    pub labels: HashMap<String, String>,
}

/// Outcome of a command dispatched inside a sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

/// A sandbox as the substrate lists it
#[derive(Debug, Clone)]
pub struct SandboxSummary {
    pub name: String,
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub state: String,
}

/// Point-in-time resource usage of one sandbox
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStats {
    pub cpu_percent: f64,
    /// Bytes
    pub memory_usage: u64,
    /// Bytes
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub pids: u64,
}

/// Disk usage of the substrate as a whole
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubstrateUsage {
    pub images: usize,
    pub containers: usize,
    pub volumes: usize,
    /// Bytes taken by image layers
    pub layers_size: i64,
}

/// Operations the engine needs from an isolation layer.
///
/// Sandboxes are addressed by name. `remove` of a sandbox that no longer
/// exists succeeds.
#[async_trait]
pub trait IsolationSubstrate: Send + Sync {
    /// Substrate name for logs
    fn name(&self) -> &str;

    /// Check the substrate is reachable
    async fn ping(&self) -> Result<()>;

    /// Make sure the sandbox image is present
    async fn ensure_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    /// Create and start a sandbox, returning the substrate's id for it
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String>;

    /// Run a command inside a running sandbox and wait for it
    async fn run_in(&self, name: &str, command: &[String]) -> Result<RunOutput>;

    /// Stop the sandbox's main process, killing it after `timeout`
    async fn stop(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Force-remove the sandbox
    async fn remove(&self, name: &str) -> Result<()>;

    /// Current state, or `None` if the sandbox does not exist
    async fn inspect(&self, name: &str) -> Result<Option<String>>;

    /// All sandboxes whose name starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<SandboxSummary>>;

    /// Resource usage of a sandbox; `None` if it does not exist or the
    /// substrate cannot report it
    async fn stats(&self, _name: &str) -> Result<Option<SandboxStats>> {
        Ok(None)
    }

    /// Substrate-wide disk usage; `None` if not reported
    async fn usage(&self) -> Result<Option<SubstrateUsage>> {
        Ok(None)
    }
}
