//! Execution environment manager
//!
//! Owns the table of live sandboxes. The table lock guards only inserts,
//! removals and counts; substrate calls always run with the lock released.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::substrate::{IsolationSubstrate, Mount, SandboxSpec, SandboxStats, SubstrateUsage, Ulimit};
use super::{OUTPUT_MOUNT, PROJECTS_MOUNT};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::policy::SecurityPolicy;

/// Label carried by every sandbox this engine creates
pub const MANAGED_LABEL: &str = "meu-sandbox.managed";

/// Lifecycle state of a tracked sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Creating,
    Running,
    Executing,
    Stopping,
    Removed,
    Failed,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Running => "running",
            SandboxStatus::Executing => "executing",
            SandboxStatus::Stopping => "stopping",
            SandboxStatus::Removed => "removed",
            SandboxStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One tracked sandbox
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    pub name: String,
    /// Substrate-assigned id; empty while creating
    pub id: String,
    pub project_id: String,
    pub step_id: String,
    pub created_at: DateTime<Utc>,
    pub status: SandboxStatus,
}

/// Creates, tracks and tears down sandboxes under a concurrency cap
pub struct EnvironmentManager {
    substrate: Arc<dyn IsolationSubstrate>,
    config: EngineConfig,
    table: Mutex<HashMap<String, Sandbox>>,
    sequence: AtomicU64,
}

impl EnvironmentManager {
    pub fn new(substrate: Arc<dyn IsolationSubstrate>, config: EngineConfig) -> Self {
        EnvironmentManager {
            substrate,
            config,
            table: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn substrate(&self) -> &Arc<dyn IsolationSubstrate> {
        &self.substrate
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Sandbox>> {
        // The table holds plain records; a panic elsewhere cannot leave it torn
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve a slot and create a sandbox for `(project_id, step_id)`.
    ///
    /// `work_dir` is mounted read-only and `output_area` is the only writable
    /// host path the sandbox sees. Both must be absolute.
    ///
    /// Fails fast with [`Error::Capacity`] when the table is full. A failed
    /// creation frees the slot and surfaces as [`Error::Substrate`].
    pub async fn acquire(
        &self,
        project_id: &str,
        step_id: &str,
        work_dir: &Path,
        output_area: &Path,
        policy: &SecurityPolicy,
    ) -> Result<Sandbox> {
        let name = self.next_name(project_id, step_id);
        let spec = self.build_spec(&name, project_id, step_id, work_dir, output_area, policy)?;

        {
            let mut table = self.table();
            if table.len() >= self.config.max_concurrency {
                return Err(Error::Capacity {
                    active: table.len(),
                    max: self.config.max_concurrency,
                });
            }
            table.insert(
                name.clone(),
                Sandbox {
                    name: name.clone(),
                    id: String::new(),
                    project_id: project_id.to_string(),
                    step_id: step_id.to_string(),
                    created_at: Utc::now(),
                    status: SandboxStatus::Creating,
                },
            );
        }

        debug!(sandbox = %name, project = project_id, step = step_id, "Creating sandbox");

        let id = match self.substrate.create_sandbox(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.table().remove(&name);
                error!(sandbox = %name, error = %e, "Sandbox creation failed");
                return Err(match e {
                    Error::Substrate(_) => e,
                    other => Error::Substrate(other.to_string()),
                });
            }
        };

        let sandbox = {
            let mut table = self.table();
            match table.get_mut(&name) {
                Some(entry) => {
                    entry.id = id;
                    entry.status = SandboxStatus::Running;
                    entry.clone()
                }
                // Forgotten by the reaper while creating; it owns removal now
                None => {
                    return Err(Error::Substrate(format!(
                        "sandbox {} was reclaimed during creation",
                        name
                    )))
                }
            }
        };

        info!(
            sandbox = %sandbox.name,
            id = %sandbox.id,
            project = project_id,
            step = step_id,
            "Sandbox running"
        );
        Ok(sandbox)
    }

    /// Stop and remove a sandbox.
    ///
    /// The tracking entry is dropped whatever the substrate says. Errors are
    /// logged, never returned. Returns the final status, or `None` if the
    /// name was not tracked (a second release is a no-op).
    pub async fn release(&self, name: &str) -> Option<SandboxStatus> {
        if !self.mark(name, SandboxStatus::Stopping) {
            debug!(sandbox = name, "Release of untracked sandbox ignored");
            return None;
        }

        if let Err(e) = self.substrate.stop(name, self.config.stop_timeout).await {
            warn!(sandbox = name, error = %e, "Graceful stop failed; forcing removal");
        }

        let status = match self.substrate.remove(name).await {
            Ok(()) => SandboxStatus::Removed,
            Err(e) => {
                error!(sandbox = name, error = %e, "Sandbox removal failed; leaving it to the reaper");
                SandboxStatus::Failed
            }
        };

        self.table().remove(name);
        info!(sandbox = name, status = %status, "Sandbox released");
        Some(status)
    }

    /// Substrate state of a sandbox, `"not_found"` if it is gone
    pub async fn inspect(&self, name: &str) -> String {
        match self.substrate.inspect(name).await {
            Ok(Some(state)) => state,
            Ok(None) => "not_found".to_string(),
            Err(e) => {
                warn!(sandbox = name, error = %e, "Sandbox inspect failed");
                "unknown".to_string()
            }
        }
    }

    /// Resource usage of a sandbox; `None` if gone or unreported
    pub async fn stats(&self, name: &str) -> Option<SandboxStats> {
        match self.substrate.stats(name).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(sandbox = name, error = %e, "Sandbox stats unavailable");
                None
            }
        }
    }

    /// Substrate-wide disk usage; `None` if unreported
    pub async fn usage(&self) -> Option<SubstrateUsage> {
        match self.substrate.usage().await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(substrate = self.substrate.name(), error = %e, "Substrate usage unavailable");
                None
            }
        }
    }

    /// Set the status of a tracked sandbox; false if untracked
    pub fn mark(&self, name: &str, status: SandboxStatus) -> bool {
        match self.table().get_mut(name) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Snapshot of tracked sandboxes
    pub fn active(&self) -> Vec<Sandbox> {
        let mut sandboxes: Vec<_> = self.table().values().cloned().collect();
        sandboxes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sandboxes
    }

    pub fn tracked_count(&self) -> usize {
        self.table().len()
    }

    /// Drop a tracking entry without touching the substrate
    pub fn forget(&self, name: &str) -> Option<Sandbox> {
        self.table().remove(name)
    }

    /// Release every tracked sandbox concurrently
    pub async fn release_all(&self) -> usize {
        let names: Vec<String> = self.table().keys().cloned().collect();
        if names.is_empty() {
            return 0;
        }

        info!(count = names.len(), "Releasing all sandboxes");
        let results = futures::future::join_all(names.iter().map(|n| self.release(n))).await;
        results.into_iter().flatten().count()
    }

    fn next_name(&self, project_id: &str, step_id: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{}-{}-{}",
            self.config.container_prefix,
            project_id,
            step_id,
            Utc::now().timestamp_millis(),
            seq
        )
    }

    fn build_spec(
        &self,
        name: &str,
        project_id: &str,
        step_id: &str,
        work_dir: &Path,
        output_area: &Path,
        policy: &SecurityPolicy,
    ) -> Result<SandboxSpec> {
        // Docker reads a relative bind source as a named volume
        for source in [work_dir, output_area] {
            if !source.is_absolute() {
                return Err(Error::Config(format!(
                    "mount source {} is not an absolute path",
                    source.display()
                )));
            }
        }

        let limits = &policy.resource_limits;
        let options = &policy.security_options;

        let memory_bytes = limits.memory_bytes().ok_or_else(|| {
            Error::Policy(format!("unparseable memory limit '{}'", limits.memory))
        })?;
        let pids = i64::from(limits.pid_limit);
        let artifact = i64::try_from(limits.artifact_byte_limit).unwrap_or(i64::MAX);
        let nofile_soft = i64::try_from(limits.open_files.soft).unwrap_or(i64::MAX);
        let nofile_hard = i64::try_from(limits.open_files.hard).unwrap_or(i64::MAX);

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert("meu-sandbox.project".to_string(), project_id.to_string());
        labels.insert("meu-sandbox.step".to_string(), step_id.to_string());

        Ok(SandboxSpec {
            name: name.to_string(),
            image: self.config.image.clone(),
            command: vec!["sleep".to_string(), limits.sandbox_lifetime().to_string()],
            working_dir: "/workspace".to_string(),
            memory_bytes,
            nano_cpus: (limits.cpu_share * 1_000_000_000.0) as i64,
            pids_limit: pids,
            ulimits: vec![
                Ulimit { name: "nproc", soft: pids, hard: pids },
                Ulimit { name: "nofile", soft: nofile_soft, hard: nofile_hard },
                Ulimit { name: "fsize", soft: artifact, hard: artifact },
            ],
            network_mode: policy.network_policy.mode.to_string(),
            cap_drop: options.dropped_capabilities.iter().cloned().collect(),
            cap_add: options.added_capabilities.iter().cloned().collect(),
            no_new_privileges: options.no_new_privileges,
            read_only_root: options.read_only_root_filesystem,
            tmpfs: options
                .tmpfs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            mounts: vec![
                Mount::read_only(work_dir, format!("{}/{}", PROJECTS_MOUNT, project_id)),
                Mount::writable(output_area, OUTPUT_MOUNT),
            ],
            labels,
        })
    }
}
