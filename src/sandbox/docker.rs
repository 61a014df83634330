//! Docker-backed isolation substrate
//!
//! Each sandbox is a long-lived container whose main process only sleeps;
//! commands run inside it through `exec`. Resource and security restrictions
//! are set on the container's host config.

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::substrate::{
    IsolationSubstrate, RunOutput, SandboxSpec, SandboxStats, SandboxSummary, SubstrateUsage,
};
use crate::error::{Error, Result};

/// Docker Engine API substrate
pub struct DockerSubstrate {
    docker: Docker,
}

impl DockerSubstrate {
    /// Connect using the local defaults (socket or `DOCKER_HOST`), retrying
    /// the first ping with exponential backoff for up to `patience`.
    pub async fn connect(patience: Duration) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Substrate(format!("Failed to connect to Docker: {}", e)))?;

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(patience),
            ..Default::default()
        };
        backoff::future::retry(policy, || {
            let docker = docker.clone();
            async move {
                docker.ping().await.map_err(|e| {
                    debug!("Docker ping failed, retrying: {}", e);
                    backoff::Error::transient(e)
                })
            }
        })
        .await
        .map_err(|e| Error::Substrate(format!("Docker ping failed: {}", e)))?;

        info!("Connected to Docker");
        Ok(DockerSubstrate { docker })
    }

    /// Wrap an existing client
    pub fn with_client(docker: Docker) -> Self {
        DockerSubstrate { docker }
    }

    fn host_config(spec: &SandboxSpec) -> HostConfig {
        let binds = spec
            .mounts
            .iter()
            .map(|m| {
                format!(
                    "{}:{}:{}",
                    m.source.display(),
                    m.target,
                    if m.read_only { "ro" } else { "rw" }
                )
            })
            .collect();

        let ulimits = spec
            .ulimits
            .iter()
            .map(|u| ResourcesUlimits {
                name: Some(u.name.to_string()),
                soft: Some(u.soft),
                hard: Some(u.hard),
            })
            .collect();

        let mut security_opt = Vec::new();
        if spec.no_new_privileges {
            security_opt.push("no-new-privileges:true".to_string());
        }

        HostConfig {
            memory: Some(spec.memory_bytes),
            // No swap beyond the memory ceiling
            memory_swap: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            pids_limit: Some(spec.pids_limit),
            ulimits: Some(ulimits),
            network_mode: Some(spec.network_mode.clone()),
            cap_drop: Some(spec.cap_drop.clone()),
            cap_add: Some(spec.cap_add.clone()),
            security_opt: Some(security_opt),
            readonly_rootfs: Some(spec.read_only_root),
            tmpfs: Some(spec.tmpfs.clone()),
            binds: Some(binds),
            auto_remove: Some(false),
            ..Default::default()
        }
    }
}

/// CPU use over the sampling window, as a percentage of one core
fn cpu_percent(cpu_delta: u64, system_delta: u64, online_cpus: u64) -> f64 {
    if system_delta == 0 {
        return 0.0;
    }
    cpu_delta as f64 / system_delta as f64 * online_cpus.max(1) as f64 * 100.0
}

fn memory_percent(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    usage as f64 / limit as f64 * 100.0
}

fn sandbox_stats(stats: &Stats) -> SandboxStats {
    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
    let system_delta = stats
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
    let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1);

    let memory_usage = stats.memory_stats.usage.unwrap_or(0);
    let memory_limit = stats.memory_stats.limit.unwrap_or(0);

    SandboxStats {
        cpu_percent: cpu_percent(cpu_delta, system_delta, online_cpus),
        memory_usage,
        memory_limit,
        memory_percent: memory_percent(memory_usage, memory_limit),
        pids: stats.pids_stats.current.unwrap_or(0),
    }
}

fn status_code(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

#[async_trait]
impl IsolationSubstrate for DockerSubstrate {
    fn name(&self) -> &str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if status_code(&e) == Some(404) => {}
            Err(e) => return Err(e.into()),
        }

        info!("Pulling Docker image: {}", image);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(Error::Substrate(format!("Failed to pull image {}: {}", image, e)));
                }
            }
        }

        info!("Image pulled successfully");
        Ok(())
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(spec.network_mode == "none"),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::Substrate(format!("Failed to create container {}: {}", spec.name, e)))?;

        for warning in &created.warnings {
            warn!(sandbox = %spec.name, "Docker: {}", warning);
        }

        if let Err(e) = self
            .docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
        {
            // A created but never started container would only wait for the reaper
            if let Err(cleanup) = self.remove(&spec.name).await {
                warn!(sandbox = %spec.name, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(Error::Substrate(format!(
                "Failed to start container {}: {}",
                spec.name, e
            )));
        }

        debug!(sandbox = %spec.name, id = %created.id, "Created container");
        Ok(created.id)
    }

    async fn run_in(&self, name: &str, command: &[String]) -> Result<RunOutput> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| match status_code(&e) {
                Some(404) => Error::NotFound(format!("sandbox {}", name)),
                _ => Error::Substrate(format!("Failed to create exec in {}: {}", name, e)),
            })?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(sandbox = name, "Error reading exec output: {}", e);
                            break;
                        }
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspected = self.docker.inspect_exec(&exec.id).await?;

        Ok(RunOutput {
            exit_code: inspected.exit_code,
            stdout,
            stderr,
        })
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => {
                Err(Error::NotFound(format!("sandbox {}", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => {
                debug!(sandbox = name, "Removed container");
                Ok(())
            }
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            // Removal already in progress
            Err(e) if status_code(&e) == Some(409) => Ok(()),
            Err(e) => Err(Error::Substrate(format!("Failed to remove container {}: {}", name, e))),
        }
    }

    async fn inspect(&self, name: &str) -> Result<Option<String>> {
        match self.docker.inspect_container(name, None).await {
            Ok(response) => Ok(Some(
                response
                    .state
                    .and_then(|s| s.status)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            )),
            Err(e) if status_code(&e) == Some(404) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<SandboxSummary>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        // The name filter matches substrings; keep true prefix matches only
        let summaries = containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .find(|n| n.starts_with(prefix))?;
                let created_at = Utc.timestamp_opt(c.created.unwrap_or(0), 0).single()?;
                Some(SandboxSummary {
                    name,
                    id: c.id.unwrap_or_default(),
                    created_at,
                    state: c.state.unwrap_or_else(|| "unknown".to_string()),
                })
            })
            .collect();

        Ok(summaries)
    }

    async fn stats(&self, name: &str) -> Result<Option<SandboxStats>> {
        // One sample; not one-shot, so the previous CPU reading is filled in
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.docker.stats(name, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(Some(sandbox_stats(&stats))),
            Some(Err(e)) if status_code(&e) == Some(404) => Ok(None),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn usage(&self) -> Result<Option<SubstrateUsage>> {
        let df = self.docker.df().await?;
        Ok(Some(SubstrateUsage {
            images: df.images.map(|v| v.len()).unwrap_or(0),
            containers: df.containers.map(|v| v.len()).unwrap_or(0),
            volumes: df.volumes.map(|v| v.len()).unwrap_or(0),
            layers_size: df.layers_size.unwrap_or(0),
        }))
    }
}
