//! Reaper for stale sandboxes
//!
//! Runs on a fixed interval and force-removes every sandbox carrying this
//! engine's name prefix that is older than the configured maximum age,
//! whatever the manager believes about it. This catches sandboxes leaked by
//! crashed executions, restarts and failed releases.

use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ReaperConfig;
use crate::error::{Error, Result};
use crate::sandbox::EnvironmentManager;

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    /// Sandboxes with the engine prefix
    pub examined: usize,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// Periodic stale sandbox removal
pub struct Reaper {
    manager: Arc<EnvironmentManager>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(manager: Arc<EnvironmentManager>, config: ReaperConfig) -> Self {
        Reaper { manager, config }
    }

    fn prefix(&self) -> String {
        format!("{}-", self.manager.config().container_prefix)
    }

    /// Remove every prefixed sandbox older than the maximum age
    pub async fn sweep(&self) -> Result<SweepReport> {
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .map_err(|e| Error::Config(format!("reaper max_age out of range: {}", e)))?;
        let substrate = self.manager.substrate();
        let now = chrono::Utc::now();

        let sandboxes = substrate.list(&self.prefix()).await?;
        let mut report = SweepReport {
            examined: sandboxes.len(),
            ..Default::default()
        };

        for sandbox in sandboxes {
            let age = now - sandbox.created_at;
            if age <= max_age {
                continue;
            }

            match substrate.remove(&sandbox.name).await {
                Ok(()) => {
                    self.manager.forget(&sandbox.name);
                    info!(
                        sandbox = %sandbox.name,
                        age_secs = age.num_seconds(),
                        state = %sandbox.state,
                        "Reaped stale sandbox"
                    );
                    report.removed.push(sandbox.name);
                }
                Err(e) => {
                    error!(sandbox = %sandbox.name, error = %e, "Failed to reap sandbox");
                    report.failed.push(sandbox.name);
                }
            }
        }

        debug!(
            examined = report.examined,
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Reaper sweep done"
        );
        Ok(report)
    }

    /// Sweep forever on the configured interval
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval.as_secs(),
            max_age_secs = self.config.max_age.as_secs(),
            "Reaper started"
        );

        // Skip the first immediate tick
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(e) = self.sweep().await {
                error!("Reaper sweep failed: {}", e);
            }
        }
    }

    /// Run in a background task; the loop stops when the handle is dropped
    pub fn spawn(self: Arc<Self>) -> ReaperHandle {
        ReaperHandle(tokio::spawn(self.run()))
    }
}

/// Owns the background reaper task
pub struct ReaperHandle(JoinHandle<()>);

impl ReaperHandle {
    pub fn stop(self) {
        self.0.abort();
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::policy::SecurityPolicy;
    use crate::sandbox::mock::MockSubstrate;
    use std::path::Path;
    use std::time::Duration;

    fn setup(mock: &Arc<MockSubstrate>) -> (Arc<EnvironmentManager>, Arc<Reaper>) {
        let manager = Arc::new(EnvironmentManager::new(mock.clone(), EngineConfig::default()));
        let reaper = Arc::new(Reaper::new(manager.clone(), ReaperConfig::default()));
        (manager, reaper)
    }

    #[tokio::test]
    async fn test_sweep_removes_only_stale() {
        let mock = MockSubstrate::new().shared();
        let (_, reaper) = setup(&mock);
        mock.insert_existing("meu-exec-p-1-100-0", chrono::Duration::minutes(11));
        mock.insert_existing("meu-exec-p-2-200-1", chrono::Duration::minutes(1));
        mock.insert_existing("other-app-container", chrono::Duration::hours(5));
        mock.insert_existing("meu-executor-build", chrono::Duration::hours(5));

        let report = reaper.sweep().await.unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.removed, vec!["meu-exec-p-1-100-0".to_string()]);
        assert!(report.failed.is_empty());
        assert_eq!(
            mock.live(),
            vec![
                "meu-exec-p-2-200-1".to_string(),
                "meu-executor-build".to_string(),
                "other-app-container".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let mock = MockSubstrate::new().shared();
        let (_, reaper) = setup(&mock);
        mock.insert_existing("meu-exec-p-1-100-0", chrono::Duration::minutes(30));

        assert_eq!(reaper.sweep().await.unwrap().removed.len(), 1);
        let again = reaper.sweep().await.unwrap();
        assert_eq!(again.examined, 0);
        assert!(again.removed.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_forgets_tracked_sandbox() {
        let mock = MockSubstrate::new().shared();
        let (manager, reaper) = setup(&mock);
        let sandbox = manager
            .acquire("p", "1", Path::new("/w"), Path::new("/o"), &SecurityPolicy::restrictive())
            .await
            .unwrap();
        // Pretend it has been running far too long
        mock.insert_existing(&sandbox.name, chrono::Duration::minutes(20));

        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.removed, vec![sandbox.name.clone()]);
        assert_eq!(manager.tracked_count(), 0);

        // A later release of the same name is a no-op
        assert_eq!(manager.release(&sandbox.name).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop() {
        let mock = MockSubstrate::new().shared();
        let (_, reaper) = setup(&mock);
        mock.insert_existing("meu-exec-p-1-100-0", chrono::Duration::minutes(15));

        let handle = reaper.spawn();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(mock.live().len(), 1);

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert!(mock.live().is_empty());
        handle.stop();
    }
}
