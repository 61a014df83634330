//! Delayed sandbox release
//!
//! A finished execution keeps its sandbox for a short grace period so late
//! artifact writes land before teardown. Each delayed release is a tracked
//! task that can be cancelled or flushed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use super::manager::EnvironmentManager;

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slots {
    next_generation: u64,
    tasks: HashMap<String, Pending>,
}

/// Scheduled, cancellable sandbox releases
pub struct ReleaseQueue {
    manager: Arc<EnvironmentManager>,
    slots: Arc<Mutex<Slots>>,
}

impl ReleaseQueue {
    pub fn new(manager: Arc<EnvironmentManager>) -> Self {
        ReleaseQueue {
            manager,
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        lock(&self.slots)
    }

    /// Release `name` after `delay`. Rescheduling a name replaces its timer.
    pub fn schedule(&self, name: &str, delay: Duration) {
        let mut slots = self.slots();
        slots.next_generation += 1;
        let generation = slots.next_generation;

        let manager = self.manager.clone();
        let shared = self.slots.clone();
        let owned = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.release(&owned).await;

            let mut slots = lock(&shared);
            if slots.tasks.get(&owned).map(|p| p.generation) == Some(generation) {
                slots.tasks.remove(&owned);
            }
        });

        if let Some(previous) = slots.tasks.insert(name.to_string(), Pending { generation, handle }) {
            previous.handle.abort();
        }
        debug!(sandbox = name, delay_ms = delay.as_millis() as u64, "Release scheduled");
    }

    /// Drop a scheduled release without releasing. True if one was pending.
    pub fn cancel(&self, name: &str) -> bool {
        match self.slots().tasks.remove(name) {
            Some(pending) => {
                pending.handle.abort();
                debug!(sandbox = name, "Release cancelled");
                true
            }
            None => false,
        }
    }

    /// Skip the grace period and release `name` now
    pub async fn release_now(&self, name: &str) {
        self.cancel(name);
        self.manager.release(name).await;
    }

    /// Release everything still pending, immediately. Returns how many.
    pub async fn flush(&self) -> usize {
        let drained: Vec<(String, Pending)> = self.slots().tasks.drain().collect();
        for (_, pending) in &drained {
            pending.handle.abort();
        }

        let names: Vec<String> = drained.into_iter().map(|(name, _)| name).collect();
        futures::future::join_all(names.iter().map(|n| self.manager.release(n))).await;
        names.len()
    }

    /// Names with a release pending
    pub fn pending(&self) -> Vec<String> {
        let mut names: Vec<_> = self.slots().tasks.keys().cloned().collect();
        names.sort();
        names
    }
}

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::policy::SecurityPolicy;
    use crate::sandbox::mock::MockSubstrate;
    use std::path::Path;

    async fn setup() -> (Arc<MockSubstrate>, Arc<EnvironmentManager>, ReleaseQueue, String) {
        let mock = MockSubstrate::new().shared();
        let manager = Arc::new(EnvironmentManager::new(mock.clone(), EngineConfig::default()));
        let sandbox = manager
            .acquire("p", "1", Path::new("/w"), Path::new("/o"), &SecurityPolicy::restrictive())
            .await
            .unwrap();
        let queue = ReleaseQueue::new(manager.clone());
        (mock, manager, queue, sandbox.name)
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_grace() {
        let (mock, manager, queue, name) = setup().await;

        queue.schedule(&name, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(manager.tracked_count(), 1);
        assert_eq!(queue.pending(), vec![name.clone()]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.tracked_count(), 0);
        assert!(mock.live().is_empty());
        assert!(queue.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_keeps_sandbox() {
        let (mock, manager, queue, name) = setup().await;

        queue.schedule(&name, Duration::from_secs(5));
        assert!(queue.cancel(&name));
        assert!(!queue.cancel(&name));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(manager.tracked_count(), 1);
        assert_eq!(mock.count("remove"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_releases_immediately() {
        let (mock, manager, queue, name) = setup().await;

        queue.schedule(&name, Duration::from_secs(300));
        assert_eq!(queue.flush().await, 1);
        assert_eq!(manager.tracked_count(), 0);
        assert!(queue.pending().is_empty());

        // The aborted timer never fires a second release
        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(mock.count("remove"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_timer() {
        let (mock, manager, queue, name) = setup().await;

        queue.schedule(&name, Duration::from_secs(5));
        queue.schedule(&name, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(manager.tracked_count(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(manager.tracked_count(), 0);
        assert_eq!(mock.count("remove"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_now_skips_grace() {
        let (mock, manager, queue, name) = setup().await;

        queue.schedule(&name, Duration::from_secs(300));
        queue.release_now(&name).await;
        assert_eq!(manager.tracked_count(), 0);
        assert!(mock.live().is_empty());
        assert!(queue.pending().is_empty());

        // The cancelled timer does not release again
        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(mock.count("remove"), 1);

        // A second release of the same name is a no-op
        queue.release_now(&name).await;
        assert_eq!(mock.count("remove"), 1);
    }
}
