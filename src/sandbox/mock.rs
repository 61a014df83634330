//! In-memory substrate for tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::substrate::{
    IsolationSubstrate, RunOutput, SandboxSpec, SandboxStats, SandboxSummary, SubstrateUsage,
};
use crate::error::{Error, Result};

/// What a scripted `run_in` call does
pub enum MockRun {
    /// Return this output
    Output(RunOutput),
    /// Never return
    Hang,
    /// Fail the dispatch
    Fail(String),
}

impl MockRun {
    /// Exit with `code`, printing `stdout`
    pub fn exit(code: i64, stdout: &str) -> Self {
        MockRun::Output(RunOutput {
            exit_code: Some(code),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }
}

type RunScript = dyn Fn(&str, &[String]) -> MockRun + Send + Sync;

struct MockSandbox {
    id: String,
    created_at: DateTime<Utc>,
    state: String,
    spec: Option<SandboxSpec>,
}

/// Records every call and keeps sandboxes in a map
pub struct MockSubstrate {
    sandboxes: Mutex<HashMap<String, MockSandbox>>,
    calls: Mutex<Vec<String>>,
    script: Box<RunScript>,
    fail_create: AtomicBool,
    fail_stop: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
}

impl MockSubstrate {
    /// Every command exits 0 with no output
    pub fn new() -> Self {
        Self::with_script(|_, _| MockRun::exit(0, ""))
    }

    /// Script `run_in` results
    pub fn with_script<F>(script: F) -> Self
    where
        F: Fn(&str, &[String]) -> MockRun + Send + Sync + 'static,
    {
        MockSubstrate {
            sandboxes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            script: Box::new(script),
            fail_create: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            create_delay: Mutex::new(None),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Make every create take `delay`
    pub fn delay_create(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    /// Add a sandbox that was created `age` ago, outside the engine
    pub fn insert_existing(&self, name: &str, age: chrono::Duration) {
        self.sandboxes.lock().unwrap().insert(
            name.to_string(),
            MockSandbox {
                id: format!("id-{}", name),
                created_at: Utc::now() - age,
                state: "running".to_string(),
                spec: None,
            },
        );
    }

    /// Calls in order, as `"op:name"`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls of one operation
    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{}:", op);
        self.calls().iter().filter(|c| c.starts_with(&prefix)).count()
    }

    /// Sandboxes currently alive
    pub fn live(&self) -> Vec<String> {
        let mut names: Vec<_> = self.sandboxes.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Spec a sandbox was created with
    pub fn spec_of(&self, name: &str) -> Option<SandboxSpec> {
        self.sandboxes
            .lock()
            .unwrap()
            .get(name)
            .and_then(|s| s.spec.clone())
    }

    fn record(&self, op: &str, name: &str) {
        self.calls.lock().unwrap().push(format!("{}:{}", op, name));
    }
}

#[async_trait]
impl IsolationSubstrate for MockSubstrate {
    fn name(&self) -> &str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String> {
        self.record("create", &spec.name);
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Substrate("mock create failure".to_string()));
        }

        let id = format!("id-{}", spec.name);
        self.sandboxes.lock().unwrap().insert(
            spec.name.clone(),
            MockSandbox {
                id: id.clone(),
                created_at: Utc::now(),
                state: "running".to_string(),
                spec: Some(spec.clone()),
            },
        );
        Ok(id)
    }

    async fn run_in(&self, name: &str, command: &[String]) -> Result<RunOutput> {
        self.record("run", name);
        if !self.sandboxes.lock().unwrap().contains_key(name) {
            return Err(Error::NotFound(format!("sandbox {}", name)));
        }

        match (self.script)(name, command) {
            MockRun::Output(output) => Ok(output),
            MockRun::Hang => std::future::pending().await,
            MockRun::Fail(message) => Err(Error::Substrate(message)),
        }
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<()> {
        self.record("stop", name);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(Error::Substrate("mock stop failure".to_string()));
        }
        match self.sandboxes.lock().unwrap().get_mut(name) {
            Some(sandbox) => {
                sandbox.state = "exited".to_string();
                Ok(())
            }
            None => Err(Error::NotFound(format!("sandbox {}", name))),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.record("remove", name);
        self.sandboxes.lock().unwrap().remove(name);
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .sandboxes
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.state.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<SandboxSummary>> {
        Ok(self
            .sandboxes
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, s)| SandboxSummary {
                name: name.clone(),
                id: s.id.clone(),
                created_at: s.created_at,
                state: s.state.clone(),
            })
            .collect())
    }

    async fn stats(&self, name: &str) -> Result<Option<SandboxStats>> {
        self.record("stats", name);
        Ok(self.sandboxes.lock().unwrap().get(name).map(|s| {
            let limit = s
                .spec
                .as_ref()
                .map(|spec| spec.memory_bytes.max(0) as u64)
                .unwrap_or(0);
            SandboxStats {
                cpu_percent: 0.0,
                memory_usage: 0,
                memory_limit: limit,
                memory_percent: 0.0,
                pids: 1,
            }
        }))
    }

    async fn usage(&self) -> Result<Option<SubstrateUsage>> {
        Ok(Some(SubstrateUsage {
            images: 1,
            containers: self.sandboxes.lock().unwrap().len(),
            volumes: 0,
            layers_size: 0,
        }))
    }
}
