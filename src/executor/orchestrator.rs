//! Execution orchestrator
//!
//! Runs one request end to end: validate, write the code file, acquire a
//! sandbox, dispatch the time-bounded command inside it, read the artifacts
//! back, and schedule the sandbox's release.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::artifacts::{
    self, ArtifactPaths, StageStatus, COMPILE_STAGE, ERROR_TRUNCATED, OUTPUT_TRUNCATED, RUN_STAGE,
};
use super::types::{policy_key, ExecutionRequest, ExecutionResult, SecurityInfo};
use crate::config::{EngineConfig, PolicyFallback};
use crate::error::{Error, Result};
use crate::policy::{shell_quote, PolicyStore, SecurityPolicy, TemplateContext};
use crate::sandbox::{
    DockerSubstrate, EnvironmentManager, IsolationSubstrate, ReleaseQueue, RunOutput,
    SandboxStatus, OUTPUT_MOUNT, PROJECTS_MOUNT,
};
use crate::validator::{ensure_safe_name, validate_command, validate_source};

/// Seconds between the timeout wrapper's TERM and KILL
const KILL_AFTER_SECS: u64 = 2;

/// Exit status of `timeout` when the command ran out of time
const TIMEOUT_EXIT: i64 = 124;

/// Exit status of a process killed by SIGKILL
const KILLED_EXIT: i64 = 137;

/// How long to wait for the Docker daemon at startup
const CONNECT_PATIENCE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Stage {
    name: &'static str,
    command: String,
    timeout_seconds: u64,
}

/// Everything decided before a sandbox exists
#[derive(Debug)]
struct Plan {
    file_name: String,
    work_dir: PathBuf,
    /// Host directory private to this execution, mounted at the output mount
    output_area: PathBuf,
    project_dir: String,
    build_dir: String,
    stages: Vec<Stage>,
    artifacts: ArtifactPaths,
}

impl Plan {
    /// Substrate-enforced time of all stages, including the kill window
    fn stage_budget(&self) -> Duration {
        let secs: u64 = self
            .stages
            .iter()
            .map(|s| s.timeout_seconds + KILL_AFTER_SECS)
            .sum();
        Duration::from_secs(secs)
    }

    fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    fn last_stage(&self) -> Option<&Stage> {
        self.stages.last()
    }

    /// Shell script run inside the sandbox.
    ///
    /// Stages run in order and stop at the first failure. Streams go to the
    /// artifact files; the last exit code, the stage it came from and how
    /// long that stage took go to the status artifact.
    fn script(&self) -> String {
        let (out, err, status) = self.artifacts.in_sandbox();
        let (out, err, status) = (shell_quote(&out), shell_quote(&err), shell_quote(&status));
        let mut lines = vec![
            format!("cd {} || exit 125", shell_quote(&self.project_dir)),
            format!(
                "mkdir -p {} && : > {} && : > {} || exit 125",
                shell_quote(&self.build_dir),
                out,
                err
            ),
            format!("code=0; stage={}; took=0", RUN_STAGE),
        ];
        for stage in &self.stages {
            lines.push(format!(
                "if [ \"$code\" -eq 0 ]; then stage={}; start=$(date +%s); timeout --kill-after={}s {}s {} >> {} 2>> {}; code=$?; took=$(( $(date +%s) - start )); fi",
                stage.name, KILL_AFTER_SECS, stage.timeout_seconds, stage.command, out, err
            ));
        }
        lines.push(format!(
            "printf '{{\"exitCode\":%d,\"stage\":\"%s\",\"stageSeconds\":%d}}' \"$code\" \"$stage\" \"$took\" > {}",
            status
        ));
        lines.push("exit \"$code\"".to_string());
        lines.join("\n")
    }

    /// The stage that ran out of time, if any.
    ///
    /// A 124 or 137 from the program itself is not a timeout: with a status
    /// artifact the stage must also have used its whole budget.
    fn timed_out_stage(
        &self,
        status: Option<&StageStatus>,
        exit_code: Option<i64>,
        guard_fired: bool,
        elapsed: Duration,
    ) -> Option<&Stage> {
        let recorded = status.and_then(|s| s.stage.as_deref()).and_then(|name| self.stage(name));

        if guard_fired {
            return recorded.or_else(|| self.last_stage());
        }
        if !matches!(exit_code, Some(TIMEOUT_EXIT) | Some(KILLED_EXIT)) {
            return None;
        }

        match (recorded, status.and_then(|s| s.stage_seconds)) {
            (Some(stage), Some(took)) => (took >= stage.timeout_seconds).then_some(stage),
            _ => {
                let by_wrapper = exit_code == Some(TIMEOUT_EXIT);
                let by_kill = exit_code == Some(KILLED_EXIT) && elapsed >= self.stage_budget();
                if by_wrapper || by_kill {
                    self.last_stage()
                } else {
                    None
                }
            }
        }
    }
}

/// Runs execution requests inside sandboxes
pub struct Orchestrator {
    policy: Arc<PolicyStore>,
    manager: Arc<EnvironmentManager>,
    releases: Arc<ReleaseQueue>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        policy: Arc<PolicyStore>,
        substrate: Arc<dyn IsolationSubstrate>,
        config: EngineConfig,
    ) -> Self {
        let manager = Arc::new(EnvironmentManager::new(substrate, config.clone()));
        let releases = Arc::new(ReleaseQueue::new(manager.clone()));
        Orchestrator {
            policy,
            manager,
            releases,
            config,
        }
    }

    /// Load the policy, connect to Docker and make sure the image is there.
    ///
    /// The policy fails closed unless the configuration opts into the
    /// restrictive fallback.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let policy = match config.policy_fallback {
            PolicyFallback::Refuse => PolicyStore::open(&config.policy_path)?,
            PolicyFallback::Restrictive => PolicyStore::open_or_restrictive(&config.policy_path),
        };

        let docker = DockerSubstrate::connect(CONNECT_PATIENCE).await?;
        if let Err(e) = docker.ensure_image(&config.image).await {
            warn!(image = %config.image, error = %e, "Sandbox image unavailable; executions will fail until it is");
        }

        Ok(Self::new(Arc::new(policy), Arc::new(docker), config.clone()))
    }

    pub fn manager(&self) -> &Arc<EnvironmentManager> {
        &self.manager
    }

    pub fn releases(&self) -> &Arc<ReleaseQueue> {
        &self.releases
    }

    pub fn policy_store(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    /// Whether the isolation substrate is reachable
    pub async fn is_available(&self) -> bool {
        match self.manager.substrate().ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(substrate = self.manager.substrate().name(), error = %e, "Isolation substrate unavailable");
                false
            }
        }
    }

    /// Release pending and tracked sandboxes now
    pub async fn shutdown(&self) {
        let flushed = self.releases.flush().await;
        let released = self.manager.release_all().await;
        info!(flushed, released, "Orchestrator shut down");
    }

    /// Run one request.
    ///
    /// Policy, validation, capacity and substrate problems are errors. A
    /// program that fails or times out is an `Ok` result with
    /// `success == false`.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let policy = self.policy.current().await;
        let plan = self.plan(&request, &policy).map_err(|e| {
            warn!(
                execution_id = %request.execution_id,
                project = %request.project_id,
                step = %request.step_id,
                error = %e,
                "Execution rejected"
            );
            e
        })?;

        let (work_dir, output_area) = self.prepare_files(&request, &plan).await?;
        let outcome = self
            .dispatch(&request, &plan, &policy, &work_dir, &output_area)
            .await;
        discard_output_area(&output_area).await;
        outcome
    }

    async fn dispatch(
        &self,
        request: &ExecutionRequest,
        plan: &Plan,
        policy: &SecurityPolicy,
        work_dir: &Path,
        output_area: &Path,
    ) -> Result<ExecutionResult> {
        let sandbox = self
            .manager
            .acquire(&request.project_id, &request.step_id, work_dir, output_area, policy)
            .await?;

        self.manager.mark(&sandbox.name, SandboxStatus::Executing);
        let argv = vec!["sh".to_string(), "-c".to_string(), plan.script()];
        debug!(sandbox = %sandbox.name, script = %argv[2], "Dispatching");

        let guard = plan.stage_budget() + self.config.dispatch_overhead;
        let started = Instant::now();
        let dispatched = tokio::time::timeout(
            guard,
            self.manager.substrate().run_in(&sandbox.name, &argv),
        )
        .await;
        let elapsed = started.elapsed();

        self.manager.mark(&sandbox.name, SandboxStatus::Running);
        self.releases.schedule(&sandbox.name, self.config.release_grace);

        let (captured, guard_fired) = match dispatched {
            Ok(Ok(output)) => (Some(output), false),
            Ok(Err(e)) => {
                error!(sandbox = %sandbox.name, execution_id = %request.execution_id, error = %e, "Dispatch failed");
                return Err(match e {
                    Error::Substrate(_) => e,
                    other => Error::Substrate(other.to_string()),
                });
            }
            Err(_) => {
                warn!(sandbox = %sandbox.name, guard_secs = guard.as_secs(), "Dispatch exceeded its time budget");
                (None, true)
            }
        };

        let mut result = self
            .collect(plan, policy, output_area, captured, guard_fired, elapsed)
            .await;
        result.execution_id = request.execution_id;
        result.sandbox_name = sandbox.name.clone();

        info!(
            execution_id = %request.execution_id,
            sandbox = %sandbox.name,
            project = %request.project_id,
            step = %request.step_id,
            success = result.success,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            execution_time_ms = result.execution_time_ms,
            output_limited = result.security_info.output_limited,
            "Execution complete"
        );

        Ok(result)
    }

    fn plan(&self, request: &ExecutionRequest, policy: &SecurityPolicy) -> Result<Plan> {
        ensure_safe_name("project id", &request.project_id)?;
        ensure_safe_name("step id", &request.step_id)?;
        let file_name = request.file_name()?;
        ensure_safe_name("file name", &file_name)?;

        let key = policy_key(&request.language);
        let template = policy.command_for(&key).ok_or_else(|| {
            Error::Validation(format!(
                "Language '{}' is not allowed by the security policy",
                request.language
            ))
        })?;

        validate_source(&request.code, policy)?;

        let project_dir = format!("{}/{}", PROJECTS_MOUNT, request.project_id);
        let build_dir = format!("{}/build", OUTPUT_MOUNT);
        let stem = file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&file_name)
            .to_string();

        let ctx = TemplateContext {
            source: format!("{}/{}", project_dir, file_name),
            file: file_name.clone(),
            stem,
            build: build_dir.clone(),
            step: request.step_id.clone(),
            project: request.project_id.clone(),
        };

        let limits = &policy.resource_limits;
        let mut stages = Vec::with_capacity(2);
        if let Some(compile) = template.compile() {
            stages.push(Stage {
                name: COMPILE_STAGE,
                command: compile.render(&ctx),
                timeout_seconds: limits.compile_timeout_seconds,
            });
        }
        stages.push(Stage {
            name: RUN_STAGE,
            command: template.run().render(&ctx),
            timeout_seconds: limits.execution_timeout_seconds,
        });

        for stage in &stages {
            validate_command(&stage.command, policy)?;
        }

        let work_dir = request
            .work_dir
            .clone()
            .unwrap_or_else(|| self.config.projects_dir.join(&request.project_id));
        let output_area = self.config.output_dir.join(format!(
            "{}_{}_{}",
            request.project_id,
            request.step_id,
            request.execution_id.simple()
        ));

        Ok(Plan {
            file_name,
            work_dir,
            output_area,
            project_dir,
            build_dir,
            stages,
            artifacts: ArtifactPaths::new(&request.project_id, &request.step_id),
        })
    }

    /// Write the code file and create this execution's output area.
    /// Returns both directories as absolute paths.
    async fn prepare_files(&self, request: &ExecutionRequest, plan: &Plan) -> Result<(PathBuf, PathBuf)> {
        tokio::fs::create_dir_all(&plan.work_dir).await?;
        tokio::fs::write(plan.work_dir.join(&plan.file_name), &request.code).await?;

        tokio::fs::create_dir_all(plan.output_area.join("build")).await?;
        plan.artifacts.clear(&plan.output_area).await?;

        let work_dir = tokio::fs::canonicalize(&plan.work_dir).await?;
        let output_area = tokio::fs::canonicalize(&plan.output_area).await?;
        Ok((work_dir, output_area))
    }

    async fn collect(
        &self,
        plan: &Plan,
        policy: &SecurityPolicy,
        output_area: &Path,
        captured: Option<RunOutput>,
        guard_fired: bool,
        elapsed: Duration,
    ) -> ExecutionResult {
        let (out_path, err_path, status_path) = plan.artifacts.on_host(output_area);
        let captured = captured.unwrap_or_default();

        let output = artifacts::read_artifact(&out_path)
            .await
            .unwrap_or(captured.stdout);
        let error = artifacts::read_artifact(&err_path)
            .await
            .unwrap_or(captured.stderr);
        let status = artifacts::read_status(&status_path).await;
        let exit_code = match &status {
            Some(status) => Some(status.exit_code),
            None => captured.exit_code,
        };

        let expired = plan.timed_out_stage(status.as_ref(), exit_code, guard_fired, elapsed);

        let limit = policy.resource_limits.output_byte_limit;
        let (output, output_limited) = artifacts::truncate(output, limit, OUTPUT_TRUNCATED);
        let (mut error, error_limited) = artifacts::truncate(error, limit, ERROR_TRUNCATED);

        if let Some(stage) = expired {
            if !error.is_empty() && !error.ends_with('\n') {
                error.push('\n');
            }
            error.push_str(&format!(
                "Execution timed out after {} seconds",
                stage.timeout_seconds
            ));
            if stage.name == COMPILE_STAGE {
                error.push_str(" (compile stage)");
            }
        }
        let timed_out = expired.is_some();

        let mut security_info = SecurityInfo::from_policy(policy);
        security_info.output_limited = output_limited;
        security_info.error_limited = error_limited;

        ExecutionResult {
            success: exit_code == Some(0) && !timed_out,
            output,
            error,
            exit_code,
            execution_time_ms: elapsed.as_millis() as u64,
            timed_out,
            execution_id: uuid::Uuid::nil(),
            sandbox_name: String::new(),
            security_info,
        }
    }
}

/// Delete an execution's output area once its artifacts are read
async fn discard_output_area(area: &Path) {
    match tokio::fs::remove_dir_all(area).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(area = %area.display(), error = %e, "Failed to remove output area"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::CommandTemplate;
    use crate::sandbox::mock::{MockRun, MockSubstrate};
    use crate::sandbox::Mount;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn engine(mock: &Arc<MockSubstrate>, root: &Path, max: usize) -> Orchestrator {
        engine_with(mock, root, max, SecurityPolicy::restrictive())
    }

    fn engine_with(
        mock: &Arc<MockSubstrate>,
        root: &Path,
        max: usize,
        policy: SecurityPolicy,
    ) -> Orchestrator {
        let config = EngineConfig {
            projects_dir: root.join("projects"),
            output_dir: root.join("output"),
            max_concurrency: max,
            ..Default::default()
        };
        Orchestrator::new(Arc::new(PolicyStore::from_policy(policy)), mock.clone(), config)
    }

    /// The one output area under `output_dir` while an execution runs
    fn output_area(output_dir: &Path) -> PathBuf {
        let mut areas: Vec<_> = std::fs::read_dir(output_dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(areas.len(), 1, "expected a single output area");
        areas.remove(0)
    }

    fn c_policy() -> SecurityPolicy {
        let mut policy = SecurityPolicy::restrictive();
        policy.allowed_commands.insert(
            "c".to_string(),
            CommandTemplate::two_stage("gcc -o {build}/{stem} {source}", "{build}/{stem}").unwrap(),
        );
        policy
    }

    #[tokio::test]
    async fn test_hello_world() {
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::with_script(|_, _| MockRun::exit(0, "Hello, World!\n")).shared();
        let engine = engine(&mock, dir.path(), 5);

        let request = ExecutionRequest::new("python", "print(\"Hello, World!\")", "p1", "1");
        let id = request.execution_id;
        let result = engine.execute(request).await.unwrap();

        assert!(result.success);
        assert!(result.output.contains("Hello, World!"));
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.timed_out);
        assert_eq!(result.execution_id, id);
        assert!(result.sandbox_name.starts_with("meu-exec-p1-1-"));

        let written = std::fs::read_to_string(dir.path().join("projects/p1/step_1.py")).unwrap();
        assert_eq!(written, "print(\"Hello, World!\")");

        // Release waits for the grace period
        assert_eq!(engine.releases().pending(), vec![result.sandbox_name.clone()]);
        engine.shutdown().await;
        assert!(mock.live().is_empty());
    }

    #[tokio::test]
    async fn test_dispatched_script() {
        let dir = tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let mock = MockSubstrate::with_script(move |_, argv| {
            *record.lock().unwrap() = argv.to_vec();
            MockRun::exit(0, "")
        })
        .shared();
        let engine = engine(&mock, dir.path(), 5);

        engine
            .execute(ExecutionRequest::new("py", "print(1)", "p1", "2"))
            .await
            .unwrap();

        let argv = seen.lock().unwrap().clone();
        assert_eq!(argv[..2], ["sh".to_string(), "-c".to_string()]);
        let script = &argv[2];
        assert!(script.contains("cd /workspace/projects/p1 || exit 125"));
        assert!(script.contains(
            "timeout --kill-after=2s 10s python3 /workspace/projects/p1/step_2.py >> /workspace/output/p1_2_output.txt 2>> /workspace/output/p1_2_error.txt"
        ));
        assert!(script.contains("stage=run; start=$(date +%s)"));
        assert!(script.contains("> /workspace/output/p1_2_status.json"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_stage_compile_then_run() {
        let dir = tempdir().unwrap();
        let output_dir = dir.path().join("output");
        let seen = Arc::new(Mutex::new((String::new(), false)));
        let record = seen.clone();
        let mock = MockSubstrate::with_script(move |_, argv| {
            let build_ready = output_area(&output_dir).join("build").is_dir();
            *record.lock().unwrap() = (argv[2].clone(), build_ready);
            MockRun::exit(0, "")
        })
        .shared();
        let engine = engine_with(&mock, dir.path(), 5, c_policy());

        engine
            .execute(ExecutionRequest::new("c", "int main(){return 0;}", "p1", "4"))
            .await
            .unwrap();

        let (script, build_ready) = seen.lock().unwrap().clone();
        let compile = script
            .find("stage=compile; start=$(date +%s); timeout --kill-after=2s 30s gcc -o /workspace/output/build/step_4 /workspace/projects/p1/step_4.c")
            .unwrap();
        let run = script
            .find("stage=run; start=$(date +%s); timeout --kill-after=2s 10s /workspace/output/build/step_4")
            .unwrap();
        assert!(compile < run);
        assert!(build_ready);
        // The area goes away once the artifacts are read
        assert_eq!(std::fs::read_dir(dir.path().join("output")).unwrap().count(), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_blocked_source_creates_no_sandbox() {
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::new().shared();
        let engine = engine(&mock, dir.path(), 5);

        let request = ExecutionRequest::new(
            "python",
            "import os\nos.system('rm -rf /')",
            "p1",
            "1",
        );
        let err = engine.execute(request).await.unwrap_err();

        assert!(matches!(err, Error::BlockedCommand(ref s) if s == "rm -rf"));
        assert!(err.is_security_rejection());
        assert!(mock.calls().is_empty());
        assert!(!dir.path().join("projects/p1").exists());
    }

    #[tokio::test]
    async fn test_blocked_template_never_dispatched() {
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::new().shared();
        let mut policy = SecurityPolicy::restrictive();
        policy.allowed_commands.insert(
            "bash".to_string(),
            CommandTemplate::single("bash {source} && shutdown").unwrap(),
        );
        let engine = engine_with(&mock, dir.path(), 5, policy);

        let err = engine
            .execute(ExecutionRequest::new("sh", "echo hi", "p1", "1"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::BlockedCommand(_)));
        assert_eq!(mock.count("run"), 0);
        assert_eq!(mock.count("create"), 0);
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::new().shared();
        let engine = engine(&mock, dir.path(), 5);

        let unsafe_file = ExecutionRequest::new("python", "print(1)", "p1", "1").with_file_name("x;y.py");
        assert!(matches!(engine.execute(unsafe_file).await, Err(Error::Validation(_))));

        let traversal = ExecutionRequest::new("python", "print(1)", "../p", "1");
        assert!(matches!(engine.execute(traversal).await, Err(Error::Validation(_))));

        let unknown = ExecutionRequest::new("cobol", "DISPLAY 'HI'.", "p1", "1").with_file_name("a.cob");
        assert!(matches!(engine.execute(unknown).await, Err(Error::Validation(_))));

        // Ids Docker would refuse in a sandbox name or bind target
        for id in ["x:y", "a'b", "проект"] {
            let err = engine
                .execute(ExecutionRequest::new("python", "print(1)", id, "1"))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{} should be rejected", id);
            assert!(!err.is_retryable());
        }

        assert!(mock.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_program_times_out_and_is_released() {
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::with_script(|_, _| MockRun::Hang).shared();
        let engine = engine(&mock, dir.path(), 5);

        let started = Instant::now();
        let result = engine
            .execute(ExecutionRequest::new("python", "while True: pass", "p1", "1"))
            .await
            .unwrap();

        // 10s run budget + 2s kill window + 10s dispatch overhead
        assert!(started.elapsed() <= Duration::from_secs(23));
        assert!(result.timed_out);
        assert!(!result.success);
        assert_eq!(result.exit_code, None);
        assert!(result.error.contains("timed out after 10 seconds"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(mock.live().is_empty());
        assert_eq!(engine.manager().tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_exit_status() {
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::with_script(|_, _| MockRun::exit(124, "partial")).shared();
        let engine = engine(&mock, dir.path(), 5);

        let result = engine
            .execute(ExecutionRequest::new("python", "import time\ntime.sleep(99)", "p1", "1"))
            .await
            .unwrap();

        assert!(result.timed_out);
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(124));
        assert_eq!(result.output, "partial");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_artifacts_take_precedence() {
        let dir = tempdir().unwrap();
        let output_dir = dir.path().join("output");
        let mock = MockSubstrate::with_script(move |_, _| {
            let area = output_area(&output_dir);
            std::fs::write(area.join("p1_1_output.txt"), "from artifact").unwrap();
            std::fs::write(area.join("p1_1_status.json"), "{\"exitCode\":3}").unwrap();
            MockRun::Output(RunOutput {
                exit_code: Some(0),
                stdout: "from stream".to_string(),
                stderr: "stream error".to_string(),
            })
        })
        .shared();
        let engine = engine(&mock, dir.path(), 5);

        let result = engine
            .execute(ExecutionRequest::new("python", "exit(3)", "p1", "1"))
            .await
            .unwrap();

        assert_eq!(result.output, "from artifact");
        // No error artifact: fall back to the captured stream
        assert_eq!(result.error, "stream error");
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.success);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_artifacts_cleared() {
        let dir = tempdir().unwrap();
        let request = ExecutionRequest::new("python", "print('ok')", "p1", "1");
        // Leftover of an earlier attempt that reused the execution id
        let area = dir
            .path()
            .join("output")
            .join(format!("p1_1_{}", request.execution_id.simple()));
        std::fs::create_dir_all(&area).unwrap();
        std::fs::write(area.join("p1_1_status.json"), "{\"exitCode\":1}").unwrap();

        let mock = MockSubstrate::with_script(|_, _| MockRun::exit(0, "ok")).shared();
        let engine = engine(&mock, dir.path(), 5);

        let result = engine.execute(request).await.unwrap();
        assert!(result.success);
        assert!(!area.exists());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_output_truncation() {
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::with_script(|_, _| MockRun::exit(0, &"x".repeat(20_000))).shared();
        let engine = engine(&mock, dir.path(), 5);

        let result = engine
            .execute(ExecutionRequest::new("python", "print('x' * 20000)", "p1", "1"))
            .await
            .unwrap();

        assert_eq!(result.output.len(), 10 * 1024 + OUTPUT_TRUNCATED.len());
        assert!(result.output.ends_with(OUTPUT_TRUNCATED));
        assert!(result.security_info.output_limited);
        assert!(!result.security_info.error_limited);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_output_not_limited() {
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::new().shared();
        let engine = engine(&mock, dir.path(), 5);

        let result = engine
            .execute(ExecutionRequest::new("python", "pass", "p1", "1"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output, "");
        assert!(!result.security_info.output_limited);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_over_capacity_rejected() {
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::with_script(|_, _| MockRun::exit(0, "done")).shared();
        mock.delay_create(Duration::from_millis(20));
        let engine = engine(&mock, dir.path(), 2);

        let requests = (1..=3).map(|step| {
            engine.execute(ExecutionRequest::new("python", "print('done')", "p1", step.to_string()))
        });
        let results = futures::future::join_all(requests).await;

        let capacity = results
            .iter()
            .filter(|r| matches!(r, Err(Error::Capacity { .. })))
            .count();
        assert_eq!(capacity, 1);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        assert!(engine.manager().tracked_count() <= 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_failure_still_releases() {
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::with_script(|_, _| MockRun::Fail("daemon went away".to_string())).shared();
        let engine = engine(&mock, dir.path(), 5);

        let err = engine
            .execute(ExecutionRequest::new("python", "print(1)", "p1", "1"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Substrate(_)));
        assert_eq!(engine.releases().pending().len(), 1);
        engine.shutdown().await;
        assert!(mock.live().is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_is_substrate_error() {
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::new().shared();
        mock.fail_create(true);
        let engine = engine(&mock, dir.path(), 5);

        let err = engine
            .execute(ExecutionRequest::new("python", "print(1)", "p1", "1"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Substrate(_)));
        assert!(err.is_retryable());
        assert_eq!(engine.manager().tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_is_available() {
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::new().shared();
        let engine = engine(&mock, dir.path(), 5);
        assert!(engine.is_available().await);
    }

    #[tokio::test]
    async fn test_executions_get_private_output_areas() {
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::with_script(|_, _| MockRun::exit(0, "ok")).shared();
        let engine = engine(&mock, dir.path(), 10);

        let requests = [("alice", "1"), ("bob", "1"), ("p", "1"), ("p", "1")]
            .map(|(project, step)| ExecutionRequest::new("python", "print('ok')", project, step));
        let results = futures::future::join_all(requests.into_iter().map(|r| engine.execute(r))).await;

        let output_root = std::fs::canonicalize(dir.path().join("output")).unwrap();
        let mut areas = Vec::new();
        for result in results {
            let spec = mock.spec_of(&result.unwrap().sandbox_name).unwrap();
            let writable: Vec<_> = spec.mounts.iter().filter(|m| !m.read_only).collect();
            assert_eq!(writable.len(), 1);
            assert!(writable[0].source.is_absolute());
            assert_ne!(writable[0].source, output_root);
            assert!(writable[0].source.starts_with(&output_root));
            areas.push(writable[0].source.clone());
        }

        for (i, a) in areas.iter().enumerate() {
            for b in &areas[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(std::fs::read_dir(&output_root).unwrap().count(), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_relative_output_dir_is_made_absolute() {
        let relative = PathBuf::from(format!("meu-sandbox-test-{}", uuid::Uuid::new_v4().simple()));
        let dir = tempdir().unwrap();
        let mock = MockSubstrate::with_script(|_, _| MockRun::exit(0, "ok")).shared();
        let config = EngineConfig {
            projects_dir: dir.path().join("projects"),
            output_dir: relative.clone(),
            ..Default::default()
        };
        let engine = Orchestrator::new(
            Arc::new(PolicyStore::from_policy(SecurityPolicy::restrictive())),
            mock.clone(),
            config,
        );

        let result = engine
            .execute(ExecutionRequest::new("python", "print('ok')", "p1", "1"))
            .await
            .unwrap();
        let spec = mock.spec_of(&result.sandbox_name).unwrap();
        let _ = std::fs::remove_dir_all(&relative);

        assert!(result.success);
        assert!(spec.mounts.iter().all(|m| m.source.is_absolute()));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_custom_work_dir() {
        let dir = tempdir().unwrap();
        let custom = dir.path().join("elsewhere/checkout");
        let mock = MockSubstrate::with_script(|_, _| MockRun::exit(0, "ok")).shared();
        let engine = engine(&mock, dir.path(), 5);

        let request = ExecutionRequest::new("python", "print('ok')", "p1", "1").with_work_dir(custom.clone());
        let result = engine.execute(request).await.unwrap();

        assert_eq!(std::fs::read_to_string(custom.join("step_1.py")).unwrap(), "print('ok')");
        assert!(!dir.path().join("projects/p1").exists());

        let spec = mock.spec_of(&result.sandbox_name).unwrap();
        assert_eq!(
            spec.mounts[0],
            Mount::read_only(std::fs::canonicalize(&custom).unwrap(), "/workspace/projects/p1")
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_program_exiting_124_is_not_a_timeout() {
        let dir = tempdir().unwrap();
        let output_dir = dir.path().join("output");
        let mock = MockSubstrate::with_script(move |_, _| {
            let area = output_area(&output_dir);
            std::fs::write(
                area.join("p1_1_status.json"),
                r#"{"exitCode":124,"stage":"run","stageSeconds":0}"#,
            )
            .unwrap();
            MockRun::exit(124, "")
        })
        .shared();
        let engine = engine(&mock, dir.path(), 5);

        let result = engine
            .execute(ExecutionRequest::new("python", "import sys\nsys.exit(124)", "p1", "1"))
            .await
            .unwrap();

        assert!(!result.timed_out);
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(124));
        assert!(!result.error.contains("timed out"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_compile_timeout_names_compile_budget() {
        let dir = tempdir().unwrap();
        let output_dir = dir.path().join("output");
        let mock = MockSubstrate::with_script(move |_, _| {
            let area = output_area(&output_dir);
            std::fs::write(
                area.join("p1_1_status.json"),
                r#"{"exitCode":124,"stage":"compile","stageSeconds":30}"#,
            )
            .unwrap();
            MockRun::exit(124, "")
        })
        .shared();
        let engine = engine_with(&mock, dir.path(), 5, c_policy());

        let result = engine
            .execute(ExecutionRequest::new("c", "int main(){for(;;);}", "p1", "1"))
            .await
            .unwrap();

        assert!(result.timed_out);
        assert!(result
            .error
            .ends_with("Execution timed out after 30 seconds (compile stage)"));
        engine.shutdown().await;
    }

    #[test]
    fn test_script_quotes_paths() {
        let plan = Plan {
            file_name: "main.py".to_string(),
            work_dir: PathBuf::from("/srv/projects/p"),
            output_area: PathBuf::from("/srv/output/p_1_0"),
            project_dir: "/workspace/projects/it's here".to_string(),
            build_dir: "/workspace/output/build".to_string(),
            stages: vec![Stage {
                name: RUN_STAGE,
                command: "python3 main.py".to_string(),
                timeout_seconds: 10,
            }],
            artifacts: ArtifactPaths::new("p", "1"),
        };

        let script = plan.script();
        assert!(script.starts_with("cd '/workspace/projects/it'\\''s here' || exit 125\n"));
        assert!(script.contains("mkdir -p /workspace/output/build && "));
        assert!(script.ends_with("> /workspace/output/p_1_status.json\nexit \"$code\""));
    }
}
