//! meu-sandbox CLI
//!
//! Command-line interface for running code, serving requests, and managing
//! the security policy and stale sandboxes.

use clap::{Parser, Subcommand};
use console::style;
use meu_sandbox::config::{self, Config, LoggingConfig, PolicyFallback};
use meu_sandbox::executor::{ExecutionRequest, ExecutionResult, Orchestrator};
use meu_sandbox::policy::{load_policy, validate_policy, PolicyStore, SecurityPolicy};
use meu_sandbox::reaper::Reaper;
use meu_sandbox::sandbox::{DockerSubstrate, EnvironmentManager, IsolationSubstrate};
use meu_sandbox::{Error, Result, VERSION};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long one-shot commands wait for the Docker daemon
const STATUS_PATIENCE: Duration = Duration::from_secs(5);

const SAMPLE_CONFIG: &str = include_str!("../../files/config.json");
const SAMPLE_POLICY: &str = include_str!("../../files/security-policy.json");

#[derive(Parser)]
#[command(
    name = "meu-sandbox",
    version = VERSION,
    about = "meu-sandbox - Sandboxed execution engine for generated code",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute code in a sandbox
    Run {
        /// Programming language
        language: String,
        /// Read the code from this file
        #[arg(long, short, conflicts_with = "code")]
        file: Option<PathBuf>,
        /// Code to execute (stdin if neither --code nor --file is given)
        #[arg(long, short)]
        code: Option<String>,
        /// Project id
        #[arg(long, short, default_value = "cli")]
        project: String,
        /// Step id
        #[arg(long, short, default_value = "1")]
        step: String,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute JSON-lines requests from stdin, one result per stdout line
    Serve,

    /// Check policy, Docker and live sandboxes
    Status,

    /// Run one reaper sweep
    Reap,

    /// Inspect the security policy
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Print a sample configuration
    InitConfig {
        /// Print the sample security policy instead
        #[arg(long)]
        policy: bool,
        /// Write both samples to the config directory instead of printing
        #[arg(long)]
        write: bool,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Validate a policy file (defaults to the configured one)
    Check {
        path: Option<PathBuf>,
    },
    /// Print the policy the engine would run under
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Run {
            language,
            file,
            code,
            project,
            step,
            json,
        } => run_code(&config, &language, file, code, project, step, json).await,
        Commands::Serve => serve(&config).await,
        Commands::Status => check_status(&config).await,
        Commands::Reap => reap_once(&config).await,
        Commands::Policy { action } => match action {
            PolicyAction::Check { path } => {
                check_policy(path.as_deref().unwrap_or(config.engine.policy_path.as_path()))
            }
            PolicyAction::Show => show_policy(&config).await,
        },
        Commands::InitConfig { policy, write } => init_config(policy, write),
    }
}

/// Logs go to stderr so `serve` keeps stdout for results
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Run code in a sandbox
async fn run_code(
    config: &Config,
    language: &str,
    file: Option<PathBuf>,
    code: Option<String>,
    project: String,
    step: String,
    as_json: bool,
) -> Result<()> {
    let code = match (code, file) {
        (Some(code), _) => code,
        (None, Some(path)) => tokio::fs::read_to_string(&path).await?,
        (None, None) => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };

    let orchestrator = Orchestrator::connect(&config.engine).await?;
    let request = ExecutionRequest::new(language, code, project, step);

    if !as_json {
        println!("Executing {} code...\n", language);
    }
    let outcome = orchestrator.execute(request).await;
    orchestrator.shutdown().await;

    let result = match outcome {
        Ok(result) => result,
        Err(e) if e.is_security_rejection() => {
            println!("{} Rejected: {}", style("🛑").red(), e);
            std::process::exit(2);
        }
        Err(e) => return Err(e),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_result(result: &ExecutionResult) {
    if !result.output.is_empty() {
        println!("Output:\n{}", result.output);
    }
    if result.timed_out {
        println!("{} Execution timed out", style("❌").red());
    } else if !result.success {
        println!(
            "{} Execution failed (exit code {}):\n{}",
            style("❌").red(),
            result
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string()),
            result.error
        );
    }
    if result.security_info.output_limited || result.security_info.error_limited {
        println!("{}", style("Output was truncated").yellow());
    }

    println!(
        "\nTime: {}ms  Sandbox: {}",
        result.execution_time_ms,
        style(&result.sandbox_name).dim()
    );
}

/// JSON-lines server: one `ExecutionRequest` per stdin line, one response per
/// stdout line. Requests run concurrently; responses carry the execution id.
async fn serve(config: &Config) -> Result<()> {
    let orchestrator = Arc::new(Orchestrator::connect(&config.engine).await?);

    let _reaper = if config.reaper.enabled {
        let reaper = Reaper::new(orchestrator.manager().clone(), config.reaper.clone());
        Some(Arc::new(reaper).spawn())
    } else {
        warn!("Reaper disabled; leaked sandboxes will not be collected");
        None
    };

    #[cfg(unix)]
    let _reload = reload_on_hangup(orchestrator.policy_store().clone())?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    info!("Serving execution requests on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }

                let request: ExecutionRequest = match serde_json::from_str(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        let _ = tx.send(error_line(None, &Error::from(e)));
                        continue;
                    }
                };

                let orchestrator = orchestrator.clone();
                let tx = tx.clone();
                in_flight.spawn(async move {
                    let id = request.execution_id;
                    let line = match orchestrator.execute(request).await {
                        Ok(result) => json!({ "executionId": id, "result": result }).to_string(),
                        Err(e) => error_line(Some(id), &e),
                    };
                    let _ = tx.send(line);
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    while in_flight.join_next().await.is_some() {}
    drop(tx);
    let _ = writer.await;

    orchestrator.shutdown().await;
    Ok(())
}

fn error_line(id: Option<uuid::Uuid>, e: &Error) -> String {
    json!({
        "executionId": id,
        "error": {
            "kind": e.kind(),
            "message": e.to_string(),
            "retryable": e.is_retryable(),
        }
    })
    .to_string()
}

/// Reload the policy on SIGHUP
#[cfg(unix)]
fn reload_on_hangup(store: Arc<PolicyStore>) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            if let Err(e) = store.reload().await {
                error!("Policy reload failed: {}", e);
            }
        }
    }))
}

// ============================================================================
// Status and maintenance
// ============================================================================

/// Check status of policy, Docker and sandboxes
async fn check_status(config: &Config) -> Result<()> {
    println!("🔍 meu-sandbox Status\n");

    let report = config::validate_config(config);
    if report.valid {
        println!("Configuration: ✅ Valid");
    } else {
        println!("Configuration: ❌ {}", report.error_summary());
    }
    for warning in &report.warnings {
        println!("  ⚠️  {}", warning);
    }
    println!("  Image: {}", config.engine.image);
    println!("  Max concurrency: {}", config.engine.max_concurrency);

    match load_policy(&config.engine.policy_path) {
        Ok(policy) => println!(
            "Policy: ✅ {} ({})",
            config.engine.policy_path.display(),
            policy.languages().join(", ")
        ),
        Err(e) => match config.engine.policy_fallback {
            PolicyFallback::Refuse => println!("Policy: ❌ {} (engine will refuse to start)", e),
            PolicyFallback::Restrictive => {
                println!("Policy: ⚠️  {} (restrictive fallback in use)", e)
            }
        },
    }

    let docker = match DockerSubstrate::connect(STATUS_PATIENCE).await {
        Ok(docker) => {
            println!("Docker: ✅ Connected");
            docker
        }
        Err(e) => {
            println!("Docker: ❌ {}", e);
            return Ok(());
        }
    };

    match docker.usage().await {
        Ok(Some(usage)) => println!(
            "  Disk: {} images, {} containers, {} volumes, {} MiB of layers",
            usage.images,
            usage.containers,
            usage.volumes,
            usage.layers_size / (1024 * 1024)
        ),
        Ok(None) => {}
        Err(e) => println!("  Disk: ⚠️  {}", e),
    }

    let prefix = format!("{}-", config.engine.container_prefix);
    let sandboxes = docker.list(&prefix).await?;
    println!("Sandboxes: {}", sandboxes.len());
    let now = chrono::Utc::now();
    for sandbox in sandboxes {
        let age = (now - sandbox.created_at).num_seconds().max(0);
        println!(
            "  {} {} ({}s old)",
            style(&sandbox.name).cyan(),
            sandbox.state,
            age
        );
        if sandbox.state != "running" {
            continue;
        }
        match docker.stats(&sandbox.name).await {
            Ok(Some(stats)) => println!(
                "    cpu {:.1}%  mem {} / {} MiB ({:.1}%)  pids {}",
                stats.cpu_percent,
                stats.memory_usage / (1024 * 1024),
                stats.memory_limit / (1024 * 1024),
                stats.memory_percent,
                stats.pids
            ),
            Ok(None) => {}
            Err(e) => warn!(sandbox = %sandbox.name, error = %e, "Sandbox stats unavailable"),
        }
    }

    Ok(())
}

/// Run a single reaper sweep
async fn reap_once(config: &Config) -> Result<()> {
    let docker = DockerSubstrate::connect(STATUS_PATIENCE).await?;
    let manager = Arc::new(EnvironmentManager::new(Arc::new(docker), config.engine.clone()));
    let reaper = Reaper::new(manager, config.reaper.clone());

    let report = reaper.sweep().await?;
    println!(
        "Examined {} sandboxes, removed {}, failed {}",
        report.examined,
        report.removed.len(),
        report.failed.len()
    );
    for name in &report.removed {
        println!("  {} {}", style("removed").green(), name);
    }
    for name in &report.failed {
        println!("  {} {}", style("failed").red(), name);
    }
    Ok(())
}

// ============================================================================
// Policy and configuration
// ============================================================================

fn check_policy(path: &Path) -> Result<()> {
    match load_policy(path) {
        Ok(policy) => {
            println!("{} {} is valid", style("✅").green(), path.display());
            println!("  Languages: {}", policy.languages().join(", "));
            for warning in validate_policy(&policy).warnings {
                println!("  ⚠️  {}", warning);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} {}", style("❌").red(), e);
            std::process::exit(1);
        }
    }
}

async fn show_policy(config: &Config) -> Result<()> {
    let policy: Arc<SecurityPolicy> = match config.engine.policy_fallback {
        PolicyFallback::Refuse => Arc::new(load_policy(&config.engine.policy_path)?),
        PolicyFallback::Restrictive => {
            PolicyStore::open_or_restrictive(&config.engine.policy_path)
                .current()
                .await
        }
    };
    println!("{}", serde_json::to_string_pretty(policy.as_ref())?);
    Ok(())
}

/// Generate sample configuration
fn init_config(policy: bool, write: bool) -> Result<()> {
    if write {
        let config_path = config::config_path();
        let policy_path = config::policy_path();
        for path in [&config_path, &policy_path] {
            if path.exists() {
                return Err(Error::Config(format!(
                    "{} already exists; remove it first",
                    path.display()
                )));
            }
        }

        config::save_config(&Config::default(), &config_path)?;
        if let Some(parent) = policy_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&policy_path, SAMPLE_POLICY)?;

        println!("Wrote {}", config_path.display());
        println!("Wrote {}", policy_path.display());
        return Ok(());
    }

    println!("{}", if policy { SAMPLE_POLICY } else { SAMPLE_CONFIG });
    Ok(())
}
