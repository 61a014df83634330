//! Security policy
//!
//! The declarative policy every sandbox runs under: resource limits,
//! capability and filesystem restrictions, network mode, per-language command
//! templates and blocked command substrings.
//!
//! - template.rs: Per-language command templates
//! - store.rs: Loading, fail-closed opening and hot reload
//! - validation.rs: Structural validation

mod store;
mod template;
mod validation;

pub use store::{load_policy, parse_policy, PolicyStore};
pub use template::{shell_quote, CommandTemplate, Placeholder, Template, TemplateContext};
pub use validation::validate_policy;

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The complete security policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    /// Resource ceilings
    pub resource_limits: ResourceLimits,
    /// Capability and filesystem restrictions
    #[serde(default)]
    pub security_options: SecurityOptions,
    /// Network isolation
    #[serde(default)]
    pub network_policy: NetworkPolicy,
    /// Language name -> command template
    pub allowed_commands: BTreeMap<String, CommandTemplate>,
    /// Commands containing any of these are never dispatched
    #[serde(default, alias = "blockedCommands")]
    pub blocked_command_substrings: BTreeSet<String>,
}

impl SecurityPolicy {
    /// Built-in policy with the tightest limits.
    ///
    /// No network, every capability dropped and none added. Only used when a
    /// caller explicitly asks for it; a policy that fails to load never
    /// silently turns into this one.
    pub fn restrictive() -> Self {
        let allowed_commands: BTreeMap<_, _> = [
            ("python", "python3 {source}"),
            ("javascript", "node {source}"),
        ]
        .into_iter()
        .filter_map(|(language, run)| {
            CommandTemplate::single(run)
                .ok()
                .map(|template| (language.to_string(), template))
        })
        .collect();

        let mut tmpfs = BTreeMap::new();
        tmpfs.insert("/tmp".to_string(), "noexec,nosuid,size=16m".to_string());

        SecurityPolicy {
            resource_limits: ResourceLimits {
                memory: "128m".to_string(),
                cpu_share: 0.25,
                pid_limit: 32,
                execution_timeout_seconds: 10,
                output_byte_limit: 10 * 1024,
                compile_timeout_seconds: 30,
                sandbox_lifetime_seconds: Some(600),
                artifact_byte_limit: 1024 * 1024,
                open_files: OpenFiles { soft: 256, hard: 512 },
            },
            security_options: SecurityOptions {
                read_only_root_filesystem: true,
                no_new_privileges: true,
                dropped_capabilities: ["ALL".to_string()].into_iter().collect(),
                added_capabilities: BTreeSet::new(),
                tmpfs,
            },
            network_policy: NetworkPolicy {
                mode: NetworkMode::None,
            },
            allowed_commands,
            blocked_command_substrings: default_blocked_substrings(),
        }
    }

    /// Template for a language, matched case-insensitively
    pub fn command_for(&self, language: &str) -> Option<&CommandTemplate> {
        self.allowed_commands.get(&language.to_lowercase())
    }

    /// Languages this policy can run
    pub fn languages(&self) -> Vec<&str> {
        self.allowed_commands.keys().map(|k| k.as_str()).collect()
    }
}

fn default_blocked_substrings() -> BTreeSet<String> {
    [
        "rm -rf",
        "mkfs",
        "dd if=",
        ":(){",
        "shutdown",
        "reboot",
        "/etc/shadow",
        "chmod 777 /",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Resource ceilings applied to every sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Memory ceiling, e.g. "256m"
    pub memory: String,
    /// Fractional CPU cores
    #[serde(alias = "cpus", deserialize_with = "number_or_string")]
    pub cpu_share: f64,
    /// Maximum process count
    #[serde(alias = "pids")]
    pub pid_limit: u32,
    /// Hard timeout of the run stage
    #[serde(alias = "executionTimeout")]
    pub execution_timeout_seconds: u64,
    /// Output and error are each truncated to this many bytes
    #[serde(alias = "outputLimit")]
    pub output_byte_limit: usize,
    /// Hard timeout of the compile stage
    #[serde(default = "default_compile_timeout", alias = "compileTimeout")]
    pub compile_timeout_seconds: u64,
    /// Idle lifetime ceiling of a sandbox; defaults to 60x the execution timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_lifetime_seconds: Option<u64>,
    /// Largest file a sandboxed process may write
    #[serde(default = "default_artifact_limit")]
    pub artifact_byte_limit: u64,
    /// Open file descriptor ulimit
    #[serde(default)]
    pub open_files: OpenFiles,
}

impl ResourceLimits {
    /// Seconds a sandbox may live before its main process exits on its own
    pub fn sandbox_lifetime(&self) -> u64 {
        self.sandbox_lifetime_seconds
            .unwrap_or(self.execution_timeout_seconds.saturating_mul(60))
    }

    /// Memory ceiling in bytes, if the memory string parses
    pub fn memory_bytes(&self) -> Option<i64> {
        parse_memory_limit(&self.memory)
    }
}

fn default_compile_timeout() -> u64 {
    60
}

fn default_artifact_limit() -> u64 {
    10 * 1024 * 1024
}

/// `nofile` ulimit
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OpenFiles {
    pub soft: u64,
    pub hard: u64,
}

impl Default for OpenFiles {
    fn default() -> Self {
        OpenFiles {
            soft: 1024,
            hard: 2048,
        }
    }
}

/// Capability and filesystem restrictions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityOptions {
    /// Mount the root filesystem read-only
    #[serde(default = "default_true", alias = "readOnly")]
    pub read_only_root_filesystem: bool,
    /// Forbid privilege escalation through setuid binaries
    #[serde(default = "default_true")]
    pub no_new_privileges: bool,
    /// Capabilities removed from the sandbox
    #[serde(default = "default_dropped", alias = "dropCapabilities")]
    pub dropped_capabilities: BTreeSet<String>,
    /// Capabilities granted back, kept minimal
    #[serde(default, alias = "addCapabilities")]
    pub added_capabilities: BTreeSet<String>,
    /// Size-bounded writable scratch mounts: path -> mount options
    #[serde(default = "default_tmpfs")]
    pub tmpfs: BTreeMap<String, String>,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        SecurityOptions {
            read_only_root_filesystem: true,
            no_new_privileges: true,
            dropped_capabilities: default_dropped(),
            added_capabilities: BTreeSet::new(),
            tmpfs: default_tmpfs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_dropped() -> BTreeSet<String> {
    ["ALL".to_string()].into_iter().collect()
}

fn default_tmpfs() -> BTreeMap<String, String> {
    let mut tmpfs = BTreeMap::new();
    tmpfs.insert("/tmp".to_string(), "noexec,nosuid,size=100m".to_string());
    tmpfs.insert("/var/tmp".to_string(), "noexec,nosuid,size=50m".to_string());
    tmpfs
}

/// Network isolation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkPolicy {
    #[serde(default, alias = "networkMode")]
    pub mode: NetworkMode,
}

/// Network mode of a sandbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network at all
    #[default]
    None,
    /// Default bridge network
    Bridge,
    /// Host network stack
    Host,
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::None => write!(f, "none"),
            NetworkMode::Bridge => write!(f, "bridge"),
            NetworkMode::Host => write!(f, "host"),
        }
    }
}

/// Accept `0.5` or `"0.5"`
fn number_or_string<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Number(f64),
        Text(String),
    }

    match Lenient::deserialize(deserializer)? {
        Lenient::Number(n) => Ok(n),
        Lenient::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid number: {}", s))),
    }
}

/// Parse a memory limit string (e.g., "512m", "1g") to bytes
pub fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if let Some(n) = limit.strip_suffix("gb").or_else(|| limit.strip_suffix('g')) {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = limit.strip_suffix("mb").or_else(|| limit.strip_suffix('m')) {
        (n, 1024 * 1024)
    } else if let Some(n) = limit.strip_suffix("kb").or_else(|| limit.strip_suffix('k')) {
        (n, 1024)
    } else {
        (limit.strip_suffix('b').unwrap_or(&limit), 1)
    };

    let num: i64 = num_str.parse().ok()?;
    num.checked_mul(multiplier)
}
