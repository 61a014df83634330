//! Request and result types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::policy::SecurityPolicy;

/// Languages with a known file convention.
///
/// The policy decides what can actually run; this only normalizes aliases
/// and picks default file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Java,
    Go,
    Cpp,
    C,
    Rust,
    Bash,
}

impl std::str::FromStr for Language {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" | "python3" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::JavaScript),
            "typescript" | "ts" => Ok(Language::TypeScript),
            "java" => Ok(Language::Java),
            "go" | "golang" => Ok(Language::Go),
            "cpp" | "c++" | "cxx" => Ok(Language::Cpp),
            "c" => Ok(Language::C),
            "rust" | "rs" => Ok(Language::Rust),
            "bash" | "sh" | "shell" => Ok(Language::Bash),
            _ => Err(crate::Error::Validation(format!(
                "Unsupported language: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::JavaScript => write!(f, "javascript"),
            Language::TypeScript => write!(f, "typescript"),
            Language::Java => write!(f, "java"),
            Language::Go => write!(f, "go"),
            Language::Cpp => write!(f, "cpp"),
            Language::C => write!(f, "c"),
            Language::Rust => write!(f, "rust"),
            Language::Bash => write!(f, "bash"),
        }
    }
}

impl Language {
    /// Source file extension
    pub fn extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::JavaScript => "js",
            Language::TypeScript => "ts",
            Language::Java => "java",
            Language::Go => "go",
            Language::Cpp => "cpp",
            Language::C => "c",
            Language::Rust => "rs",
            Language::Bash => "sh",
        }
    }

    /// File name used when the caller does not pick one.
    ///
    /// Java needs the file to match its public class.
    pub fn default_file_name(&self, step_id: &str) -> String {
        match self {
            Language::Java => "Main.java".to_string(),
            other => format!("step_{}.{}", step_id, other.extension()),
        }
    }
}

/// Policy key for a requested language: known aliases are normalized,
/// anything else is looked up lowercased as written
pub fn policy_key(language: &str) -> String {
    match language.parse::<Language>() {
        Ok(known) => known.to_string(),
        Err(_) => language.trim().to_lowercase(),
    }
}

/// One code execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Language name or alias; must map to an allowed policy command
    pub language: String,
    /// Source text
    pub code: String,
    pub project_id: String,
    pub step_id: String,
    /// Host directory for the code file; defaults to `<projectsDir>/<projectId>`
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Defaults to the language's conventional file name
    #[serde(default)]
    pub code_file_name: Option<String>,
    /// Correlates logs and results
    #[serde(default = "Uuid::new_v4")]
    pub execution_id: Uuid,
}

impl ExecutionRequest {
    pub fn new(
        language: impl Into<String>,
        code: impl Into<String>,
        project_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        ExecutionRequest {
            language: language.into(),
            code: code.into(),
            project_id: project_id.into(),
            step_id: step_id.into(),
            work_dir: None,
            code_file_name: None,
            execution_id: Uuid::new_v4(),
        }
    }

    /// Set the work directory
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Set the code file name
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.code_file_name = Some(name.into());
        self
    }

    /// Code file name, explicit or conventional
    pub fn file_name(&self) -> crate::Result<String> {
        match &self.code_file_name {
            Some(name) => Ok(name.clone()),
            None => {
                let language: Language = self.language.parse()?;
                Ok(language.default_file_name(&self.step_id))
            }
        }
    }
}

/// Limits applied to an execution, echoed back to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityInfo {
    pub timeout_applied: u64,
    pub memory: String,
    pub cpu_share: f64,
    pub pid_limit: u32,
    pub network_mode: String,
    /// Output was cut at the byte limit
    pub output_limited: bool,
    /// Error output was cut at the byte limit
    pub error_limited: bool,
}

impl SecurityInfo {
    pub fn from_policy(policy: &SecurityPolicy) -> Self {
        let limits = &policy.resource_limits;
        SecurityInfo {
            timeout_applied: limits.execution_timeout_seconds,
            memory: limits.memory.clone(),
            cpu_share: limits.cpu_share,
            pid_limit: limits.pid_limit,
            network_mode: policy.network_policy.mode.to_string(),
            output_limited: false,
            error_limited: false,
        }
    }
}

/// Normalized outcome of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Program exited 0 within its time budget
    pub success: bool,
    pub output: String,
    pub error: String,
    pub exit_code: Option<i64>,
    pub execution_time_ms: u64,
    /// Killed by the time limit
    pub timed_out: bool,
    pub execution_id: Uuid,
    pub sandbox_name: String,
    pub security_info: SecurityInfo,
}

impl ExecutionResult {
    /// Get combined output
    pub fn combined_output(&self) -> String {
        let mut output = self.output.clone();
        if !self.error.is_empty() {
            if !output.is_empty() {
                output.push_str("\n--- stderr ---\n");
            }
            output.push_str(&self.error);
        }
        output
    }
}
