//! Execution module - Runs untrusted code inside sandboxes
//!
//! - types.rs: Requests, results and language conventions
//! - artifacts.rs: Output/error/status artifact files and truncation
//! - orchestrator.rs: The end-to-end execution path

mod artifacts;
mod orchestrator;
mod types;

pub use artifacts::{truncate, ArtifactPaths, ERROR_TRUNCATED, OUTPUT_TRUNCATED};
pub use orchestrator::Orchestrator;
pub use types::{policy_key, ExecutionRequest, ExecutionResult, Language, SecurityInfo};
