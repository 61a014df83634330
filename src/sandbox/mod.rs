//! Sandbox module - Isolated execution environments
//!
//! - substrate.rs: The narrow interface to the isolation layer
//! - docker.rs: Docker implementation of that interface
//! - manager.rs: Sandbox lifecycle and the concurrency-capped tracking table
//! - cleanup.rs: Delayed, cancellable releases

mod cleanup;
mod docker;
mod manager;
mod substrate;

#[cfg(test)]
pub(crate) mod mock;

pub use cleanup::ReleaseQueue;
pub use docker::DockerSubstrate;
pub use manager::{EnvironmentManager, Sandbox, SandboxStatus, MANAGED_LABEL};
pub use substrate::{
    IsolationSubstrate, Mount, RunOutput, SandboxSpec, SandboxStats, SandboxSummary,
    SubstrateUsage, Ulimit,
};

/// Where a project's work directory appears inside a sandbox
pub const PROJECTS_MOUNT: &str = "/workspace/projects";

/// Where the writable artifact directory appears inside a sandbox
pub const OUTPUT_MOUNT: &str = "/workspace/output";
