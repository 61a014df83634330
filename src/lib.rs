//! # meu-sandbox
//!
//! Sandboxed execution engine for generated code.
//!
//! ## Features
//!
//! - **Declarative Security Policy:** resource limits, capability drops, network mode
//!   and per-language command templates, validated and hot-reloadable
//! - **Container Isolation:** one ephemeral Docker sandbox per execution, read-only
//!   work directory, size-bounded writable output area
//! - **Hard Time Limits:** enforced inside the sandbox and again on the client side
//! - **Leak-Proof Cleanup:** delayed releases plus a reaper for anything left behind

pub mod config;
pub mod error;
pub mod executor;
pub mod policy;
pub mod reaper;
pub mod sandbox;
pub mod validator;

pub use config::Config;
pub use error::{Error, Result};
pub use executor::{ExecutionRequest, ExecutionResult, Orchestrator};
pub use policy::{PolicyStore, SecurityPolicy};
pub use reaper::Reaper;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
