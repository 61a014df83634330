//! Configuration module
//!
//! - types/mod.rs: Core configuration types (Config, LoggingConfig)
//! - types/engine.rs: Engine and reaper configuration
//! - io.rs: Configuration loading and saving
//! - validation.rs: Configuration validation
//! - paths.rs: Default config and state locations

mod io;
mod paths;
mod types;
mod validation;

pub use types::{Config, LoggingConfig};
pub use types::engine::{EngineConfig, PolicyFallback, ReaperConfig};

pub use io::{apply_env_overrides, load_config, load_config_from_path, save_config};
pub(crate) use io::parse_structured;
pub use paths::{config_dir, config_path, output_dir, policy_path, projects_dir};
pub use validation::{validate_config, ValidationIssue, ValidationReport};
