//! Error types for the execution engine

use thiserror::Error;

/// Result type alias using the engine's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the execution engine
///
/// Only policy, validation, capacity and substrate errors abort a request.
/// A program that fails inside its sandbox is not an error: it comes back as
/// an `ExecutionResult` with `success == false`.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Security policy missing, malformed or invalid
    #[error("Security policy error: {0}")]
    Policy(String),

    /// Unsafe file name, identifier or unsupported language
    #[error("Validation error: {0}")]
    Validation(String),

    /// Constructed command or submitted source contains a blocked substring
    #[error("Blocked by security policy: command contains '{0}'")]
    BlockedCommand(String),

    /// Concurrency cap reached
    #[error("Capacity exceeded: {active} of {max} sandboxes in use")]
    Capacity { active: usize, max: usize },

    /// Isolation substrate unavailable or a substrate call failed
    #[error("Isolation substrate error: {0}")]
    Substrate(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Capacity { .. } | Error::Substrate(_))
    }

    /// Check if error is a client error (the submitted request's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::BlockedCommand(_))
    }

    /// Check if error is a security rejection (as opposed to an infrastructure fault)
    pub fn is_security_rejection(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::BlockedCommand(_))
    }

    /// Stable short name of the error category
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Policy(_) => "policy",
            Error::Validation(_) => "validation",
            Error::BlockedCommand(_) => "blocked_command",
            Error::Capacity { .. } => "capacity",
            Error::Substrate(_) => "substrate",
            Error::NotFound(_) => "not_found",
            Error::Json(_) => "json",
            Error::Io(_) => "io",
        }
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::Substrate(err.to_string())
    }
}
