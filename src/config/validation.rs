//! Configuration validation
//!
//! Validates configuration and reports issues. The same report type is used
//! for security policy validation.

use super::types::Config;

/// Result of configuration or policy validation
#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Create a valid result
    pub fn valid() -> Self {
        ValidationReport {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }

    /// All error messages joined into one line
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|issue| issue.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the offending field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ValidationReport {
    let mut result = ValidationReport::valid();

    result = validate_engine_config(config, result);
    result = validate_reaper_config(config, result);

    result
}

fn validate_engine_config(config: &Config, mut result: ValidationReport) -> ValidationReport {
    let engine = &config.engine;

    if engine.image.is_empty() {
        result = result.with_error(
            ValidationIssue::new("engine.image", "No sandbox image specified")
                .with_suggestion("Set engine.image or MEU_SANDBOX_IMAGE"),
        );
    }

    if engine.max_concurrency == 0 {
        result = result.with_error(
            ValidationIssue::new("engine.max_concurrency", "Must allow at least one sandbox")
                .with_suggestion("Set engine.max_concurrency to a positive number"),
        );
    }

    let prefix_ok = !engine.container_prefix.is_empty()
        && engine
            .container_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && engine
            .container_prefix
            .starts_with(|c: char| c.is_ascii_alphanumeric());
    if !prefix_ok {
        result = result.with_error(
            ValidationIssue::new(
                "engine.container_prefix",
                format!("Invalid sandbox name prefix: '{}'", engine.container_prefix),
            )
            .with_suggestion("Use ASCII letters, digits, '-' or '_', starting with a letter or digit"),
        );
    }

    for (path, dir) in [
        ("engine.projects_dir", &engine.projects_dir),
        ("engine.output_dir", &engine.output_dir),
    ] {
        if !dir.is_absolute() {
            result = result.with_warning(
                ValidationIssue::new(
                    path,
                    format!("Relative path {} is resolved against the working directory", dir.display()),
                )
                .with_suggestion("Use an absolute path so bind mounts are unambiguous"),
            );
        }
    }

    if engine.release_grace.is_zero() {
        result = result.with_warning(ValidationIssue::new(
            "engine.release_grace",
            "Sandboxes are released immediately; late artifact writes may be lost",
        ));
    }

    result
}

fn validate_reaper_config(config: &Config, mut result: ValidationReport) -> ValidationReport {
    let reaper = &config.reaper;

    if !reaper.enabled {
        result = result.with_warning(
            ValidationIssue::new("reaper.enabled", "Reaper disabled; leaked sandboxes are never reclaimed")
                .with_suggestion("Only disable the reaper when another process sweeps the same prefix"),
        );
        return result;
    }

    if reaper.interval.is_zero() {
        result = result.with_error(ValidationIssue::new(
            "reaper.interval",
            "Sweep interval must be positive",
        ));
    }

    if reaper.max_age <= config.engine.release_grace {
        result = result.with_error(
            ValidationIssue::new(
                "reaper.max_age",
                "Maximum sandbox age must exceed the release grace period",
            )
            .with_suggestion("Raise reaper.max_age (default 10m)"),
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        let result = validate_config(&config);

        assert!(result.errors.is_empty());
        assert!(result.valid);
    }

    #[test]
    fn test_zero_concurrency_is_error() {
        let mut config = Config::default();
        config.engine.max_concurrency = 0;

        let result = validate_config(&config);
        assert!(!result.valid);
        assert!(result.error_summary().contains("engine.max_concurrency"));
    }

    #[test]
    fn test_bad_prefix_is_error() {
        let mut config = Config::default();
        config.engine.container_prefix = "-meu exec".to_string();

        let result = validate_config(&config);
        assert!(!result.valid);
    }

    #[test]
    fn test_max_age_must_exceed_grace() {
        let mut config = Config::default();
        config.reaper.max_age = Duration::from_secs(1);

        let result = validate_config(&config);
        assert!(!result.valid);
        assert_eq!(result.errors[0].path, "reaper.max_age");
    }
}
