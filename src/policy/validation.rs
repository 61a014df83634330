//! Security policy validation
//!
//! Errors make the policy unloadable. Warnings flag settings that are legal
//! but weaken isolation.

use super::{NetworkMode, SecurityPolicy};
use crate::config::{ValidationIssue, ValidationReport};
use crate::validator::ensure_safe_name;

/// Capabilities a sandbox may add back without a warning
const MINIMAL_CAPABILITIES: &[&str] = &["SETUID", "SETGID"];

/// Validate a parsed policy
pub fn validate_policy(policy: &SecurityPolicy) -> ValidationReport {
    let mut result = ValidationReport::valid();

    result = validate_resource_limits(policy, result);
    result = validate_security_options(policy, result);
    result = validate_commands(policy, result);

    result
}

fn validate_resource_limits(policy: &SecurityPolicy, mut result: ValidationReport) -> ValidationReport {
    let limits = &policy.resource_limits;

    let positive = [
        ("executionTimeoutSeconds", limits.execution_timeout_seconds > 0),
        ("outputByteLimit", limits.output_byte_limit > 0),
        ("pidLimit", limits.pid_limit > 0),
        ("compileTimeoutSeconds", limits.compile_timeout_seconds > 0),
        ("artifactByteLimit", limits.artifact_byte_limit > 0),
    ];
    for (field, ok) in positive {
        if !ok {
            result = result.with_error(ValidationIssue::new(
                format!("resourceLimits.{}", field),
                "must be greater than zero",
            ));
        }
    }

    if !(limits.cpu_share.is_finite() && limits.cpu_share > 0.0) {
        result = result.with_error(ValidationIssue::new(
            "resourceLimits.cpuShare",
            format!("must be a positive number of cores, got {}", limits.cpu_share),
        ));
    }

    match limits.memory_bytes() {
        Some(bytes) if bytes > 0 => {}
        _ => {
            result = result.with_error(
                ValidationIssue::new(
                    "resourceLimits.memory",
                    format!("unparseable memory limit '{}'", limits.memory),
                )
                .with_suggestion("Use a number with an optional k/m/g suffix, e.g. \"256m\""),
            );
        }
    }

    let busy_seconds = limits
        .execution_timeout_seconds
        .saturating_add(limits.compile_timeout_seconds);
    if limits.sandbox_lifetime() < busy_seconds {
        result = result.with_error(ValidationIssue::new(
            "resourceLimits.sandboxLifetimeSeconds",
            format!(
                "sandbox lifetime {}s is shorter than compile + run timeouts ({}s)",
                limits.sandbox_lifetime(),
                busy_seconds
            ),
        ));
    }

    if limits.open_files.soft > limits.open_files.hard {
        result = result.with_error(ValidationIssue::new(
            "resourceLimits.openFiles",
            "soft limit exceeds hard limit",
        ));
    }

    result
}

fn validate_security_options(policy: &SecurityPolicy, mut result: ValidationReport) -> ValidationReport {
    let options = &policy.security_options;

    if policy.network_policy.mode != NetworkMode::None {
        result = result.with_warning(
            ValidationIssue::new(
                "networkPolicy.mode",
                format!("sandboxes get network access ({})", policy.network_policy.mode),
            )
            .with_suggestion("Use \"none\" unless executed code must reach the network"),
        );
    }

    if !options.read_only_root_filesystem {
        result = result.with_warning(ValidationIssue::new(
            "securityOptions.readOnlyRootFilesystem",
            "sandbox root filesystem is writable",
        ));
    }

    if !options.no_new_privileges {
        result = result.with_warning(ValidationIssue::new(
            "securityOptions.noNewPrivileges",
            "privilege escalation through setuid binaries is allowed",
        ));
    }

    if !options
        .dropped_capabilities
        .iter()
        .any(|cap| cap.eq_ignore_ascii_case("ALL"))
    {
        result = result.with_warning(
            ValidationIssue::new(
                "securityOptions.droppedCapabilities",
                "not all capabilities are dropped",
            )
            .with_suggestion("Drop \"ALL\" and add back only what is required"),
        );
    }

    for cap in &options.added_capabilities {
        if !MINIMAL_CAPABILITIES
            .iter()
            .any(|allowed| cap.eq_ignore_ascii_case(allowed))
        {
            result = result.with_warning(ValidationIssue::new(
                "securityOptions.addedCapabilities",
                format!("capability {} widens the sandbox", cap),
            ));
        }
    }

    for path in options.tmpfs.keys() {
        if !path.starts_with('/') {
            result = result.with_error(ValidationIssue::new(
                "securityOptions.tmpfs",
                format!("mount point '{}' is not absolute", path),
            ));
        }
    }

    result
}

fn validate_commands(policy: &SecurityPolicy, mut result: ValidationReport) -> ValidationReport {
    if policy.allowed_commands.is_empty() {
        result = result.with_warning(ValidationIssue::new(
            "allowedCommands",
            "no language is allowed; every request will be rejected",
        ));
    }

    for language in policy.allowed_commands.keys() {
        if ensure_safe_name("language", language).is_err() || *language != language.to_lowercase() {
            result = result.with_error(ValidationIssue::new(
                format!("allowedCommands.{}", language),
                "language names must be lowercase and free of shell syntax",
            ));
        }
    }

    if policy.blocked_command_substrings.iter().any(|s| s.is_empty()) {
        result = result.with_error(ValidationIssue::new(
            "blockedCommandSubstrings",
            "empty entry would match every command",
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restrictive_policy_is_clean() {
        let result = validate_policy(&SecurityPolicy::restrictive());
        assert!(result.valid);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }

    #[test]
    fn test_non_positive_limits_rejected() {
        let mut policy = SecurityPolicy::restrictive();
        policy.resource_limits.output_byte_limit = 0;
        policy.resource_limits.cpu_share = 0.0;
        policy.resource_limits.memory = "plenty".to_string();

        let result = validate_policy(&policy);
        assert!(!result.valid);
        let paths: Vec<_> = result.errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"resourceLimits.outputByteLimit"));
        assert!(paths.contains(&"resourceLimits.cpuShare"));
        assert!(paths.contains(&"resourceLimits.memory"));
    }

    #[test]
    fn test_short_lifetime_rejected() {
        let mut policy = SecurityPolicy::restrictive();
        policy.resource_limits.sandbox_lifetime_seconds = Some(5);

        assert!(!validate_policy(&policy).valid);
    }

    #[test]
    fn test_weakening_settings_warn() {
        let mut policy = SecurityPolicy::restrictive();
        policy.network_policy.mode = NetworkMode::Bridge;
        policy.security_options.dropped_capabilities.clear();
        policy
            .security_options
            .added_capabilities
            .insert("SYS_ADMIN".to_string());

        let result = validate_policy(&policy);
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 3);
    }

    #[test]
    fn test_empty_blocked_substring_rejected() {
        let mut policy = SecurityPolicy::restrictive();
        policy.blocked_command_substrings.insert(String::new());

        assert!(!validate_policy(&policy).valid);
    }
}
