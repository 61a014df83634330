//! Input validation
//!
//! Rejects unsafe file names, identifiers and commands before anything
//! reaches the isolation substrate. Names must stay within the character set
//! Docker accepts in container names and bind targets (`[A-Za-z0-9_.-]`), on
//! top of a deny-list for traversal, option injection and shell syntax. These
//! checks back up the sandbox's own capability, network and filesystem
//! restrictions; they are not the primary isolation.

use crate::error::{Error, Result};
use crate::policy::SecurityPolicy;

/// Characters with special meaning to a POSIX shell
const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>',
];

/// Check a file name for traversal, shell metacharacters, option injection,
/// whitespace, control characters and anything outside `[A-Za-z0-9_.-]`.
pub fn validate_file_name(name: &str) -> bool {
    unsafe_reason(name).is_none()
}

/// Like [`validate_file_name`], but reports why the name was rejected.
///
/// `kind` names the input in the error message ("file name", "project id").
pub fn ensure_safe_name(kind: &str, value: &str) -> Result<()> {
    match unsafe_reason(value) {
        None => Ok(()),
        Some(reason) => Err(Error::Validation(format!(
            "unsafe {} {:?}: {}",
            kind, value, reason
        ))),
    }
}

/// Check a project or step id. Ids flow into host paths, bind targets and
/// sandbox names, so they obey the file name rules.
pub fn validate_identifier(id: &str) -> bool {
    validate_file_name(id)
}

fn unsafe_reason(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        return Some("empty");
    }
    if name == "." {
        return Some("names the current directory");
    }
    if name.contains("..") {
        return Some("contains a parent-directory sequence");
    }
    if name.starts_with('-') {
        return Some("starts with '-'");
    }

    for c in name.chars() {
        if SHELL_METACHARACTERS.contains(&c) {
            return Some("contains a shell metacharacter");
        }
        if c.is_whitespace() {
            return Some("contains whitespace");
        }
        // C0, DEL and C1
        if c.is_control() {
            return Some("contains a control character");
        }
        if c == '/' || c == '\\' {
            return Some("contains a path separator");
        }
        if !c.is_ascii_alphanumeric() && !matches!(c, '_' | '.' | '-') {
            return Some("contains a character outside [A-Za-z0-9_.-]");
        }
    }

    None
}

/// Reject a constructed command containing any blocked substring.
pub fn validate_command(command: &str, policy: &SecurityPolicy) -> Result<()> {
    match find_blocked(command, policy) {
        Some(blocked) => Err(Error::BlockedCommand(blocked.to_string())),
        None => Ok(()),
    }
}

/// Reject submitted source text containing any blocked substring.
pub fn validate_source(code: &str, policy: &SecurityPolicy) -> Result<()> {
    validate_command(code, policy)
}

fn find_blocked<'p>(text: &str, policy: &'p SecurityPolicy) -> Option<&'p str> {
    policy
        .blocked_command_substrings
        .iter()
        .find(|blocked| !blocked.is_empty() && text.contains(blocked.as_str()))
        .map(|s| s.as_str())
}
