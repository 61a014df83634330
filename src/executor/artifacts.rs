//! Output, error and status artifacts
//!
//! The dispatched script redirects its streams into files on the writable
//! output mount and records the exit code, the last stage that ran and that
//! stage's duration as JSON. They are read back from the host side of that
//! mount, which is a directory private to one execution.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::sandbox::OUTPUT_MOUNT;

/// Appended when output is cut at the byte limit
pub const OUTPUT_TRUNCATED: &str = "\n[output truncated]";

/// Appended when error output is cut at the byte limit
pub const ERROR_TRUNCATED: &str = "\n[error output truncated]";

/// Artifact file names of one `(project, step)`
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    output: String,
    error: String,
    status: String,
}

impl ArtifactPaths {
    pub fn new(project_id: &str, step_id: &str) -> Self {
        let stem = format!("{}_{}", project_id, step_id);
        ArtifactPaths {
            output: format!("{}_output.txt", stem),
            error: format!("{}_error.txt", stem),
            status: format!("{}_status.json", stem),
        }
    }

    /// `(output, error, status)` inside an output area on the host
    pub fn on_host(&self, area: &Path) -> (PathBuf, PathBuf, PathBuf) {
        (
            area.join(&self.output),
            area.join(&self.error),
            area.join(&self.status),
        )
    }

    /// `(output, error, status)` as seen inside the sandbox
    pub fn in_sandbox(&self) -> (String, String, String) {
        (
            format!("{}/{}", OUTPUT_MOUNT, self.output),
            format!("{}/{}", OUTPUT_MOUNT, self.error),
            format!("{}/{}", OUTPUT_MOUNT, self.status),
        )
    }

    /// Delete leftovers of an earlier run of the same step
    pub async fn clear(&self, area: &Path) -> std::io::Result<()> {
        let (output, error, status) = self.on_host(area);
        for path in [output, error, status] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Read an artifact; `None` if it was never written
pub async fn read_artifact(path: &Path) -> Option<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(artifact = %path.display(), error = %e, "Unreadable artifact treated as missing");
            None
        }
    }
}

/// Contents of the status artifact
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatus {
    pub exit_code: i64,
    /// `compile` or `run`; the last stage started
    #[serde(default)]
    pub stage: Option<String>,
    /// Wall-clock seconds that stage took
    #[serde(default)]
    pub stage_seconds: Option<u64>,
}

impl StageStatus {
    /// Whether the recorded stage is the compile stage
    pub fn is_compile(&self) -> bool {
        self.stage.as_deref() == Some(COMPILE_STAGE)
    }
}

/// Stage names written by the dispatched script
pub const COMPILE_STAGE: &str = "compile";
pub const RUN_STAGE: &str = "run";

/// Read the status artifact; `None` if missing or malformed
pub async fn read_status(path: &Path) -> Option<StageStatus> {
    let content = read_artifact(path).await?;
    match serde_json::from_str::<StageStatus>(content.trim()) {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(artifact = %path.display(), error = %e, "Malformed status artifact");
            None
        }
    }
}

/// Cut `text` to at most `limit` bytes on a char boundary, appending
/// `marker` if anything was dropped. Returns whether it was cut.
pub fn truncate(text: String, limit: usize, marker: &str) -> (String, bool) {
    if text.len() <= limit {
        return (text, false);
    }

    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }

    let mut cut = text;
    cut.truncate(end);
    cut.push_str(marker);
    (cut, true)
}
