use thiserror::Error;

use crate::models::TaskId;

/// Failures surfaced by the orchestration core.
///
/// Link classification never fails, and a user stop is reported as
/// `RunOutcome::Stopped` rather than an error.
#[derive(Debug, Error)]
pub enum DownloaderError {
    /// The extractor produced no usable JSON for a URL.
    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("failed to spawn {tool}: {source}")]
    ProcessSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with code {code:?}")]
    ProcessExit { tool: String, code: Option<i32> },

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Settings / SQLite failures, which carry `anyhow` context from `db`.
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DownloaderError>;
