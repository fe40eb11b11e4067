use std::path::PathBuf;

use crate::job::{JobId, JobStatus, NodeId};

/// Errors surfaced by the render farm core.
#[derive(Debug, thiserror::Error)]
pub enum FarmError {
    /// The engine binary or one of its scripts is missing or unusable.
    ///
    /// Only raised while the farm starts; it is fatal for the process.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A query invocation exited without printing its data line.
    #[error("invalid engine output: {0}")]
    InvalidEngineOutput(String),

    /// A render subprocess exited abnormally for a reason other than cancellation.
    #[error(
        "render node {pid} exited abnormally (code {code:?}, signal {signal:?})"
    )]
    NodeExecution {
        pid: NodeId,
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} is {status}, expected {expected}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        expected: JobStatus,
    },

    #[error("failed to signal render node {pid}: {reason}")]
    Signal { pid: NodeId, reason: String },

    #[error("failed to spawn engine {}: {source}", executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl FarmError {
    /// Whether the error should stop the process rather than a single job.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FarmError::Configuration(_))
    }
}
