use thiserror::Error;

use crate::domain::{ConfigVersion, JobName, StreamId};
use crate::ports::{QueueError, StoreError};

/// Errors surfaced by the application layer.
///
/// Protocol outcomes (fencing, malformed completions, divergence) are not in
/// here; they are returned as values by the components that own them.
#[derive(Debug, Error)]
pub enum ConduitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("job {job} not found in config version {config_version}")]
    UnknownJob {
        job: JobName,
        config_version: ConfigVersion,
    },

    #[error("no active config version")]
    NoActiveConfig,

    #[error("stream not found: {0}")]
    UnknownStream(StreamId),

    #[error("invalid stream schedule for {stream}: {reason}")]
    InvalidSchedule { stream: StreamId, reason: String },

    #[error("{0}")]
    Other(String),
}

impl ConduitError {
    /// Whether the owning loop should retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConduitError::Store(_) | ConduitError::Queue(_))
    }
}
