//! Operator trait - operator selector と型付き config の対応付け

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{OutputRecord, OutputTarget, Span};

/// Operator associates a selector string with the config type it accepts.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Compact {
///     target_file_mb: u32,
/// }
///
/// impl Operator for Compact {
///     const NAME: &'static str = "etl.compact.v1";
/// }
/// ```
///
/// # Naming
/// - `{namespace}.{action}.v{major}`
pub trait Operator: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

/// What a successful operator run hands back to the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Produced {
    pub outputs: Vec<OutputRecord>,
    /// Spans emitted on the job's output stream.
    pub events: Vec<Span>,
}

impl Produced {
    pub fn nothing() -> Self {
        Self::default()
    }

    /// One event on the output stream, plus the dataset publication if the job has one.
    pub fn single(
        target: &OutputTarget,
        storage_ref: impl Into<String>,
        config_hash: impl Into<String>,
        span: Span,
    ) -> Self {
        let outputs = target
            .dataset
            .as_ref()
            .map(|dataset| OutputRecord {
                dataset: dataset.clone(),
                storage_ref: storage_ref.into(),
                config_hash: config_hash.into(),
                span,
            })
            .into_iter()
            .collect();
        Self {
            outputs,
            events: vec![span],
        }
    }
}

/// Failure reported by an operator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct OperatorError {
    pub message: String,
    pub retryable: bool,
}

impl OperatorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}
