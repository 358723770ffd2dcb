//! Dataset version と内容から導かれる identity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ids::{DatasetName, TaskId, VersionId};
use super::stream::Span;

/// One output declared by an executor in a completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub dataset: DatasetName,
    /// Durable location consumers resolve the version to.
    pub storage_ref: String,
    pub config_hash: String,
    pub span: Span,
}

/// Immutable description of a published version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub storage_ref: String,
    pub config_hash: String,
    pub span: Span,
    pub producing_task: TaskId,
}

impl VersionDescriptor {
    /// SHA-256 over the canonical JSON encoding.
    pub fn content_hash(&self) -> String {
        // Field order is fixed by the struct, so the encoding is canonical.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Deterministic identity of the version a task produces for a span.
///
/// Independent of the attempt, so a retried attempt maps onto the same identity.
pub fn version_identity(dataset: &DatasetName, producing_task: TaskId, span: &Span) -> VersionId {
    let mut hasher = Sha256::new();
    hasher.update(dataset.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(producing_task.as_ulid().to_bytes());
    hasher.update([0u8]);
    hasher.update(span.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    VersionId::new(format!("dsv-{}", &digest[..40]))
}

/// A version ready to be reconciled against the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub version_id: VersionId,
    pub dataset: DatasetName,
    pub descriptor: VersionDescriptor,
    pub content_hash: String,
}

impl Publication {
    pub fn new(dataset: DatasetName, descriptor: VersionDescriptor) -> Self {
        let version_id = version_identity(&dataset, descriptor.producing_task, &descriptor.span);
        let content_hash = descriptor.content_hash();
        Self {
            version_id,
            dataset,
            descriptor,
            content_hash,
        }
    }

    pub fn from_output(producing_task: TaskId, output: &OutputRecord) -> Self {
        Self::new(
            output.dataset.clone(),
            VersionDescriptor {
                storage_ref: output.storage_ref.clone(),
                config_hash: output.config_hash.clone(),
                span: output.span,
                producing_task,
            },
        )
    }
}

/// Registered version row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetVersion {
    pub version_id: VersionId,
    pub dataset: DatasetName,
    pub descriptor: VersionDescriptor,
    pub content_hash: String,
    /// Attempt that first published it.
    pub attempt: u32,
    /// Insertion order across the registry; newest wins for `latest`.
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
}

/// Result of comparing a publication with what is already registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Insert,
    Identical,
    Divergent { existing_hash: String },
}

pub fn reconcile(existing: Option<&DatasetVersion>, publication: &Publication) -> Reconciliation {
    match existing {
        None => Reconciliation::Insert,
        Some(v) if v.content_hash == publication.content_hash => Reconciliation::Identical,
        Some(v) => Reconciliation::Divergent {
            existing_hash: v.content_hash.clone(),
        },
    }
}

/// Outcome of a publish call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Inserted { version: DatasetVersion },
    /// Same identity, same content: no-op.
    AlreadyPublished { version: DatasetVersion },
    /// Same identity, different content. Never overwritten.
    Conflict {
        version_id: VersionId,
        existing_hash: String,
        offered_hash: String,
    },
    /// The caller does not hold the current attempt.
    Rejected { reason: String },
}
