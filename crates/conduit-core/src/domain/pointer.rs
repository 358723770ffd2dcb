//! Active pointer set と cutover の記録

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ids::{ConfigVersion, CutoverId, PointerName, TaskId, VersionId};

/// Everything readers treat as "live": pointer -> version plus the active config version.
///
/// `BTreeMap` keeps the serialized form ordered, so equal sets encode to equal bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerSet {
    pub config_version: Option<ConfigVersion>,
    pub pointers: BTreeMap<PointerName, VersionId>,
}

impl PointerSet {
    pub fn get(&self, name: &PointerName) -> Option<&VersionId> {
        self.pointers.get(name)
    }

    /// The set after applying `request` on top of `self`.
    pub fn apply(&self, request: &CutoverRequest) -> PointerSet {
        let mut next = self.clone();
        for (name, version) in &request.pointers {
            next.pointers.insert(name.clone(), version.clone());
        }
        if let Some(cv) = request.config_version {
            next.config_version = Some(cv);
        }
        next
    }
}

/// A consistent read of the pointer set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerSnapshot {
    /// Bumped by every cutover and rollback.
    pub revision: u64,
    pub set: PointerSet,
    /// Number of prior snapshots available to roll back to.
    pub history_depth: usize,
}

/// Pointer updates applied together in one cutover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutoverRequest {
    #[serde(default)]
    pub pointers: BTreeMap<PointerName, VersionId>,
    #[serde(default)]
    pub config_version: Option<ConfigVersion>,
}

impl CutoverRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pointer(mut self, name: impl Into<PointerName>, version: VersionId) -> Self {
        self.pointers.insert(name.into(), version);
        self
    }

    pub fn config_version(mut self, version: ConfigVersion) -> Self {
        self.config_version = Some(version);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty() && self.config_version.is_none()
    }
}

/// A staged cutover; dispatch of the target version's work is withheld until it resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCutover {
    pub cutover_id: CutoverId,
    pub request: CutoverRequest,
    pub begun_at: DateTime<Utc>,
}

impl PendingCutover {
    /// Config version whose work is held back, if the cutover moves it.
    pub fn target_version(&self) -> Option<ConfigVersion> {
        self.request.config_version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CutoverRejection {
    Empty,
    UnknownVersion { pointer: PointerName, version: VersionId },
    UnknownConfigVersion { config_version: ConfigVersion },
    NothingToRollBack,
    PendingCutoverExists { cutover_id: CutoverId },
    NoSuchPendingCutover { cutover_id: CutoverId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CutoverOutcome {
    Committed { snapshot: PointerSnapshot },
    Staged { pending: PendingCutover },
    Abandoned {
        cutover_id: CutoverId,
        canceled_tasks: Vec<TaskId>,
    },
    Rejected { rejection: CutoverRejection },
}

impl CutoverOutcome {
    pub fn rejected(rejection: CutoverRejection) -> Self {
        CutoverOutcome::Rejected { rejection }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, CutoverOutcome::Committed { .. })
    }
}
