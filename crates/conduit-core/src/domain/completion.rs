//! Executor 向けプロトコル型（claim, heartbeat, complete）
//!
//! プロトコル上の拒否はエラーではなく値です。これらの呼び出しの `Err` は常に
//! state store 自体の失敗を意味し、呼び出しは retry してよいです。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dataset::{OutputRecord, Publication};
use super::errors::ErrorInfo;
use super::ids::{ConfigVersion, DatasetName, JobId, JobName, LeaseToken, TaskId, VersionId};
use super::stream::{OutputEvent, Span, StreamRef};
use super::task::{Fence, TaskRecord, TaskStatus, TaskTrigger};

/// One input the operator should read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInput {
    pub source: StreamRef,
    pub span: Span,
    /// Storage location of the upstream dataset version, when the event carried one.
    #[serde(default)]
    pub storage_ref: Option<String>,
    #[serde(default)]
    pub version: Option<VersionId>,
}

/// Where the operator's outputs go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTarget {
    /// Generation is pinned when the payload is assembled; events must echo it.
    pub stream: StreamRef,
    pub dataset: Option<DatasetName>,
}

/// Everything an executor needs to run one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: TaskId,
    pub attempt: u32,
    pub job_id: JobId,
    pub job_name: JobName,
    pub config_version: ConfigVersion,
    pub operator: String,
    pub config: serde_json::Value,
    pub trigger: TaskTrigger,
    pub inputs: Vec<ResolvedInput>,
    pub output: Option<OutputTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimGrant {
    pub attempt: u32,
    pub lease_token: LeaseToken,
    pub lease_expires_at: DateTime<Utc>,
    pub payload: TaskPayload,
}

impl ClaimGrant {
    pub fn fence(&self) -> Fence {
        Fence {
            task_id: self.payload.task_id,
            attempt: self.attempt,
            lease_token: self.lease_token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotClaimedReason {
    NotFound,
    /// Another worker holds the lease.
    AlreadyRunning,
    /// Failed and waiting for its backoff to elapse.
    RetryPending,
    Terminal,
    /// Held back while a cutover to its config version is pending.
    Withheld,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Claimed(ClaimGrant),
    NotClaimed { reason: NotClaimedReason },
}

/// Store-level claim result; the lease manager turns it into a [`ClaimOutcome`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResult {
    Claimed(TaskRecord),
    NotClaimed(NotClaimedReason),
}

/// Why a fenced call did not match the task's current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum FenceViolation {
    NotFound,
    NotRunning { status: TaskStatus },
    StaleAttempt { current: u32, offered: u32 },
    LeaseMismatch,
    LeaseExpired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HeartbeatOutcome {
    Extended { lease_expires_at: DateTime<Utc> },
    Rejected { violation: FenceViolation },
}

impl HeartbeatOutcome {
    pub fn is_extended(&self) -> bool {
        matches!(self, HeartbeatOutcome::Extended { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompletionStatus {
    Succeeded,
    Failed { error: String, retryable: bool },
}

/// What an executor sends on `complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub task_id: TaskId,
    pub attempt: u32,
    pub lease_token: LeaseToken,
    pub status: CompletionStatus,
    #[serde(default)]
    pub outputs: Vec<OutputRecord>,
    #[serde(default)]
    pub events: Vec<OutputEvent>,
}

impl CompletionRequest {
    pub fn succeeded(fence: &Fence) -> Self {
        Self {
            task_id: fence.task_id,
            attempt: fence.attempt,
            lease_token: fence.lease_token,
            status: CompletionStatus::Succeeded,
            outputs: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn failed(fence: &Fence, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            status: CompletionStatus::Failed {
                error: error.into(),
                retryable,
            },
            ..Self::succeeded(fence)
        }
    }

    pub fn output(mut self, output: OutputRecord) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn event(mut self, event: OutputEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn fence(&self) -> Fence {
        Fence {
            task_id: self.task_id,
            attempt: self.attempt,
            lease_token: self.lease_token,
        }
    }
}

/// Validated completion, applied by the store in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionCommit {
    pub fence: Fence,
    pub outcome: CommitOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Succeeded {
        publications: Vec<Publication>,
        events: Vec<OutputEvent>,
    },
    Failed { error: ErrorInfo, retryable: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rejection", rename_all = "snake_case")]
pub enum Rejection {
    /// The caller must abandon its attempt.
    Fenced { violation: FenceViolation },
    Malformed { reason: String },
    Divergent {
        version_id: VersionId,
        existing_hash: String,
        offered_hash: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReceipt {
    pub task_id: TaskId,
    pub attempt: u32,
    pub status: TaskStatus,
    pub published: Vec<VersionId>,
    pub routed_events: usize,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompleteOutcome {
    Accepted(CompletionReceipt),
    Rejected(Rejection),
}

impl CompleteOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CompleteOutcome::Accepted(_))
    }

    pub fn fenced(violation: FenceViolation) -> Self {
        CompleteOutcome::Rejected(Rejection::Fenced { violation })
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        CompleteOutcome::Rejected(Rejection::Malformed {
            reason: reason.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    Canceled,
    AlreadyTerminal { status: TaskStatus },
    NotFound,
}

/// Check a presented fence against the task's current state.
pub fn check_fence(task: &TaskRecord, fence: &Fence) -> Result<(), FenceViolation> {
    if task.status != TaskStatus::Running {
        return Err(FenceViolation::NotRunning {
            status: task.status,
        });
    }
    if task.attempt != fence.attempt {
        return Err(FenceViolation::StaleAttempt {
            current: task.attempt,
            offered: fence.attempt,
        });
    }
    match task.lease.as_ref() {
        Some(lease) if lease.token == fence.lease_token => Ok(()),
        _ => Err(FenceViolation::LeaseMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::WorkerId;
    use crate::domain::task::{Lease, NewTask};
    use chrono::TimeZone;
    use ulid::Ulid;

    fn running_task() -> TaskRecord {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut task = TaskRecord::new(
            NewTask {
                task_id: TaskId::from_ulid(Ulid::new()),
                job_id: JobId::from_ulid(Ulid::new()),
                job_name: JobName::new("j"),
                config_version: ConfigVersion(1),
                trigger: TaskTrigger::Manual {
                    input: serde_json::Value::Null,
                },
                dedupe_key: "k".into(),
                stream: None,
                max_attempts: 3,
                retry_backoff_ms: 10,
            },
            now,
        );
        task.claim(
            Lease {
                token: LeaseToken::from_ulid(Ulid::new()),
                worker_id: WorkerId::new("w"),
                expires_at: now,
            },
            now,
        );
        task
    }

    #[test]
    fn fence_matches_current_attempt_only() {
        let task = running_task();
        let fence = task.fence().unwrap();
        assert_eq!(check_fence(&task, &fence), Ok(()));

        let stale = Fence {
            attempt: 0,
            ..fence.clone()
        };
        assert!(matches!(
            check_fence(&task, &stale),
            Err(FenceViolation::StaleAttempt { current: 1, offered: 0 })
        ));

        let wrong_token = Fence {
            lease_token: LeaseToken::from_ulid(Ulid::new()),
            ..fence
        };
        assert_eq!(check_fence(&task, &wrong_token), Err(FenceViolation::LeaseMismatch));
    }

    #[test]
    fn completion_request_builders() {
        let task = running_task();
        let fence = task.fence().unwrap();
        let req = CompletionRequest::failed(&fence, "boom", true);
        assert_eq!(req.fence(), fence);
        assert!(matches!(req.status, CompletionStatus::Failed { retryable: true, .. }));
    }
}
