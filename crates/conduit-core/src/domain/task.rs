//! Task 行とその状態機械
//!
//! ```text
//! Queued --claim--> Running --complete ok--> Completed
//! Running --lease expiry | failure--> Failed --backoff elapsed--> Queued (attempt + 1)
//! Failed --attempts exhausted--> Failed (terminal, no next_retry_at)
//! any non-terminal --cancel--> Canceled
//! ```
//!
//! ここのメソッドは遷移を記述するだけです。ある呼び出し元にその遷移が許されるか（fencing）は、
//! 遷移を適用するのと同じトランザクション内で state store が判断します。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{ErrorCategory, ErrorInfo};
use super::ids::{ConfigVersion, JobId, JobName, LeaseToken, StreamId, TaskId, WorkerId};
use super::stream::{OutputEvent, RangeSpan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

/// Time-bounded, token-fenced execution right over the current attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: LeaseToken,
    pub worker_id: WorkerId,
    pub expires_at: DateTime<Utc>,
}

/// Why a task exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskTrigger {
    Manual { input: serde_json::Value },
    Event { event: OutputEvent },
    Range { stream: StreamId, range: RangeSpan },
}

/// The `(task, attempt, lease token)` triple every mutating call must present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fence {
    pub task_id: TaskId,
    pub attempt: u32,
    pub lease_token: LeaseToken,
}

/// Request to create a task; uniqueness is `(job_id, dedupe_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub job_name: JobName,
    pub config_version: ConfigVersion,
    pub trigger: TaskTrigger,
    pub dedupe_key: String,
    /// Stream the task is attributed to on status surfaces.
    pub stream: Option<StreamId>,
    pub max_attempts: u32,
    /// Backoff applied if the first attempt fails.
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub job_name: JobName,
    pub config_version: ConfigVersion,
    pub trigger: TaskTrigger,
    pub dedupe_key: String,
    pub stream: Option<StreamId>,
    /// Current attempt, starting at 1. Only this attempt may mutate the task.
    pub attempt: u32,
    pub status: TaskStatus,
    pub lease: Option<Lease>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Delay applied when the current attempt fails. Precomputed so that explicit
    /// failures and lease expiry use the same policy.
    pub retry_backoff_ms: u64,
    pub max_attempts: u32,
    pub last_error: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            task_id: new.task_id,
            job_id: new.job_id,
            job_name: new.job_name,
            config_version: new.config_version,
            trigger: new.trigger,
            dedupe_key: new.dedupe_key,
            stream: new.stream,
            attempt: 1,
            status: TaskStatus::Queued,
            lease: None,
            next_retry_at: None,
            retry_backoff_ms: new.retry_backoff_ms,
            max_attempts: new.max_attempts.max(1),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Completed, canceled, or failed with no retry left.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Canceled => true,
            TaskStatus::Failed => self.next_retry_at.is_none(),
            TaskStatus::Queued | TaskStatus::Running => false,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Fence of the live lease, if the task is running.
    pub fn fence(&self) -> Option<Fence> {
        let lease = self.lease.as_ref()?;
        Some(Fence {
            task_id: self.task_id,
            attempt: self.attempt,
            lease_token: lease.token,
        })
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| l.expires_at < now)
    }

    pub fn claim(&mut self, lease: Lease, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.lease = Some(lease);
        self.next_retry_at = None;
        self.updated_at = now;
    }

    pub fn extend_lease(&mut self, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        if let Some(lease) = self.lease.as_mut() {
            lease.expires_at = expires_at;
        }
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.lease = None;
        self.next_retry_at = None;
        self.last_error = None;
        self.updated_at = now;
    }

    /// Fail the current attempt.
    ///
    /// A retryable failure with attempts left schedules `next_retry_at` using the
    /// precomputed backoff; anything else is terminal.
    pub fn mark_failed(&mut self, error: ErrorInfo, retryable: bool, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.lease = None;
        self.updated_at = now;

        if retryable && !self.attempts_exhausted() {
            let delay_ms = i64::try_from(self.retry_backoff_ms).unwrap_or(i64::MAX);
            self.next_retry_at = Some(now + Duration::milliseconds(delay_ms));
            self.last_error = Some(error);
        } else {
            self.next_retry_at = None;
            let detail = if retryable {
                format!("attempts exhausted ({}): {}", self.attempt, error.detail)
            } else {
                error.detail
            };
            let category = if retryable {
                ErrorCategory::TerminalFailure
            } else {
                error.category
            };
            self.last_error = Some(ErrorInfo::new(category, detail));
        }
    }

    /// Start the next attempt; `next_backoff_ms` applies if that attempt fails.
    pub fn requeue(&mut self, next_backoff_ms: u64, now: DateTime<Utc>) {
        self.attempt += 1;
        self.status = TaskStatus::Queued;
        self.next_retry_at = None;
        self.retry_backoff_ms = next_backoff_ms;
        self.updated_at = now;
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Canceled;
        self.lease = None;
        self.next_retry_at = None;
        self.last_error = Some(ErrorInfo::new(ErrorCategory::Canceled, "canceled"));
        self.updated_at = now;
    }
}
