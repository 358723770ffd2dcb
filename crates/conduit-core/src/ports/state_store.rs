//! StateStore port - 唯一の真実の裁定者
//!
//! 各メソッドは 1 トランザクションです。条件付き遷移は述語（期待する attempt、
//! lease token、status）を store に持ち込むので、dispatcher のレプリカが何台でも
//! 同時に呼べます。競合に負けた側は `false` か拒否値を受け取り、部分的な書き込みは起きません。
//!
//! task を作るメソッドは、実際に挿入した task ごとの wake-up outbox 行も
//! 同じトランザクションで書きます。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    CancelOutcome, ClaimResult, CompleteOutcome, CompletionCommit, ConfigVersion, CutoverId,
    CutoverOutcome, CutoverRequest, DatasetName, DatasetVersion, Fence, HeartbeatOutcome, JobDefinition,
    JobId, Lease, NewTask, OutboxEntry, PendingCutover, PointerSnapshot, Publication, PublishOutcome,
    RangeSpan, ScheduleSpec, ScheduledRange, StaleEvent, StreamId, StreamRecord, TaskId,
    TaskRecord, VersionId,
};
use crate::observability::TaskCounts;

/// StoreError covers infrastructure failures only. Callers retry them with backoff.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("stored row is inconsistent: {0}")]
    Inconsistent(String),

    #[error("unknown job: {0}")]
    UnknownJob(JobId),
}

impl StoreError {
    pub fn storage(message: impl Into<String>) -> Self {
        StoreError::Storage {
            message: message.into(),
            source: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeployOutcome {
    Deployed { config_version: ConfigVersion, jobs: usize },
    /// The version already holds an identical job set.
    Unchanged { config_version: ConfigVersion },
    /// The version already holds a different job set; versions are immutable.
    Conflict { config_version: ConfigVersion },
}

/// Result of an idempotent task insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedTask {
    pub task_id: TaskId,
    /// `false` when a task with the same `(job_id, dedupe_key)` already existed.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Scheduled { task_id: TaskId },
    AlreadyScheduled { task_id: TaskId },
}

impl ScheduleOutcome {
    pub fn task_id(&self) -> TaskId {
        match self {
            ScheduleOutcome::Scheduled { task_id } | ScheduleOutcome::AlreadyScheduled { task_id } => {
                *task_id
            }
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    // ---- jobs ----

    /// Store the job set of a config version. Versions are immutable once deployed.
    async fn deploy_jobs(
        &self,
        config_version: ConfigVersion,
        jobs: Vec<JobDefinition>,
    ) -> Result<DeployOutcome, StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobDefinition>, StoreError>;

    async fn jobs_for_version(
        &self,
        config_version: ConfigVersion,
    ) -> Result<Vec<JobDefinition>, StoreError>;

    // ---- tasks & leases ----

    /// Insert tasks unless `(job_id, dedupe_key)` already exists; one wake-up row per insert.
    async fn create_tasks(
        &self,
        tasks: Vec<NewTask>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CreatedTask>, StoreError>;

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// `Queued -> Running`, only if the task is queued and not withheld by a pending cutover.
    async fn claim_task(
        &self,
        task_id: TaskId,
        lease: Lease,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, StoreError>;

    async fn heartbeat_task(
        &self,
        fence: &Fence,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, StoreError>;

    /// Fence check, publication reconcile, status transition, cursor advance and
    /// outbox rows, all or nothing.
    async fn complete_task(
        &self,
        commit: CompletionCommit,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome, StoreError>;

    async fn cancel_task(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<CancelOutcome, StoreError>;

    /// Running tasks whose lease ran out before `now`.
    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Fail the attempt named by `fence` if its lease is still the expired one.
    async fn expire_lease(&self, fence: &Fence, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Failed tasks whose `next_retry_at` has passed.
    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// `Failed -> Queued` with attempt + 1, if the task is still at `expected_attempt`.
    async fn requeue_task(
        &self,
        task_id: TaskId,
        expected_attempt: u32,
        next_backoff_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // ---- outbox ----

    /// Pending rows available at `now`, in creation order.
    async fn pull_outbox(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Mark a row done and insert the child tasks its side effect produced.
    async fn complete_outbox(
        &self,
        outbox_id: u64,
        children: Vec<NewTask>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CreatedTask>, StoreError>;

    /// Drop up to `limit` done rows finished before `done_before`. Returns how many went.
    async fn prune_outbox(&self, done_before: DateTime<Utc>, limit: usize) -> Result<usize, StoreError>;

    /// Push a pending row into the future. `failed` counts it as a delivery attempt.
    async fn defer_outbox(
        &self,
        outbox_id: u64,
        available_at: DateTime<Utc>,
        error: Option<String>,
        failed: bool,
    ) -> Result<(), StoreError>;

    // ---- dataset versions ----

    /// Publish outside a completion. Still fenced against the producing attempt.
    async fn publish_version(
        &self,
        fence: &Fence,
        publication: Publication,
        now: DateTime<Utc>,
    ) -> Result<PublishOutcome, StoreError>;

    async fn get_version(&self, version_id: &VersionId) -> Result<Option<DatasetVersion>, StoreError>;

    async fn latest_version(&self, dataset: &DatasetName) -> Result<Option<DatasetVersion>, StoreError>;

    // ---- streams ----

    /// Create the stream row if missing and set its schedule.
    async fn upsert_stream(
        &self,
        stream: &StreamId,
        schedule: Option<ScheduleSpec>,
        now: DateTime<Utc>,
    ) -> Result<StreamRecord, StoreError>;

    async fn get_stream(&self, stream: &StreamId) -> Result<Option<StreamRecord>, StoreError>;

    async fn list_streams(&self) -> Result<Vec<StreamRecord>, StoreError>;

    async fn set_stream_paused(&self, stream: &StreamId, paused: bool) -> Result<bool, StoreError>;

    /// Start a new generation; events from earlier generations become stale.
    async fn bump_generation(&self, stream: &StreamId, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Idempotent: the same stale event is recorded once.
    async fn record_stale_event(&self, event: StaleEvent) -> Result<(), StoreError>;

    async fn stale_events(&self, stream: &StreamId) -> Result<Vec<StaleEvent>, StoreError>;

    /// Insert the `(stream, range)` row together with its task, unless it exists.
    async fn schedule_range(
        &self,
        stream: &StreamId,
        range: RangeSpan,
        task: NewTask,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, StoreError>;

    async fn scheduled_ranges(&self, stream: &StreamId) -> Result<Vec<ScheduledRange>, StoreError>;

    // ---- pointers & cutover ----

    async fn pointer_snapshot(&self) -> Result<PointerSnapshot, StoreError>;

    /// Validate and apply in one transaction; the prior set goes on the history stack.
    async fn apply_cutover(
        &self,
        request: CutoverRequest,
        now: DateTime<Utc>,
    ) -> Result<CutoverOutcome, StoreError>;

    /// Restore the set that was live before the last cutover.
    async fn rollback_cutover(&self, now: DateTime<Utc>) -> Result<CutoverOutcome, StoreError>;

    async fn begin_cutover(&self, pending: PendingCutover) -> Result<CutoverOutcome, StoreError>;

    async fn pending_cutover(&self) -> Result<Option<PendingCutover>, StoreError>;

    /// Commit (`true`) or abandon (`false`) the pending cutover. Abandon cancels
    /// the still-queued tasks of the target config version in the same transaction.
    async fn resolve_cutover(
        &self,
        cutover_id: CutoverId,
        commit: bool,
        now: DateTime<Utc>,
    ) -> Result<CutoverOutcome, StoreError>;

    // ---- status ----

    async fn task_counts(&self) -> Result<TaskCounts, StoreError>;

    /// Non-terminal tasks attributed to `stream`.
    async fn stream_in_flight(&self, stream: &StreamId) -> Result<usize, StoreError>;
}
