//! InMemoryStateStore - インメモリ state store
//!
//! すべてのテーブルは 1 つの `tokio::sync::Mutex` の内側にあります。各 port メソッドは
//! lock を 1 度だけ取り、何かを変更する前にすべてを検証するので、
//! どのメソッドも単一トランザクションとして振る舞います。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::completion::check_fence;
use crate::domain::dataset::reconcile;
use crate::domain::{
    CancelOutcome, ClaimResult, CommitOutcome, CompleteOutcome, CompletionCommit,
    CompletionReceipt, ConfigVersion, CutoverId, CutoverOutcome, CutoverRejection,
    CutoverRequest, DatasetName, DatasetVersion, ErrorCategory, ErrorInfo, Fence,
    FenceViolation, HeartbeatOutcome, JobDefinition, JobId, JobName, Lease, NewTask, NotClaimedReason,
    OutboxEffect, OutboxEntry, OutboxStatus, PendingCutover, PointerSet, PointerSnapshot,
    Publication, PublishOutcome, RangeSpan, Reconciliation, Rejection, ScheduleSpec,
    ScheduledRange, StaleEvent, StreamId, StreamRecord, TaskId, TaskRecord, TaskStatus,
    TaskTrigger, VersionId,
};
use crate::observability::TaskCounts;
use crate::ports::{CreatedTask, DeployOutcome, ScheduleOutcome, StateStore, StoreError};

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobId, JobDefinition>,
    jobs_by_version: BTreeMap<ConfigVersion, Vec<JobId>>,

    tasks: HashMap<TaskId, TaskRecord>,
    /// Uniqueness constraint `(job_id, dedupe_key)`.
    task_keys: HashMap<(JobId, String), TaskId>,

    outbox: BTreeMap<u64, OutboxEntry>,
    /// Ids of rows still pending, so pulls skip finished history.
    pending_outbox: BTreeSet<u64>,
    next_outbox_id: u64,

    versions: HashMap<VersionId, DatasetVersion>,
    latest_versions: HashMap<DatasetName, VersionId>,
    next_version_seq: u64,

    streams: BTreeMap<StreamId, StreamRecord>,
    stale_events: Vec<StaleEvent>,
    /// Uniqueness constraint `(stream, range)`.
    ranges: BTreeMap<(StreamId, RangeSpan), ScheduledRange>,

    pointers: PointerSet,
    pointer_history: Vec<PointerSet>,
    pointer_revision: u64,
    pending_cutover: Option<PendingCutover>,
}

impl StoreState {
    fn push_outbox(&mut self, effect: OutboxEffect, now: DateTime<Utc>) -> u64 {
        self.next_outbox_id += 1;
        let id = self.next_outbox_id;
        self.outbox.insert(id, OutboxEntry::new(id, effect, now));
        self.pending_outbox.insert(id);
        id
    }

    fn insert_task(&mut self, new: NewTask, now: DateTime<Utc>) -> CreatedTask {
        let key = (new.job_id, new.dedupe_key.clone());
        if let Some(existing) = self.task_keys.get(&key) {
            return CreatedTask {
                task_id: *existing,
                created: false,
            };
        }

        let record = TaskRecord::new(new, now);
        let task_id = record.task_id;
        let attempt = record.attempt;
        self.task_keys.insert(key, task_id);
        self.tasks.insert(task_id, record);
        self.push_outbox(OutboxEffect::WakeUp { task_id, attempt }, now);

        CreatedTask {
            task_id,
            created: true,
        }
    }

    /// Work for a config version newer than the active one waits for its cutover.
    fn withheld(&self, task: &TaskRecord) -> bool {
        self.pointers
            .config_version
            .is_some_and(|active| task.config_version > active)
    }

    /// Routed work must belong to the active version or the staged one.
    // cutover の解決前に読んだ plan は、どちらでもない version の task を含みうる
    fn routable(&self, task: &NewTask) -> bool {
        let Some(active) = self.pointers.config_version else {
            return true;
        };
        task.config_version == active
            || self
                .pending_cutover
                .as_ref()
                .and_then(|pending| pending.target_version())
                == Some(task.config_version)
    }

    /// Queued tasks of `prior` that the newly active `target` already has a task for.
    fn cancel_superseded(&mut self, prior: ConfigVersion, target: ConfigVersion, now: DateTime<Utc>) {
        let replaced: HashSet<(JobName, String)> = self
            .tasks
            .values()
            .filter(|t| t.config_version == target && t.status != TaskStatus::Canceled)
            .map(|t| (t.job_name.clone(), t.dedupe_key.clone()))
            .collect();
        for task in self.tasks.values_mut() {
            if task.config_version == prior
                && task.status == TaskStatus::Queued
                && replaced.contains(&(task.job_name.clone(), task.dedupe_key.clone()))
            {
                task.cancel(now);
            }
        }
    }

    fn stream_mut(&mut self, stream: &StreamId, now: DateTime<Utc>) -> &mut StreamRecord {
        self.streams
            .entry(stream.clone())
            .or_insert_with(|| StreamRecord::new(stream.clone(), now))
    }

    fn note_stream_error(&mut self, stream: Option<StreamId>, error: Option<ErrorInfo>, now: DateTime<Utc>) {
        if let (Some(stream), Some(error)) = (stream, error) {
            let record = self.stream_mut(&stream, now);
            record.last_error = Some(error);
            record.updated_at = now;
        }
    }

    fn validate_cutover(&self, request: &CutoverRequest) -> Option<CutoverRejection> {
        if request.is_empty() {
            return Some(CutoverRejection::Empty);
        }
        for (pointer, version) in &request.pointers {
            if !self.versions.contains_key(version) {
                return Some(CutoverRejection::UnknownVersion {
                    pointer: pointer.clone(),
                    version: version.clone(),
                });
            }
        }
        if let Some(cv) = request.config_version
            && !self.jobs_by_version.contains_key(&cv)
        {
            return Some(CutoverRejection::UnknownConfigVersion { config_version: cv });
        }
        None
    }

    fn commit_pointers(&mut self, request: &CutoverRequest) -> PointerSnapshot {
        let next = self.pointers.apply(request);
        let prior = std::mem::replace(&mut self.pointers, next);
        self.pointer_history.push(prior);
        self.pointer_revision += 1;
        self.snapshot()
    }

    fn snapshot(&self) -> PointerSnapshot {
        PointerSnapshot {
            revision: self.pointer_revision,
            set: self.pointers.clone(),
            history_depth: self.pointer_history.len(),
        }
    }

    fn insert_version(&mut self, publication: Publication, attempt: u32, now: DateTime<Utc>) -> DatasetVersion {
        self.next_version_seq += 1;
        let version = DatasetVersion {
            version_id: publication.version_id,
            dataset: publication.dataset,
            descriptor: publication.descriptor,
            content_hash: publication.content_hash,
            attempt,
            sequence: self.next_version_seq,
            published_at: now,
        };
        self.latest_versions
            .insert(version.dataset.clone(), version.version_id.clone());
        self.versions
            .insert(version.version_id.clone(), version.clone());
        version
    }
}

/// In-memory [`StateStore`] for tests, local runs and the CLI.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every outbox row, pending or done, in creation order.
    pub async fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.state.lock().await.outbox.values().cloned().collect()
    }

    pub async fn all_tasks(&self) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        let mut tasks: Vec<TaskRecord> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| (t.created_at, t.task_id));
        tasks
    }

    pub async fn versions_of(&self, dataset: &DatasetName) -> Vec<DatasetVersion> {
        let state = self.state.lock().await;
        let mut versions: Vec<DatasetVersion> = state
            .versions
            .values()
            .filter(|v| &v.dataset == dataset)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.sequence);
        versions
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn deploy_jobs(
        &self,
        config_version: ConfigVersion,
        jobs: Vec<JobDefinition>,
    ) -> Result<DeployOutcome, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(existing_ids) = state.jobs_by_version.get(&config_version) {
            let mut existing: Vec<_> = existing_ids
                .iter()
                .filter_map(|id| state.jobs.get(id))
                .map(|j| &j.spec)
                .collect();
            let mut offered: Vec<_> = jobs.iter().map(|j| &j.spec).collect();
            existing.sort_by(|a, b| a.name.cmp(&b.name));
            offered.sort_by(|a, b| a.name.cmp(&b.name));

            return Ok(if existing == offered {
                DeployOutcome::Unchanged { config_version }
            } else {
                DeployOutcome::Conflict { config_version }
            });
        }

        let count = jobs.len();
        let mut ids = Vec::with_capacity(count);
        for job in jobs {
            ids.push(job.job_id);
            state.jobs.insert(job.job_id, job);
        }
        state.jobs_by_version.insert(config_version, ids);

        Ok(DeployOutcome::Deployed {
            config_version,
            jobs: count,
        })
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobDefinition>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn jobs_for_version(
        &self,
        config_version: ConfigVersion,
    ) -> Result<Vec<JobDefinition>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs_by_version
            .get(&config_version)
            .map(|ids| ids.iter().filter_map(|id| state.jobs.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn create_tasks(
        &self,
        tasks: Vec<NewTask>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CreatedTask>, StoreError> {
        let mut state = self.state.lock().await;
        for task in &tasks {
            if !state.jobs.contains_key(&task.job_id) {
                return Err(StoreError::UnknownJob(task.job_id));
            }
        }
        Ok(tasks.into_iter().map(|t| state.insert_task(t, now)).collect())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn claim_task(
        &self,
        task_id: TaskId,
        lease: Lease,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, StoreError> {
        let mut state = self.state.lock().await;

        let Some(task) = state.tasks.get(&task_id) else {
            return Ok(ClaimResult::NotClaimed(NotClaimedReason::NotFound));
        };
        let reason = match task.status {
            TaskStatus::Queued if state.withheld(task) => Some(NotClaimedReason::Withheld),
            TaskStatus::Queued => None,
            TaskStatus::Running => Some(NotClaimedReason::AlreadyRunning),
            TaskStatus::Failed if task.next_retry_at.is_some() => Some(NotClaimedReason::RetryPending),
            TaskStatus::Failed | TaskStatus::Completed | TaskStatus::Canceled => {
                Some(NotClaimedReason::Terminal)
            }
        };
        if let Some(reason) = reason {
            return Ok(ClaimResult::NotClaimed(reason));
        }

        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::Inconsistent(format!("task {task_id} vanished")))?;
        task.claim(lease, now);
        Ok(ClaimResult::Claimed(task.clone()))
    }

    async fn heartbeat_task(
        &self,
        fence: &Fence,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, StoreError> {
        let mut state = self.state.lock().await;

        let Some(task) = state.tasks.get_mut(&fence.task_id) else {
            return Ok(HeartbeatOutcome::Rejected {
                violation: FenceViolation::NotFound,
            });
        };
        if let Err(violation) = check_fence(task, fence) {
            return Ok(HeartbeatOutcome::Rejected { violation });
        }
        if task.lease_expired(now) {
            return Ok(HeartbeatOutcome::Rejected {
                violation: FenceViolation::LeaseExpired,
            });
        }

        task.extend_lease(expires_at, now);
        Ok(HeartbeatOutcome::Extended {
            lease_expires_at: expires_at,
        })
    }

    async fn complete_task(
        &self,
        commit: CompletionCommit,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let fence = commit.fence;

        let Some(task) = state.tasks.get(&fence.task_id) else {
            return Ok(CompleteOutcome::fenced(FenceViolation::NotFound));
        };
        if let Err(violation) = check_fence(task, &fence) {
            return Ok(CompleteOutcome::fenced(violation));
        }
        let trigger = task.trigger.clone();
        let attributed = task.stream.clone();

        match commit.outcome {
            CommitOutcome::Succeeded {
                publications,
                events,
            } => {
                // Reconcile every publication before touching anything.
                let mut inserts = Vec::new();
                let mut published = Vec::new();
                for publication in publications {
                    match reconcile(state.versions.get(&publication.version_id), &publication) {
                        Reconciliation::Insert => {
                            published.push(publication.version_id.clone());
                            inserts.push(publication);
                        }
                        Reconciliation::Identical => published.push(publication.version_id.clone()),
                        Reconciliation::Divergent { existing_hash } => {
                            return Ok(CompleteOutcome::Rejected(Rejection::Divergent {
                                version_id: publication.version_id,
                                existing_hash,
                                offered_hash: publication.content_hash,
                            }));
                        }
                    }
                }

                for publication in inserts {
                    state.insert_version(publication, fence.attempt, now);
                }

                for event in &events {
                    let record = state.stream_mut(&event.source.stream, now);
                    if record.generation == event.source.generation {
                        record.advance_cursor(event.span.high_water(), now);
                    }
                }
                if let TaskTrigger::Range { stream, range } = &trigger {
                    state.stream_mut(stream, now).advance_cursor(range.end, now);
                }

                let routed_events = events.len();
                for event in events {
                    state.push_outbox(
                        OutboxEffect::RouteEvent {
                            event,
                            source_task: fence.task_id,
                        },
                        now,
                    );
                }

                let task = state
                    .tasks
                    .get_mut(&fence.task_id)
                    .ok_or_else(|| StoreError::Inconsistent(format!("task {} vanished", fence.task_id)))?;
                task.mark_completed(now);

                debug!(task_id = %fence.task_id, attempt = fence.attempt, "task completed");
                Ok(CompleteOutcome::Accepted(CompletionReceipt {
                    task_id: fence.task_id,
                    attempt: fence.attempt,
                    status: TaskStatus::Completed,
                    published,
                    routed_events,
                    next_retry_at: None,
                }))
            }
            CommitOutcome::Failed { error, retryable } => {
                let task = state
                    .tasks
                    .get_mut(&fence.task_id)
                    .ok_or_else(|| StoreError::Inconsistent(format!("task {} vanished", fence.task_id)))?;
                task.mark_failed(error, retryable, now);
                let receipt = CompletionReceipt {
                    task_id: fence.task_id,
                    attempt: fence.attempt,
                    status: task.status,
                    published: Vec::new(),
                    routed_events: 0,
                    next_retry_at: task.next_retry_at,
                };
                let last_error = task.last_error.clone();
                state.note_stream_error(attributed, last_error, now);
                Ok(CompleteOutcome::Accepted(receipt))
            }
        }
    }

    async fn cancel_task(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<CancelOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(CancelOutcome::NotFound);
        };
        if task.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal {
                status: task.status,
            });
        }
        task.cancel(now);
        Ok(CancelOutcome::Canceled)
    }

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut expired: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running && t.lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|t| (t.lease.as_ref().map(|l| l.expires_at), t.task_id));
        expired.truncate(limit);
        Ok(expired)
    }

    async fn expire_lease(&self, fence: &Fence, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&fence.task_id) else {
            return Ok(false);
        };
        if check_fence(task, fence).is_err() || !task.lease_expired(now) {
            return Ok(false);
        }

        let detail = match task.lease.as_ref() {
            Some(lease) => format!(
                "lease held by {} expired at {}",
                lease.worker_id,
                lease.expires_at.to_rfc3339()
            ),
            None => "lease expired".to_string(),
        };
        task.mark_failed(ErrorInfo::new(ErrorCategory::LeaseExpired, detail), true, now);
        let attributed = task.stream.clone();
        let last_error = task.last_error.clone();
        state.note_stream_error(attributed, last_error, now);
        Ok(true)
    }

    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut due: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed && t.next_retry_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|t| (t.next_retry_at, t.task_id));
        due.truncate(limit);
        Ok(due)
    }

    async fn requeue_task(
        &self,
        task_id: TaskId,
        expected_attempt: u32,
        next_backoff_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        let due = task.status == TaskStatus::Failed
            && task.attempt == expected_attempt
            && task.next_retry_at.is_some_and(|at| at <= now);
        if !due {
            return Ok(false);
        }

        task.requeue(next_backoff_ms, now);
        let attempt = task.attempt;
        state.push_outbox(OutboxEffect::WakeUp { task_id, attempt }, now);
        Ok(true)
    }

    async fn pull_outbox(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut blocked: HashSet<&str> = HashSet::new();
        let mut rows = Vec::new();

        for entry in state.pending_outbox.iter().filter_map(|id| state.outbox.get(id)) {
            if rows.len() >= limit {
                break;
            }
            if blocked.contains(entry.partition.as_str()) {
                continue;
            }
            if entry.available_at > now {
                // A deferred head blocks the rest of its partition.
                blocked.insert(entry.partition.as_str());
                continue;
            }
            rows.push(entry.clone());
        }
        Ok(rows)
    }

    async fn complete_outbox(
        &self,
        outbox_id: u64,
        children: Vec<NewTask>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CreatedTask>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.outbox.get(&outbox_id) else {
            return Err(StoreError::Inconsistent(format!("outbox row {outbox_id} not found")));
        };
        if entry.status == OutboxStatus::Done {
            // Another drainer got there first.
            return Ok(Vec::new());
        }
        for child in &children {
            if !state.jobs.contains_key(&child.job_id) {
                return Err(StoreError::UnknownJob(child.job_id));
            }
        }

        let admitted: Vec<NewTask> = children
            .into_iter()
            .filter(|child| state.routable(child))
            .collect();
        let created = admitted
            .into_iter()
            .map(|child| state.insert_task(child, now))
            .collect();
        if let Some(entry) = state.outbox.get_mut(&outbox_id) {
            entry.status = OutboxStatus::Done;
            entry.done_at = Some(now);
        }
        state.pending_outbox.remove(&outbox_id);
        Ok(created)
    }

    async fn prune_outbox(&self, done_before: DateTime<Utc>, limit: usize) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let expired: Vec<u64> = state
            .outbox
            .values()
            .filter(|entry| entry.done_at.is_some_and(|done_at| done_at < done_before))
            .map(|entry| entry.id)
            .take(limit)
            .collect();
        for id in &expired {
            state.outbox.remove(id);
        }
        Ok(expired.len())
    }

    async fn defer_outbox(
        &self,
        outbox_id: u64,
        available_at: DateTime<Utc>,
        error: Option<String>,
        failed: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.outbox.get_mut(&outbox_id) else {
            return Err(StoreError::Inconsistent(format!("outbox row {outbox_id} not found")));
        };
        if entry.status == OutboxStatus::Done {
            return Ok(());
        }
        entry.available_at = available_at;
        if failed {
            entry.attempts += 1;
            entry.last_error = error;
        }
        Ok(())
    }

    async fn publish_version(
        &self,
        fence: &Fence,
        publication: Publication,
        now: DateTime<Utc>,
    ) -> Result<PublishOutcome, StoreError> {
        let mut state = self.state.lock().await;

        let Some(task) = state.tasks.get(&fence.task_id) else {
            return Ok(PublishOutcome::Rejected {
                reason: format!("task {} not found", fence.task_id),
            });
        };
        if let Err(violation) = check_fence(task, fence) {
            return Ok(PublishOutcome::Rejected {
                reason: format!("fenced: {violation:?}"),
            });
        }

        match reconcile(state.versions.get(&publication.version_id), &publication) {
            Reconciliation::Insert => Ok(PublishOutcome::Inserted {
                version: state.insert_version(publication, fence.attempt, now),
            }),
            Reconciliation::Identical => {
                let version = state
                    .versions
                    .get(&publication.version_id)
                    .cloned()
                    .ok_or_else(|| StoreError::Inconsistent("version vanished".into()))?;
                Ok(PublishOutcome::AlreadyPublished { version })
            }
            Reconciliation::Divergent { existing_hash } => Ok(PublishOutcome::Conflict {
                version_id: publication.version_id,
                existing_hash,
                offered_hash: publication.content_hash,
            }),
        }
    }

    async fn get_version(&self, version_id: &VersionId) -> Result<Option<DatasetVersion>, StoreError> {
        Ok(self.state.lock().await.versions.get(version_id).cloned())
    }

    async fn latest_version(&self, dataset: &DatasetName) -> Result<Option<DatasetVersion>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .latest_versions
            .get(dataset)
            .and_then(|id| state.versions.get(id))
            .cloned())
    }

    async fn upsert_stream(
        &self,
        stream: &StreamId,
        schedule: Option<ScheduleSpec>,
        now: DateTime<Utc>,
    ) -> Result<StreamRecord, StoreError> {
        let mut state = self.state.lock().await;
        let record = state.stream_mut(stream, now);
        if let Some(schedule) = schedule {
            record.schedule = Some(schedule);
            record.updated_at = now;
        }
        Ok(record.clone())
    }

    async fn get_stream(&self, stream: &StreamId) -> Result<Option<StreamRecord>, StoreError> {
        Ok(self.state.lock().await.streams.get(stream).cloned())
    }

    async fn list_streams(&self) -> Result<Vec<StreamRecord>, StoreError> {
        Ok(self.state.lock().await.streams.values().cloned().collect())
    }

    async fn set_stream_paused(&self, stream: &StreamId, paused: bool) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.streams.get_mut(stream) {
            Some(record) => {
                record.paused = paused;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn bump_generation(&self, stream: &StreamId, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let record = state.stream_mut(stream, now);
        record.generation += 1;
        record.updated_at = now;
        Ok(record.generation)
    }

    async fn record_stale_event(&self, event: StaleEvent) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.stale_events.iter().any(|e| e.event == event.event) {
            state.stale_events.push(event);
        }
        Ok(())
    }

    async fn stale_events(&self, stream: &StreamId) -> Result<Vec<StaleEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .stale_events
            .iter()
            .filter(|e| &e.event.source.stream == stream)
            .cloned()
            .collect())
    }

    async fn schedule_range(
        &self,
        stream: &StreamId,
        range: RangeSpan,
        task: NewTask,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let key = (stream.clone(), range);
        if let Some(existing) = state.ranges.get(&key) {
            return Ok(ScheduleOutcome::AlreadyScheduled {
                task_id: existing.task_id,
            });
        }
        if !state.jobs.contains_key(&task.job_id) {
            return Err(StoreError::UnknownJob(task.job_id));
        }

        let created = state.insert_task(task, now);
        state.ranges.insert(
            key,
            ScheduledRange {
                stream: stream.clone(),
                range,
                task_id: created.task_id,
                created_at: now,
            },
        );
        state.stream_mut(stream, now).advance_planned(range.end, now);

        Ok(ScheduleOutcome::Scheduled {
            task_id: created.task_id,
        })
    }

    async fn scheduled_ranges(&self, stream: &StreamId) -> Result<Vec<ScheduledRange>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .ranges
            .values()
            .filter(|r| &r.stream == stream)
            .cloned()
            .collect())
    }

    async fn pointer_snapshot(&self) -> Result<PointerSnapshot, StoreError> {
        Ok(self.state.lock().await.snapshot())
    }

    async fn apply_cutover(
        &self,
        request: CutoverRequest,
        _now: DateTime<Utc>,
    ) -> Result<CutoverOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(pending) = &state.pending_cutover {
            return Ok(CutoverOutcome::rejected(CutoverRejection::PendingCutoverExists {
                cutover_id: pending.cutover_id,
            }));
        }
        if let Some(rejection) = state.validate_cutover(&request) {
            return Ok(CutoverOutcome::rejected(rejection));
        }
        Ok(CutoverOutcome::Committed {
            snapshot: state.commit_pointers(&request),
        })
    }

    async fn rollback_cutover(&self, _now: DateTime<Utc>) -> Result<CutoverOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(pending) = &state.pending_cutover {
            return Ok(CutoverOutcome::rejected(CutoverRejection::PendingCutoverExists {
                cutover_id: pending.cutover_id,
            }));
        }
        let Some(prior) = state.pointer_history.pop() else {
            return Ok(CutoverOutcome::rejected(CutoverRejection::NothingToRollBack));
        };
        state.pointers = prior;
        state.pointer_revision += 1;
        Ok(CutoverOutcome::Committed {
            snapshot: state.snapshot(),
        })
    }

    async fn begin_cutover(&self, pending: PendingCutover) -> Result<CutoverOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = &state.pending_cutover {
            return Ok(CutoverOutcome::rejected(CutoverRejection::PendingCutoverExists {
                cutover_id: existing.cutover_id,
            }));
        }
        if let Some(rejection) = state.validate_cutover(&pending.request) {
            return Ok(CutoverOutcome::rejected(rejection));
        }
        state.pending_cutover = Some(pending.clone());
        Ok(CutoverOutcome::Staged { pending })
    }

    async fn pending_cutover(&self) -> Result<Option<PendingCutover>, StoreError> {
        Ok(self.state.lock().await.pending_cutover.clone())
    }

    async fn resolve_cutover(
        &self,
        cutover_id: CutoverId,
        commit: bool,
        now: DateTime<Utc>,
    ) -> Result<CutoverOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let pending = match state.pending_cutover.take() {
            Some(p) if p.cutover_id == cutover_id => p,
            other => {
                state.pending_cutover = other;
                return Ok(CutoverOutcome::rejected(CutoverRejection::NoSuchPendingCutover {
                    cutover_id,
                }));
            }
        };

        if commit {
            if let Some(rejection) = state.validate_cutover(&pending.request) {
                state.pending_cutover = Some(pending);
                return Ok(CutoverOutcome::rejected(rejection));
            }
            let prior = state.pointers.config_version;
            let snapshot = state.commit_pointers(&pending.request);
            if let (Some(prior), Some(target)) = (prior, pending.target_version())
                && prior != target
            {
                state.cancel_superseded(prior, target, now);
            }
            return Ok(CutoverOutcome::Committed { snapshot });
        }

        let mut canceled_tasks = Vec::new();
        let active = state.pointers.config_version;
        if let Some(target) = pending.target_version()
            && active != Some(target)
        {
            for task in state.tasks.values_mut() {
                if task.config_version == target && task.status == TaskStatus::Queued {
                    task.cancel(now);
                    canceled_tasks.push(task.task_id);
                }
            }
        }
        canceled_tasks.sort();

        Ok(CutoverOutcome::Abandoned {
            cutover_id,
            canceled_tasks,
        })
    }

    async fn task_counts(&self) -> Result<TaskCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = TaskCounts::default();
        for task in state.tasks.values() {
            counts.record(task);
        }
        Ok(counts)
    }

    async fn stream_in_flight(&self, stream: &StreamId) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.stream.as_ref() == Some(stream) && !t.is_terminal())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobName, JobSpec, LeaseToken, Span, StreamRef, WorkerId};
    use crate::domain::{OutputEvent, VersionDescriptor};
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    async fn store_with_job() -> (InMemoryStateStore, JobDefinition) {
        let store = InMemoryStateStore::new();
        let job = JobDefinition {
            job_id: JobId::from_ulid(Ulid::new()),
            config_version: ConfigVersion(1),
            spec: JobSpec::new("ingest", "ingest.v1").publishes("raw", "raw_events"),
        };
        store
            .deploy_jobs(ConfigVersion(1), vec![job.clone()])
            .await
            .unwrap();
        (store, job)
    }

    fn new_task(job: &JobDefinition, key: &str) -> NewTask {
        NewTask {
            task_id: TaskId::from_ulid(Ulid::new()),
            job_id: job.job_id,
            job_name: JobName::new("ingest"),
            config_version: job.config_version,
            trigger: TaskTrigger::Manual {
                input: serde_json::Value::Null,
            },
            dedupe_key: key.into(),
            stream: Some(StreamId::new("raw")),
            max_attempts: 2,
            retry_backoff_ms: 1_000,
        }
    }

    fn lease(expires_at: DateTime<Utc>) -> Lease {
        Lease {
            token: LeaseToken::from_ulid(Ulid::new()),
            worker_id: WorkerId::new("w1"),
            expires_at,
        }
    }

    async fn claimed(store: &InMemoryStateStore, task_id: TaskId) -> Fence {
        match store
            .claim_task(task_id, lease(t0() + Duration::seconds(30)), t0())
            .await
            .unwrap()
        {
            ClaimResult::Claimed(task) => task.fence().unwrap(),
            other => panic!("expected claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_per_dedupe_key() {
        let (store, job) = store_with_job().await;
        let first = store.create_tasks(vec![new_task(&job, "a")], t0()).await.unwrap();
        let second = store.create_tasks(vec![new_task(&job, "a")], t0()).await.unwrap();

        assert!(first[0].created);
        assert!(!second[0].created);
        assert_eq!(first[0].task_id, second[0].task_id);
        // one wake-up row only
        assert_eq!(store.outbox_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn done_rows_leave_the_pull_and_are_pruned_by_age() {
        let (store, job) = store_with_job().await;
        let tasks = vec![new_task(&job, "a"), new_task(&job, "b"), new_task(&job, "c")];
        store.create_tasks(tasks, t0()).await.unwrap();
        let rows = store.pull_outbox(t0(), 10).await.unwrap();
        assert_eq!(rows.len(), 3);

        let done_at = t0() + Duration::seconds(10);
        store.complete_outbox(rows[0].id, Vec::new(), done_at).await.unwrap();
        let pending: Vec<u64> = store.pull_outbox(done_at, 10).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(pending, vec![rows[1].id, rows[2].id]);

        assert_eq!(store.prune_outbox(done_at, 10).await.unwrap(), 0);
        assert_eq!(store.prune_outbox(done_at + Duration::seconds(1), 10).await.unwrap(), 1);
        let left: Vec<u64> = store.outbox_entries().await.iter().map(|r| r.id).collect();
        assert_eq!(left, pending);
    }

    #[tokio::test]
    async fn redeploy_is_noop_or_conflict() {
        let (store, job) = store_with_job().await;
        let same = JobDefinition {
            job_id: JobId::from_ulid(Ulid::new()),
            ..job.clone()
        };
        assert_eq!(
            store.deploy_jobs(ConfigVersion(1), vec![same]).await.unwrap(),
            DeployOutcome::Unchanged {
                config_version: ConfigVersion(1)
            }
        );

        let mut changed = job.clone();
        changed.spec.operator = "ingest.v2".into();
        assert_eq!(
            store.deploy_jobs(ConfigVersion(1), vec![changed]).await.unwrap(),
            DeployOutcome::Conflict {
                config_version: ConfigVersion(1)
            }
        );
    }

    #[tokio::test]
    async fn second_claim_is_rejected() {
        let (store, job) = store_with_job().await;
        let created = store.create_tasks(vec![new_task(&job, "a")], t0()).await.unwrap();
        let task_id = created[0].task_id;

        claimed(&store, task_id).await;
        let again = store
            .claim_task(task_id, lease(t0() + Duration::seconds(30)), t0())
            .await
            .unwrap();
        assert_eq!(again, ClaimResult::NotClaimed(NotClaimedReason::AlreadyRunning));
    }

    #[tokio::test]
    async fn divergent_publication_rejects_whole_completion() {
        let (store, job) = store_with_job().await;
        let task_id = store.create_tasks(vec![new_task(&job, "a")], t0()).await.unwrap()[0].task_id;
        let fence = claimed(&store, task_id).await;

        let descriptor = |storage_ref: &str| VersionDescriptor {
            storage_ref: storage_ref.into(),
            config_hash: "c".into(),
            span: Span::range(0, 10),
            producing_task: task_id,
        };
        let first = Publication::new(DatasetName::new("raw_events"), descriptor("s3://a"));
        assert!(matches!(
            store.publish_version(&fence, first, t0()).await.unwrap(),
            PublishOutcome::Inserted { .. }
        ));

        let outcome = store
            .complete_task(
                CompletionCommit {
                    fence: fence.clone(),
                    outcome: CommitOutcome::Succeeded {
                        publications: vec![Publication::new(
                            DatasetName::new("raw_events"),
                            descriptor("s3://b"),
                        )],
                        events: vec![OutputEvent::new(StreamRef::new("raw", 0), Span::range(0, 10))],
                    },
                },
                t0(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, CompleteOutcome::Rejected(Rejection::Divergent { .. })));
        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(store.get_stream(&StreamId::new("raw")).await.unwrap().is_none());
        // only the original wake-up row
        assert_eq!(store.outbox_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn expire_then_requeue_bumps_attempt() {
        let (store, job) = store_with_job().await;
        let task_id = store.create_tasks(vec![new_task(&job, "a")], t0()).await.unwrap()[0].task_id;
        let fence = claimed(&store, task_id).await;

        let later = t0() + Duration::seconds(31);
        assert_eq!(store.list_expired_leases(later, 10).await.unwrap().len(), 1);
        assert!(store.expire_lease(&fence, later).await.unwrap());
        // second reaper loses the race
        assert!(!store.expire_lease(&fence, later).await.unwrap());

        let retry_at = later + Duration::seconds(1);
        assert!(store.list_due_retries(later, 10).await.unwrap().is_empty());
        assert_eq!(store.list_due_retries(retry_at, 10).await.unwrap().len(), 1);
        assert!(store.requeue_task(task_id, 1, 2_000, retry_at).await.unwrap());
        assert!(!store.requeue_task(task_id, 1, 2_000, retry_at).await.unwrap());

        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.attempt, 2);
        assert_eq!(task.status, TaskStatus::Queued);

        let stream = store.get_stream(&StreamId::new("raw")).await.unwrap().unwrap();
        assert_eq!(stream.last_error.unwrap().category, ErrorCategory::LeaseExpired);
    }

    #[tokio::test]
    async fn deferred_head_blocks_its_partition() {
        let (store, job) = store_with_job().await;
        let a = store.create_tasks(vec![new_task(&job, "a")], t0()).await.unwrap()[0].task_id;
        store.create_tasks(vec![new_task(&job, "b")], t0()).await.unwrap();

        // a second row for task a, same partition
        store.state.lock().await.push_outbox(
            OutboxEffect::WakeUp {
                task_id: a,
                attempt: 1,
            },
            t0(),
        );

        let rows = store.pull_outbox(t0(), 10).await.unwrap();
        assert_eq!(rows.len(), 3);

        store
            .defer_outbox(rows[0].id, t0() + Duration::seconds(5), Some("down".into()), true)
            .await
            .unwrap();
        let rows = store.pull_outbox(t0(), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_ne!(rows[0].partition, a.to_string());
    }

    #[tokio::test]
    async fn rollback_restores_prior_set() {
        let (store, _job) = store_with_job().await;
        store
            .apply_cutover(CutoverRequest::new().config_version(ConfigVersion(1)), t0())
            .await
            .unwrap();
        let before = store.pointer_snapshot().await.unwrap().set;

        let rejected = store
            .apply_cutover(CutoverRequest::new().config_version(ConfigVersion(9)), t0())
            .await
            .unwrap();
        assert!(matches!(
            rejected,
            CutoverOutcome::Rejected {
                rejection: CutoverRejection::UnknownConfigVersion { .. }
            }
        ));

        assert_eq!(before.config_version, Some(ConfigVersion(1)));

        assert!(store.rollback_cutover(t0()).await.unwrap().is_committed());
        assert_eq!(
            store.rollback_cutover(t0()).await.unwrap(),
            CutoverOutcome::rejected(CutoverRejection::NothingToRollBack)
        );
        let after = store.pointer_snapshot().await.unwrap();
        assert_eq!(after.set, PointerSet::default());
        assert_eq!(after.revision, 2);
    }
}
