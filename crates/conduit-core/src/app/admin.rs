//! Admin - 運用者向けの操作面（deploy, 手動 trigger, stream 操作, status）

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{
    CancelOutcome, ConfigVersion, CutoverOutcome, CutoverRequest, ErrorInfo, JobDefinition, JobName,
    JobSpec, PendingCutover, PointerSnapshot, ScheduleSpec, StreamId, StreamRecord, TaskId,
    TaskTrigger,
};
use crate::error::ConduitError;
use crate::observability::TaskCounts;
use crate::ports::{Clock, CreatedTask, DeployOutcome, IdGenerator, StateStore, StoreError};

use super::cutover::CutoverCoordinator;
use super::tasks::TaskFactory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployReport {
    pub outcome: DeployOutcome,
    /// The deploy was the first one and became the active config version.
    pub activated: bool,
}

/// Progress of one stream as shown to operators. Errors are redacted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub stream: StreamId,
    pub generation: u64,
    pub cursor: Option<i64>,
    pub planned_through: Option<i64>,
    pub in_flight: usize,
    pub paused: bool,
    pub last_error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherStatus {
    pub tasks: TaskCounts,
    pub streams: Vec<StreamStatus>,
    pub pointers: PointerSnapshot,
    pub pending_cutover: Option<PendingCutover>,
}

#[derive(Clone)]
pub struct Admin {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    tasks: TaskFactory,
    cutover: CutoverCoordinator,
}

impl Admin {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        tasks: TaskFactory,
        cutover: CutoverCoordinator,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            tasks,
            cutover,
        }
    }

    /// Store the job set of `config_version`.
    ///
    /// The very first deploy is activated right away; later versions go live
    /// through the cutover coordinator.
    pub async fn deploy(
        &self,
        config_version: ConfigVersion,
        specs: Vec<JobSpec>,
    ) -> Result<DeployReport, ConduitError> {
        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.clone()) {
                return Err(ConduitError::Other(format!(
                    "job {} appears twice in config version {config_version}",
                    spec.name
                )));
            }
        }

        let jobs = specs
            .into_iter()
            .map(|spec| JobDefinition {
                job_id: self.ids.job_id(),
                config_version,
                spec,
            })
            .collect();
        let outcome = self.store.deploy_jobs(config_version, jobs).await?;

        let mut activated = false;
        if matches!(outcome, DeployOutcome::Deployed { .. })
            && self.store.pointer_snapshot().await?.set.config_version.is_none()
        {
            let cut = self
                .cutover
                .cutover(CutoverRequest::new().config_version(config_version))
                .await?;
            activated = matches!(cut, CutoverOutcome::Committed { .. });
        }

        info!(%config_version, ?outcome, activated, "config deployed");
        Ok(DeployReport { outcome, activated })
    }

    /// Create a task for `job` in the active config version.
    ///
    /// With a dedupe key, repeated triggers return the first task.
    pub async fn trigger(
        &self,
        job: &JobName,
        input: serde_json::Value,
        dedupe_key: Option<String>,
    ) -> Result<CreatedTask, ConduitError> {
        let active = self
            .store
            .pointer_snapshot()
            .await?
            .set
            .config_version
            .ok_or(ConduitError::NoActiveConfig)?;
        let definition = self
            .store
            .jobs_for_version(active)
            .await?
            .into_iter()
            .find(|d| d.name() == job)
            .ok_or_else(|| ConduitError::UnknownJob {
                job: job.clone(),
                config_version: active,
            })?;

        let mut task = self
            .tasks
            .build(&definition, TaskTrigger::Manual { input }, String::new());
        task.dedupe_key = match dedupe_key {
            Some(key) => format!("manual:{key}"),
            None => format!("manual:{}", task.task_id),
        };

        let created = self
            .store
            .create_tasks(vec![task], self.clock.now())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Inconsistent("create_tasks returned nothing".into()))?;
        info!(%job, task_id = %created.task_id, created = created.created, "manual trigger");
        Ok(created)
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome, ConduitError> {
        let outcome = self.store.cancel_task(task_id, self.clock.now()).await?;
        info!(%task_id, ?outcome, "cancel requested");
        Ok(outcome)
    }

    /// Create or reschedule a stream. Changing an existing schedule starts a
    /// new generation, so events cut under the old one are not routed.
    pub async fn apply_stream(
        &self,
        stream: &StreamId,
        schedule: ScheduleSpec,
    ) -> Result<StreamRecord, ConduitError> {
        if schedule.width <= 0 {
            return Err(ConduitError::InvalidSchedule {
                stream: stream.clone(),
                reason: format!("width must be positive, got {}", schedule.width),
            });
        }

        let now = self.clock.now();
        let previous = self.store.get_stream(stream).await?.and_then(|r| r.schedule);
        self.store.upsert_stream(stream, Some(schedule.clone()), now).await?;

        if previous.is_some_and(|p| p != schedule) {
            let generation = self.store.bump_generation(stream, now).await?;
            info!(%stream, generation, "stream rescheduled, new generation");
        }

        self.store
            .get_stream(stream)
            .await?
            .ok_or_else(|| ConduitError::UnknownStream(stream.clone()))
    }

    pub async fn pause_stream(&self, stream: &StreamId) -> Result<(), ConduitError> {
        self.set_paused(stream, true).await
    }

    pub async fn resume_stream(&self, stream: &StreamId) -> Result<(), ConduitError> {
        self.set_paused(stream, false).await
    }

    pub async fn stream_status(&self, stream: &StreamId) -> Result<StreamStatus, ConduitError> {
        let record = self
            .store
            .get_stream(stream)
            .await?
            .ok_or_else(|| ConduitError::UnknownStream(stream.clone()))?;
        self.status_of(record).await
    }

    pub async fn task_counts(&self) -> Result<TaskCounts, ConduitError> {
        Ok(self.store.task_counts().await?)
    }

    /// Everything at once, for dashboards and the CLI.
    pub async fn status(&self) -> Result<DispatcherStatus, ConduitError> {
        let mut streams = Vec::new();
        for record in self.store.list_streams().await? {
            streams.push(self.status_of(record).await?);
        }
        streams.sort_by(|a, b| a.stream.cmp(&b.stream));

        Ok(DispatcherStatus {
            tasks: self.store.task_counts().await?,
            streams,
            pointers: self.store.pointer_snapshot().await?,
            pending_cutover: self.store.pending_cutover().await?,
        })
    }

    async fn set_paused(&self, stream: &StreamId, paused: bool) -> Result<(), ConduitError> {
        if !self.store.set_stream_paused(stream, paused).await? {
            return Err(ConduitError::UnknownStream(stream.clone()));
        }
        info!(%stream, paused, "stream pause toggled");
        Ok(())
    }

    async fn status_of(&self, record: StreamRecord) -> Result<StreamStatus, ConduitError> {
        let in_flight = self.store.stream_in_flight(&record.stream).await?;
        Ok(StreamStatus {
            stream: record.stream,
            generation: record.generation,
            cursor: record.cursor,
            planned_through: record.planned_through,
            in_flight,
            paused: record.paused,
            last_error: record.last_error.as_ref().map(ErrorInfo::redacted),
        })
    }
}
