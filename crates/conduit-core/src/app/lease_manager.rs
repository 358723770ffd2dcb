//! LeaseManager - executor 向けの claim / heartbeat / complete
//!
//! # Fencing
//! `claim` 以降のすべての更新は `(task_id, attempt, lease_token)` を持ち回ります。
//! store は書き込みと同じトランザクション内でこの三つ組を再検証するので、
//! reap された worker が後続の attempt を上書きすることはありません。
//!
//! # Completion の形
//! completion は store に渡す前に job に対して検証されます:
//! - 失敗した completion は output も event も持たない
//! - dataset に紐づく job は、その dataset の output をちょうど 1 つ publish する
//! - event は job 自身の output stream に、publish した span で出す

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::domain::{
    ClaimGrant, ClaimOutcome, ClaimResult, CommitOutcome, CompleteOutcome, CompletionCommit,
    CompletionRequest, CompletionStatus, ErrorCategory, ErrorInfo, Fence, HeartbeatOutcome,
    JobDefinition, Lease, NotClaimedReason, Publication, Rejection, TaskId, TaskRecord, WorkerId,
    check_fence,
};
use crate::error::ConduitError;
use crate::ports::{Clock, IdGenerator, StateStore, StoreError};

use super::payload::assemble_payload;
use super::registry::DatasetVersionRegistry;

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    registry: DatasetVersionRegistry,
    lease_ttl: Duration,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        registry: DatasetVersionRegistry,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            registry,
            lease_ttl,
        }
    }

    /// Take a lease on a queued task and hand back everything needed to run it.
    #[tracing::instrument(skip(self, worker_id), fields(worker = %worker_id))]
    pub async fn claim(&self, task_id: TaskId, worker_id: WorkerId) -> Result<ClaimOutcome, ConduitError> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(ClaimOutcome::NotClaimed {
                reason: NotClaimedReason::NotFound,
            });
        };
        let job = self.job_of(&task).await?;

        let now = self.clock.now();
        let lease = Lease {
            token: self.ids.lease_token(),
            worker_id,
            expires_at: expiry(now, self.ttl_for(&job)),
        };

        match self.store.claim_task(task_id, lease, now).await? {
            ClaimResult::Claimed(task) => {
                let Some(lease) = task.lease.clone() else {
                    return Err(StoreError::Inconsistent(format!("claimed task {task_id} has no lease")).into());
                };
                let payload = assemble_payload(self.store.as_ref(), &task, &job).await?;
                info!(attempt = task.attempt, job = %job.name(), "task claimed");
                Ok(ClaimOutcome::Claimed(ClaimGrant {
                    attempt: task.attempt,
                    lease_token: lease.token,
                    lease_expires_at: lease.expires_at,
                    payload,
                }))
            }
            ClaimResult::NotClaimed(reason) => {
                debug!(?reason, "claim refused");
                Ok(ClaimOutcome::NotClaimed { reason })
            }
        }
    }

    /// Extend the lease by the job's TTL. Rejected once the lease has lapsed.
    pub async fn heartbeat(&self, fence: &Fence) -> Result<HeartbeatOutcome, ConduitError> {
        let ttl = match self.store.get_task(fence.task_id).await? {
            Some(task) => self.ttl_for(&self.job_of(&task).await?),
            None => self.lease_ttl,
        };
        let now = self.clock.now();
        let outcome = self.store.heartbeat_task(fence, expiry(now, ttl), now).await?;
        if let HeartbeatOutcome::Rejected { violation } = &outcome {
            warn!(task_id = %fence.task_id, attempt = fence.attempt, ?violation, "heartbeat rejected");
        }
        Ok(outcome)
    }

    /// Apply an executor's completion, fenced and validated.
    #[tracing::instrument(skip(self, request), fields(task_id = %request.task_id, attempt = request.attempt))]
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompleteOutcome, ConduitError> {
        let fence = request.fence();

        // Stale callers hear about the fence, not about the shape of their request.
        let Some(task) = self.store.get_task(fence.task_id).await? else {
            return Ok(CompleteOutcome::fenced(crate::domain::FenceViolation::NotFound));
        };
        if let Err(violation) = check_fence(&task, &fence) {
            warn!(?violation, "stale completion rejected");
            return Ok(CompleteOutcome::fenced(violation));
        }
        let job = self.job_of(&task).await?;

        let outcome = match self.validate(&job, request) {
            Ok(outcome) => outcome,
            Err(reason) => {
                warn!(%reason, "malformed completion rejected");
                return Ok(CompleteOutcome::malformed(reason));
            }
        };

        let result = self
            .store
            .complete_task(CompletionCommit { fence, outcome }, self.clock.now())
            .await?;

        match &result {
            CompleteOutcome::Accepted(receipt) => {
                info!(status = ?receipt.status, published = receipt.published.len(), routed = receipt.routed_events, "completion accepted");
            }
            CompleteOutcome::Rejected(Rejection::Fenced { violation }) => {
                warn!(?violation, "stale completion rejected");
            }
            CompleteOutcome::Rejected(Rejection::Divergent {
                version_id,
                existing_hash,
                offered_hash,
            }) => {
                error!(%version_id, %existing_hash, %offered_hash, "divergent publication rejected");
            }
            CompleteOutcome::Rejected(Rejection::Malformed { .. }) => {}
        }
        Ok(result)
    }

    /// Read-only view of a task.
    pub async fn fetch(&self, task_id: TaskId) -> Result<Option<TaskRecord>, ConduitError> {
        Ok(self.store.get_task(task_id).await?)
    }

    fn validate(&self, job: &JobDefinition, request: CompletionRequest) -> Result<CommitOutcome, String> {
        let CompletionRequest {
            task_id,
            status,
            outputs,
            mut events,
            ..
        } = request;

        let (error, retryable) = match status {
            CompletionStatus::Failed { error, retryable } => (error, retryable),
            CompletionStatus::Succeeded => {
                let publications = self.publications(job, task_id, &outputs)?;

                match job.output_stream() {
                    None if !events.is_empty() => {
                        return Err(format!("job {} has no output stream but emitted {} events", job.name(), events.len()));
                    }
                    None => {}
                    Some(stream) => {
                        if let Some(event) = events.iter().find(|e| &e.source.stream != stream) {
                            return Err(format!(
                                "event on stream {} but job {} writes to {stream}",
                                event.source.stream,
                                job.name()
                            ));
                        }
                    }
                }

                if let Some(publication) = publications.first() {
                    for event in &mut events {
                        if event.span != publication.descriptor.span {
                            return Err(format!(
                                "event span {} does not match published span {}",
                                event.span, publication.descriptor.span
                            ));
                        }
                        match &event.version {
                            Some(version) if version != &publication.version_id => {
                                return Err(format!(
                                    "event names version {version}, completion publishes {}",
                                    publication.version_id
                                ));
                            }
                            _ => event.version = Some(publication.version_id.clone()),
                        }
                    }
                }

                return Ok(CommitOutcome::Succeeded { publications, events });
            }
        };

        if !outputs.is_empty() || !events.is_empty() {
            return Err("failed completion must not carry outputs or events".into());
        }
        Ok(CommitOutcome::Failed {
            error: ErrorInfo::new(ErrorCategory::OperatorFailure, error),
            retryable,
        })
    }

    fn publications(
        &self,
        job: &JobDefinition,
        task_id: TaskId,
        outputs: &[crate::domain::OutputRecord],
    ) -> Result<Vec<Publication>, String> {
        match job.output_dataset() {
            None if outputs.is_empty() => Ok(Vec::new()),
            None => Err(format!("job {} publishes no dataset but sent {} outputs", job.name(), outputs.len())),
            Some(dataset) => match outputs {
                [output] if &output.dataset == dataset => Ok(vec![self.registry.prepare(task_id, output)]),
                [output] => Err(format!("output for dataset {} but job publishes {dataset}", output.dataset)),
                _ => Err(format!("expected exactly one output for dataset {dataset}, got {}", outputs.len())),
            },
        }
    }

    async fn job_of(&self, task: &TaskRecord) -> Result<JobDefinition, ConduitError> {
        Ok(self
            .store
            .get_job(task.job_id)
            .await?
            .ok_or(StoreError::UnknownJob(task.job_id))?)
    }

    fn ttl_for(&self, job: &JobDefinition) -> Duration {
        job.spec.lease_ttl_ms.map_or(self.lease_ttl, Duration::from_millis)
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
