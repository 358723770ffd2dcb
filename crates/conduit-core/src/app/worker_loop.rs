//! WorkerLoop - in-process executor（pop→claim→operator 実行→complete）
//!
//! wake-up はヒントにすぎません。何が届いても仕事があるかは claim が決めます。
//! 重複や古い wake-up は `Skipped` で終わります。
//!
//! operator は heartbeat タイマーと並走します。heartbeat が拒否されたら
//! lease は失われているので、実行を打ち切り何も報告しません（`Abandoned`）。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{
    ClaimOutcome, CompleteOutcome, CompletionRequest, FenceViolation, HeartbeatOutcome,
    NotClaimedReason, OutputEvent, TaskId, WorkerId,
};
use crate::error::ConduitError;
use crate::ports::DeliveryQueue;
use crate::typed::{Produced, TypedRegistry};

use super::lease_manager::LeaseManager;
use super::pacer::{Pacer, sleep_or_shutdown};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "work", rename_all = "snake_case")]
pub enum WorkOutcome {
    Skipped {
        task_id: TaskId,
        reason: NotClaimedReason,
    },
    /// The lease was lost mid-run.
    Abandoned {
        task_id: TaskId,
        violation: FenceViolation,
    },
    Completed {
        task_id: TaskId,
        outcome: CompleteOutcome,
    },
}

#[derive(Clone)]
pub struct WorkerLoop {
    worker_id: WorkerId,
    leases: LeaseManager,
    queue: Arc<dyn DeliveryQueue>,
    operators: Arc<TypedRegistry>,
    namespace: String,
    pop_timeout: Duration,
    heartbeat_interval: Duration,
}

impl WorkerLoop {
    pub fn new(
        worker_id: WorkerId,
        leases: LeaseManager,
        queue: Arc<dyn DeliveryQueue>,
        operators: Arc<TypedRegistry>,
        namespace: impl Into<String>,
        pop_timeout: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            worker_id,
            leases,
            queue,
            operators,
            namespace: namespace.into(),
            pop_timeout,
            heartbeat_interval,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Wait up to the pop timeout for one wake-up and handle it.
    pub async fn run_once(&self) -> Result<Option<WorkOutcome>, ConduitError> {
        let Some(wake_up) = self.queue.pop(&self.namespace, self.pop_timeout).await? else {
            return Ok(None);
        };
        self.execute(wake_up.task_id).await.map(Some)
    }

    /// Claim and run one task.
    #[tracing::instrument(skip(self), fields(worker = %self.worker_id))]
    pub async fn execute(&self, task_id: TaskId) -> Result<WorkOutcome, ConduitError> {
        let grant = match self.leases.claim(task_id, self.worker_id.clone()).await? {
            ClaimOutcome::Claimed(grant) => grant,
            ClaimOutcome::NotClaimed { reason } => {
                return Ok(WorkOutcome::Skipped { task_id, reason });
            }
        };
        let fence = grant.fence();
        let payload = grant.payload;

        let Some(handler) = self.operators.get(&payload.operator) else {
            let request = CompletionRequest::failed(
                &fence,
                format!("no handler registered for operator {}", payload.operator),
                false,
            );
            let outcome = self.leases.complete(request).await?;
            return Ok(WorkOutcome::Completed { task_id, outcome });
        };

        let work = handler.handle_dyn(&payload);
        tokio::pin!(work);
        let start = tokio::time::Instant::now() + self.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(start, self.heartbeat_interval);

        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = heartbeat.tick() => match self.leases.heartbeat(&fence).await {
                    Ok(HeartbeatOutcome::Extended { .. }) => {}
                    Ok(HeartbeatOutcome::Rejected { violation }) => {
                        warn!(attempt = fence.attempt, ?violation, "lease lost, abandoning run");
                        return Ok(WorkOutcome::Abandoned { task_id, violation });
                    }
                    // Lease may still be valid; try again next tick.
                    Err(e) => warn!(error = %e, "heartbeat failed"),
                },
            }
        };

        let request = match result {
            Ok(produced) => success_request(&fence, &payload, produced),
            Err(e) => {
                debug!(error = %e, retryable = e.retryable, "operator failed");
                CompletionRequest::failed(&fence, e.message, e.retryable)
            }
        };
        let outcome = self.leases.complete(request).await?;
        Ok(WorkOutcome::Completed { task_id, outcome })
    }

    /// Handle wake-ups until shutdown. In-flight runs finish before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.worker_id, "worker started");
        let mut pacer = Pacer::new(self.pop_timeout);
        loop {
            if *shutdown.borrow() {
                break;
            }
            // Only the wait is raced against shutdown; a claimed task runs to completion.
            let popped = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                popped = self.queue.pop(&self.namespace, self.pop_timeout) => popped,
            };

            let delay = match popped {
                Ok(Some(wake_up)) => match self.execute(wake_up.task_id).await {
                    Ok(outcome) => {
                        debug!(?outcome, "wake-up handled");
                        pacer.after_success(true)
                    }
                    Err(e) => {
                        warn!(worker = %self.worker_id, error = %e, "task execution failed");
                        pacer.after_failure()
                    }
                },
                // pop already waited
                Ok(None) => Duration::ZERO,
                Err(e) => {
                    warn!(worker = %self.worker_id, error = %e, "queue pop failed");
                    pacer.after_failure()
                }
            };
            if sleep_or_shutdown(&mut shutdown, delay).await {
                break;
            }
        }
        info!(worker = %self.worker_id, "worker stopped");
    }
}

fn success_request(
    fence: &crate::domain::Fence,
    payload: &crate::domain::TaskPayload,
    produced: Produced,
) -> CompletionRequest {
    let Produced { outputs, events } = produced;

    let target = payload.output.as_ref().map(|o| o.stream.clone());
    let Some(stream) = target else {
        if !events.is_empty() {
            return CompletionRequest::failed(
                fence,
                format!("operator {} emitted events but the job has no output stream", payload.operator),
                false,
            );
        }
        return outputs
            .into_iter()
            .fold(CompletionRequest::succeeded(fence), CompletionRequest::output);
    };

    let request = outputs
        .into_iter()
        .fold(CompletionRequest::succeeded(fence), CompletionRequest::output);
    events.into_iter().fold(request, |request, span| {
        request.event(OutputEvent::new(stream.clone(), span))
    })
}
