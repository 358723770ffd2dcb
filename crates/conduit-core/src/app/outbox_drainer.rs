//! OutboxDrainer - outbox 行を queue と router に送り出す
//!
//! # 配送
//! at-least-once。行は副作用が成功してから done にします。受け手側の副作用は
//! すべて冪等（wake-up はヒント、routing された task は重複排除）なので、
//! 間でクラッシュしても仕事が繰り返されるだけで重複はしません。
//!
//! # 保持期間
//! done になった行は `retention` の間だけ残し、その後 tick ごとに 1 バッチずつ削除します。
//!
//! # 順序
//! 同じ partition の行は作成順に処理します。失敗または defer された行があると、
//! その tick ではその partition の残りを止めます。他の partition は進みます。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{OutboxEffect, OutboxEntry, TaskStatus, WakeUp};
use crate::error::ConduitError;
use crate::impls::DispatchTable;
use crate::ports::{BackoffStrategy, Clock, StateStore, StoreError};

use super::event_router::{EventRouter, RoutePlan};
use super::pacer::{Pacer, sleep_or_shutdown};
use super::payload::assemble_payload;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub routed: usize,
    /// Child tasks created while routing.
    pub children: usize,
    /// Wake-ups for attempts that no longer exist, and stale events.
    pub dropped: usize,
    /// Wake-ups held back by a pending cutover.
    pub deferred: usize,
    pub failed: usize,
    /// Rows behind a failed or deferred row of the same partition.
    pub blocked: usize,
    /// Done rows deleted after their retention ran out.
    pub pruned: usize,
}

impl DrainReport {
    pub fn processed(&self) -> usize {
        self.delivered + self.routed + self.dropped
    }
}

enum Handled {
    Delivered,
    Routed { children: usize },
    Dropped,
    Deferred,
}

#[derive(Clone)]
pub struct OutboxDrainer {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    dispatch: DispatchTable,
    router: EventRouter,
    backoff: Arc<dyn BackoffStrategy>,
    batch: usize,
    poll: Duration,
    retention: Duration,
}

impl OutboxDrainer {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        dispatch: DispatchTable,
        router: EventRouter,
        backoff: Arc<dyn BackoffStrategy>,
        batch: usize,
        poll: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            dispatch,
            router,
            backoff,
            batch,
            poll,
            retention,
        }
    }

    /// Process one batch of available rows.
    pub async fn tick(&self) -> Result<DrainReport, ConduitError> {
        let rows = self.store.pull_outbox(self.clock.now(), self.batch).await?;
        let mut report = DrainReport::default();
        let mut stopped: HashSet<String> = HashSet::new();

        for row in rows {
            if stopped.contains(&row.partition) {
                report.blocked += 1;
                continue;
            }

            match self.handle(&row).await {
                Ok(Handled::Delivered) => report.delivered += 1,
                Ok(Handled::Routed { children }) => {
                    report.routed += 1;
                    report.children += children;
                }
                Ok(Handled::Dropped) => report.dropped += 1,
                Ok(Handled::Deferred) => {
                    report.deferred += 1;
                    stopped.insert(row.partition.clone());
                }
                Err(e) => {
                    let attempts = row.attempts.saturating_add(1);
                    let retry_at = self.clock.now() + chrono_delay(self.backoff.delay(attempts));
                    warn!(
                        outbox_id = row.id,
                        kind = row.effect.kind(),
                        attempts,
                        error = %e,
                        "outbox delivery failed"
                    );
                    self.store
                        .defer_outbox(row.id, retry_at, Some(e.to_string()), true)
                        .await?;
                    report.failed += 1;
                    stopped.insert(row.partition.clone());
                }
            }
        }

        if let Some(done_before) = self.clock.now().checked_sub_signed(chrono_delay(self.retention)) {
            report.pruned = self.store.prune_outbox(done_before, self.batch).await?;
        }

        if report.processed() > 0 || report.failed > 0 || report.pruned > 0 {
            debug!(?report, "outbox tick");
        }
        Ok(report)
    }

    /// Drain until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("outbox drainer started");
        let mut pacer = Pacer::new(self.poll);
        loop {
            let delay = match self.tick().await {
                Ok(report) => pacer.after_success(report.processed() > 0),
                Err(e) => {
                    warn!(error = %e, "outbox tick failed");
                    pacer.after_failure()
                }
            };
            if sleep_or_shutdown(&mut shutdown, delay).await {
                break;
            }
        }
        info!("outbox drainer stopped");
    }

    async fn handle(&self, row: &OutboxEntry) -> Result<Handled, ConduitError> {
        match &row.effect {
            OutboxEffect::WakeUp { task_id, attempt } => {
                let task = match self.store.get_task(*task_id).await? {
                    Some(task) if task.status == TaskStatus::Queued && task.attempt == *attempt => task,
                    _ => {
                        debug!(outbox_id = row.id, %task_id, attempt, "wake-up for a stale attempt dropped");
                        self.store.complete_outbox(row.id, Vec::new(), self.clock.now()).await?;
                        return Ok(Handled::Dropped);
                    }
                };

                let active = self.store.pointer_snapshot().await?.set.config_version;
                if active.is_some_and(|active| task.config_version > active) {
                    let retry_at = self.clock.now() + chrono_delay(self.poll);
                    self.store.defer_outbox(row.id, retry_at, None, false).await?;
                    return Ok(Handled::Deferred);
                }

                let job = self
                    .store
                    .get_job(task.job_id)
                    .await?
                    .ok_or(StoreError::UnknownJob(task.job_id))?;
                let strategy = job.spec.strategy;
                let payload = if strategy.carries_payload() {
                    Some(assemble_payload(self.store.as_ref(), &task, &job).await?)
                } else {
                    None
                };

                self.dispatch
                    .deliver(WakeUp {
                        task_id: *task_id,
                        attempt: *attempt,
                        strategy,
                        payload,
                    })
                    .await?;
                self.store.complete_outbox(row.id, Vec::new(), self.clock.now()).await?;
                Ok(Handled::Delivered)
            }
            OutboxEffect::RouteEvent { event, .. } => match self.router.plan(event).await? {
                RoutePlan::Stale(stale) => {
                    warn!(event = %event.dedupe_key(), current_generation = stale.current_generation, "stale event recorded");
                    self.store.record_stale_event(stale).await?;
                    self.store.complete_outbox(row.id, Vec::new(), self.clock.now()).await?;
                    Ok(Handled::Dropped)
                }
                RoutePlan::Tasks { tasks, .. } => {
                    let created = self.store.complete_outbox(row.id, tasks, self.clock.now()).await?;
                    Ok(Handled::Routed {
                        children: created.iter().filter(|c| c.created).count(),
                    })
                }
            },
        }
    }
}

pub(crate) fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}
