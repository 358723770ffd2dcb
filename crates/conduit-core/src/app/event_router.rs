//! EventRouter - output event をその stream を消費する job に fan-out する
//!
//! routing は event と store の純粋関数です。同じ event は常に同じ dedupe key を
//! 計画するので、クラッシュ後に outbox 行を再生しても重複は生まれません。
//!
//! # Cutover 中の routing
//! active version の consumer には常に task を作ります。cutover が staged なら
//! target version の consumer にも作り、それらは commit まで withheld です。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{ConfigVersion, NewTask, OutputEvent, StaleEvent, TaskId, TaskTrigger};
use crate::error::ConduitError;
use crate::ports::{Clock, StateStore};

use super::tasks::TaskFactory;

/// What routing one event amounts to.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutePlan {
    /// The event's generation is behind the stream; it is recorded, not routed.
    Stale(StaleEvent),
    Tasks {
        /// Versions the consumers were looked up in, active first; empty before the first deploy.
        config_versions: Vec<ConfigVersion>,
        tasks: Vec<NewTask>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteReport {
    pub created: Vec<TaskId>,
    /// Consumers that already had a task for this event.
    pub existing: Vec<TaskId>,
    pub stale: bool,
}

#[derive(Clone)]
pub struct EventRouter {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    tasks: TaskFactory,
}

impl EventRouter {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, tasks: TaskFactory) -> Self {
        Self { store, clock, tasks }
    }

    /// Work out the downstream tasks for `event` without writing anything.
    ///
    /// Consumers in the active config version always get a task. While a
    /// cutover is staged the target version's consumers get one too; those
    /// stay withheld until the cutover commits, and are canceled if it is
    /// abandoned.
    pub async fn plan(&self, event: &OutputEvent) -> Result<RoutePlan, ConduitError> {
        let current_generation = self
            .store
            .get_stream(&event.source.stream)
            .await?
            .map_or(0, |record| record.generation);
        if event.source.generation < current_generation {
            return Ok(RoutePlan::Stale(StaleEvent {
                event: event.clone(),
                current_generation,
                recorded_at: self.clock.now(),
            }));
        }

        let mut config_versions = Vec::with_capacity(2);
        config_versions.extend(self.store.pointer_snapshot().await?.set.config_version);
        if let Some(staged) = self
            .store
            .pending_cutover()
            .await?
            .and_then(|pending| pending.target_version())
            && !config_versions.contains(&staged)
        {
            config_versions.push(staged);
        }
        if config_versions.is_empty() {
            debug!(event = %event.dedupe_key(), "no active config, event has no consumers");
        }

        let mut tasks = Vec::new();
        for version in &config_versions {
            tasks.extend(
                self.store
                    .jobs_for_version(*version)
                    .await?
                    .iter()
                    .filter(|job| job.consumes(&event.source.stream))
                    .map(|job| {
                        self.tasks.build(
                            job,
                            TaskTrigger::Event { event: event.clone() },
                            event.dedupe_key(),
                        )
                    }),
            );
        }

        Ok(RoutePlan::Tasks {
            config_versions,
            tasks,
        })
    }

    /// Plan and apply in one call.
    pub async fn route(&self, event: &OutputEvent) -> Result<RouteReport, ConduitError> {
        match self.plan(event).await? {
            RoutePlan::Stale(stale) => {
                warn!(
                    event = %event.dedupe_key(),
                    current_generation = stale.current_generation,
                    "stale event recorded"
                );
                self.store.record_stale_event(stale).await?;
                Ok(RouteReport {
                    stale: true,
                    ..RouteReport::default()
                })
            }
            RoutePlan::Tasks { tasks, .. } => {
                let created = self.store.create_tasks(tasks, self.clock.now()).await?;
                let report = split(&created);
                info!(
                    event = %event.dedupe_key(),
                    created = report.created.len(),
                    existing = report.existing.len(),
                    "event routed"
                );
                Ok(report)
            }
        }
    }
}

pub(crate) fn split(created: &[crate::ports::CreatedTask]) -> RouteReport {
    let mut report = RouteReport::default();
    for task in created {
        if task.created {
            report.created.push(task.task_id);
        } else {
            report.existing.push(task.task_id);
        }
    }
    report
}
