//! RetryScheduler - backoff が過ぎた失敗 task を requeue する
//!
//! requeue は scheduler が読んだ attempt を条件にするので、
//! 同じ task を取り合う二つの scheduler からも新しい attempt は 1 つだけです。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ConduitError;
use crate::ports::{BackoffStrategy, Clock, StateStore};

use super::pacer::{Pacer, sleep_or_shutdown};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReport {
    pub requeued: usize,
    /// Lost the race to another scheduler or a cancel.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct RetryScheduler {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    backoff: Arc<dyn BackoffStrategy>,
    batch: usize,
    poll: Duration,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        backoff: Arc<dyn BackoffStrategy>,
        batch: usize,
        poll: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            backoff,
            batch,
            poll,
        }
    }

    pub async fn tick(&self) -> Result<RetryReport, ConduitError> {
        let now = self.clock.now();
        let due = self.store.list_due_retries(now, self.batch).await?;
        let mut report = RetryReport::default();

        for task in due {
            // The new attempt's own failure waits one step longer.
            let next_backoff_ms = self.backoff.delay_ms(task.attempt.saturating_add(1));
            if self
                .store
                .requeue_task(task.task_id, task.attempt, next_backoff_ms, now)
                .await?
            {
                info!(task_id = %task.task_id, attempt = task.attempt + 1, "task requeued");
                report.requeued += 1;
            } else {
                debug!(task_id = %task.task_id, "requeue skipped");
                report.skipped += 1;
            }
        }
        Ok(report)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("retry scheduler started");
        let mut pacer = Pacer::new(self.poll);
        loop {
            let delay = match self.tick().await {
                Ok(report) => pacer.after_success(report.requeued > 0),
                Err(e) => {
                    warn!(error = %e, "retry tick failed");
                    pacer.after_failure()
                }
            };
            if sleep_or_shutdown(&mut shutdown, delay).await {
                break;
            }
        }
        info!("retry scheduler stopped");
    }
}
