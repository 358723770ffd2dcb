//! LeaseReaper - lease 切れの attempt を回収する
//!
//! 期限切れの attempt は通常の失敗として扱います。明示的な失敗と同じ backoff の後に
//! retry scheduler が拾うか、attempt の予算を使い切っていれば terminal になります。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::ConduitError;
use crate::ports::{Clock, StateStore};

use super::pacer::{Pacer, sleep_or_shutdown};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    pub reaped: usize,
    /// Reaped attempts that were the task's last.
    pub exhausted: usize,
    /// Heartbeat or completion won the race.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct LeaseReaper {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    batch: usize,
    poll: Duration,
}

impl LeaseReaper {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, batch: usize, poll: Duration) -> Self {
        Self {
            store,
            clock,
            batch,
            poll,
        }
    }

    pub async fn tick(&self) -> Result<ReapReport, ConduitError> {
        let now = self.clock.now();
        let expired = self.store.list_expired_leases(now, self.batch).await?;
        let mut report = ReapReport::default();

        for task in expired {
            let Some(fence) = task.fence() else {
                report.skipped += 1;
                continue;
            };
            if self.store.expire_lease(&fence, now).await? {
                let worker = task.lease.as_ref().map(|l| l.worker_id.to_string()).unwrap_or_default();
                warn!(task_id = %task.task_id, attempt = task.attempt, %worker, "lease expired, attempt failed");
                report.reaped += 1;
                if task.attempts_exhausted() {
                    report.exhausted += 1;
                }
            } else {
                report.skipped += 1;
            }
        }
        Ok(report)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("lease reaper started");
        let mut pacer = Pacer::new(self.poll);
        loop {
            let delay = match self.tick().await {
                Ok(report) => pacer.after_success(report.reaped > 0),
                Err(e) => {
                    warn!(error = %e, "reaper tick failed");
                    pacer.after_failure()
                }
            };
            if sleep_or_shutdown(&mut shutdown, delay).await {
                break;
            }
        }
        info!("lease reaper stopped");
    }
}
