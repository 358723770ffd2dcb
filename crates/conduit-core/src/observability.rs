//! Observability - tracing の初期化と status カウンタ

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::domain::{TaskRecord, TaskStatus};

/// Install the global tracing subscriber.
///
/// Filter comes from `RUST_LOG` (default `info`). `json` switches to JSON lines.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Task counts by status. Failed tasks waiting for a retry are counted apart
/// from terminal failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub retry_pending: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl TaskCounts {
    pub fn record(&mut self, task: &TaskRecord) {
        match task.status {
            TaskStatus::Queued => self.queued += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed if task.next_retry_at.is_some() => self.retry_pending += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Canceled => self.canceled += 1,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.queued + self.running + self.retry_pending
    }

    pub fn total(&self) -> usize {
        self.in_flight() + self.completed + self.failed + self.canceled
    }
}
