//! Outbox 行 - 変更と同じトランザクションで記録される副作用

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::completion::TaskPayload;
use super::ids::TaskId;
use super::job::ExecutionStrategy;
use super::stream::OutputEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Done,
}

/// The side effect a row stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum OutboxEffect {
    /// Push a wake-up for this attempt to the executor's queue.
    WakeUp { task_id: TaskId, attempt: u32 },
    /// Route an event to dependent jobs.
    RouteEvent { event: OutputEvent, source_task: TaskId },
}

impl OutboxEffect {
    /// Rows sharing a key are drained in creation order.
    pub fn partition_key(&self) -> String {
        match self {
            OutboxEffect::WakeUp { task_id, .. } => task_id.to_string(),
            OutboxEffect::RouteEvent { event, .. } => format!("stream:{}", event.source.stream),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboxEffect::WakeUp { .. } => "wake_up",
            OutboxEffect::RouteEvent { .. } => "route_event",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Monotonic; defines creation order.
    pub id: u64,
    pub partition: String,
    pub effect: OutboxEffect,
    pub status: OutboxStatus,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub done_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn new(id: u64, effect: OutboxEffect, now: DateTime<Utc>) -> Self {
        Self {
            id,
            partition: effect.partition_key(),
            effect,
            status: OutboxStatus::Pending,
            attempts: 0,
            available_at: now,
            last_error: None,
            created_at: now,
            done_at: None,
        }
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.available_at <= now
    }
}

/// Message pushed to an executor queue.
///
/// Identity only, except for invocation-style executors which also get the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeUp {
    pub task_id: TaskId,
    pub attempt: u32,
    pub strategy: ExecutionStrategy,
    #[serde(default)]
    pub payload: Option<TaskPayload>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stream::{Span, StreamRef};
    use chrono::TimeZone;
    use ulid::Ulid;

    #[test]
    fn partition_keys() {
        let task_id = TaskId::from_ulid(Ulid::new());
        let wake = OutboxEffect::WakeUp { task_id, attempt: 1 };
        assert_eq!(wake.partition_key(), task_id.to_string());

        let route = OutboxEffect::RouteEvent {
            event: OutputEvent::new(StreamRef::new("raw", 0), Span::cursor(3)),
            source_task: task_id,
        };
        assert_eq!(route.partition_key(), "stream:raw");
        assert_eq!(route.kind(), "route_event");
    }

    #[test]
    fn availability_respects_deferral() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut entry = OutboxEntry::new(
            1,
            OutboxEffect::WakeUp {
                task_id: TaskId::from_ulid(Ulid::new()),
                attempt: 1,
            },
            now,
        );
        assert!(entry.is_available(now));
        entry.available_at = now + chrono::Duration::seconds(5);
        assert!(!entry.is_available(now));
        entry.status = OutboxStatus::Done;
        assert!(!entry.is_available(now + chrono::Duration::seconds(10)));
    }
}
