//! job 定義から `NewTask` 行を組み立てる

use std::sync::Arc;

use crate::domain::{JobDefinition, NewTask, StreamId, TaskTrigger};
use crate::ports::{BackoffStrategy, IdGenerator};

/// Shared by the router, the planner and manual triggers so that every task
/// gets its attempts budget and first backoff from the same place.
#[derive(Clone)]
pub struct TaskFactory {
    ids: Arc<dyn IdGenerator>,
    backoff: Arc<dyn BackoffStrategy>,
    default_max_attempts: u32,
}

impl TaskFactory {
    pub fn new(
        ids: Arc<dyn IdGenerator>,
        backoff: Arc<dyn BackoffStrategy>,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            ids,
            backoff,
            default_max_attempts,
        }
    }

    pub fn build(&self, job: &JobDefinition, trigger: TaskTrigger, dedupe_key: String) -> NewTask {
        // ranges belong to the stream that planned them; other work to what it writes
        let stream = match &trigger {
            TaskTrigger::Range { stream, .. } => Some(stream.clone()),
            _ => job.output_stream().cloned().or_else(|| trigger_stream(&trigger)),
        };

        NewTask {
            task_id: self.ids.task_id(),
            job_id: job.job_id,
            job_name: job.name().clone(),
            config_version: job.config_version,
            trigger,
            dedupe_key,
            stream,
            max_attempts: job.spec.max_attempts.unwrap_or(self.default_max_attempts),
            retry_backoff_ms: self.backoff.delay_ms(1),
        }
    }
}

fn trigger_stream(trigger: &TaskTrigger) -> Option<StreamId> {
    match trigger {
        TaskTrigger::Manual { .. } => None,
        TaskTrigger::Event { event } => Some(event.source.stream.clone()),
        TaskTrigger::Range { stream, .. } => Some(stream.clone()),
    }
}
