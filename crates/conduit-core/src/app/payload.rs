//! Task payload の組み立て（job config + 解決済み input 参照）

use crate::domain::{
    JobDefinition, OutputTarget, ResolvedInput, StreamId, StreamRef, TaskPayload, TaskRecord,
    TaskTrigger,
};
use crate::ports::{StateStore, StoreError};

pub(crate) async fn assemble_payload(
    store: &dyn StateStore,
    task: &TaskRecord,
    job: &JobDefinition,
) -> Result<TaskPayload, StoreError> {
    let inputs = match &task.trigger {
        TaskTrigger::Manual { .. } => Vec::new(),
        TaskTrigger::Event { event } => {
            let storage_ref = match &event.version {
                Some(version_id) => store
                    .get_version(version_id)
                    .await?
                    .map(|v| v.descriptor.storage_ref),
                None => None,
            };
            vec![ResolvedInput {
                source: event.source.clone(),
                span: event.span,
                storage_ref,
                version: event.version.clone(),
            }]
        }
        TaskTrigger::Range { stream, range } => vec![ResolvedInput {
            source: current_ref(store, stream).await?,
            span: crate::domain::Span::Range(*range),
            storage_ref: None,
            version: None,
        }],
    };

    let output = match &job.spec.output {
        Some(binding) => Some(OutputTarget {
            stream: current_ref(store, &binding.stream).await?,
            dataset: binding.dataset.clone(),
        }),
        None => None,
    };

    Ok(TaskPayload {
        task_id: task.task_id,
        attempt: task.attempt,
        job_id: job.job_id,
        job_name: job.name().clone(),
        config_version: job.config_version,
        operator: job.spec.operator.clone(),
        config: job.spec.config.clone(),
        trigger: task.trigger.clone(),
        inputs,
        output,
    })
}

async fn current_ref(store: &dyn StateStore, stream: &StreamId) -> Result<StreamRef, StoreError> {
    let generation = store
        .get_stream(stream)
        .await?
        .map_or(0, |record| record.generation);
    Ok(StreamRef::new(stream.clone(), generation))
}
