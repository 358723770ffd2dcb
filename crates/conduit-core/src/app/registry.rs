//! DatasetVersionRegistry - 内容アドレスで不変な dataset version
//!
//! version の identity は (dataset, 生成 task, span) だけで決まります。
//! 同じ identity の再 publish は、descriptor の hash が一致すれば no-op、
//! 一致しなければ `Conflict` です。最初の書き込みが置き換わることはありません。

use std::sync::Arc;

use tracing::{error, info};

use crate::domain::{DatasetName, DatasetVersion, Fence, OutputRecord, Publication, PublishOutcome, TaskId, VersionId};
use crate::error::ConduitError;
use crate::ports::{Clock, StateStore};

#[derive(Clone)]
pub struct DatasetVersionRegistry {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl DatasetVersionRegistry {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Identity and content hash for an output, without touching the store.
    pub fn prepare(&self, producing_task: TaskId, output: &OutputRecord) -> Publication {
        Publication::from_output(producing_task, output)
    }

    /// Publish one output outside a completion.
    ///
    /// The producing attempt must still hold its lease, and the job must bind
    /// the dataset it is publishing to.
    pub async fn publish(&self, fence: &Fence, output: OutputRecord) -> Result<PublishOutcome, ConduitError> {
        let Some(task) = self.store.get_task(fence.task_id).await? else {
            return Ok(PublishOutcome::Rejected {
                reason: format!("task {} not found", fence.task_id),
            });
        };
        let job = self
            .store
            .get_job(task.job_id)
            .await?
            .ok_or(crate::ports::StoreError::UnknownJob(task.job_id))?;
        if job.output_dataset() != Some(&output.dataset) {
            return Ok(PublishOutcome::Rejected {
                reason: format!("job {} does not publish dataset {}", job.name(), output.dataset),
            });
        }

        let publication = self.prepare(fence.task_id, &output);
        let outcome = self
            .store
            .publish_version(fence, publication, self.clock.now())
            .await?;

        match &outcome {
            PublishOutcome::Inserted { version } => {
                info!(version_id = %version.version_id, dataset = %version.dataset, "dataset version published");
            }
            PublishOutcome::Conflict {
                version_id,
                existing_hash,
                offered_hash,
            } => {
                error!(
                    %version_id,
                    %existing_hash,
                    %offered_hash,
                    "divergent publication rejected"
                );
            }
            PublishOutcome::AlreadyPublished { .. } | PublishOutcome::Rejected { .. } => {}
        }
        Ok(outcome)
    }

    pub async fn get(&self, version_id: &VersionId) -> Result<Option<DatasetVersion>, ConduitError> {
        Ok(self.store.get_version(version_id).await?)
    }

    /// Most recently published version of `dataset`.
    pub async fn latest(&self, dataset: &DatasetName) -> Result<Option<DatasetVersion>, ConduitError> {
        Ok(self.store.latest_version(dataset).await?)
    }
}
