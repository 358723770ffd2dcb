//! CutoverCoordinator - live pointer set の原子的な切り替え
//!
//! 読み手が見るのは cutover 前の set か後の set のどちらかだけです。
//! commit のたびに直前の set を履歴スタックに積み、rollback はスタックの先頭を
//! そのまま（同じ pointer、同じ config version）復元します。
//!
//! # 二段階 cutover
//! `begin` / `commit` / `abandon` を経由します。staged の間、target config version の
//! task は作成されますが dispatch も claim もされません。abandon されるとそれらは cancel、
//! commit されると旧 version 側の未着手の同一 task が cancel されます。

use std::sync::Arc;

use tracing::{info, warn};

use crate::domain::{
    CutoverId, CutoverOutcome, CutoverRejection, CutoverRequest, DatasetName, PendingCutover,
    PointerName, PointerSnapshot,
};
use crate::error::ConduitError;
use crate::ports::{Clock, IdGenerator, StateStore};

#[derive(Clone)]
pub struct CutoverCoordinator {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl CutoverCoordinator {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { store, clock, ids }
    }

    /// Apply `request` in one step.
    pub async fn cutover(&self, request: CutoverRequest) -> Result<CutoverOutcome, ConduitError> {
        let outcome = self.store.apply_cutover(request, self.clock.now()).await?;
        log_outcome("cutover", &outcome);
        Ok(outcome)
    }

    /// Restore the set that was live before the last committed cutover.
    pub async fn rollback(&self) -> Result<CutoverOutcome, ConduitError> {
        let outcome = self.store.rollback_cutover(self.clock.now()).await?;
        log_outcome("rollback", &outcome);
        Ok(outcome)
    }

    /// Stage `request`; nothing becomes live until `commit`.
    pub async fn begin(&self, request: CutoverRequest) -> Result<CutoverOutcome, ConduitError> {
        let pending = PendingCutover {
            cutover_id: self.ids.cutover_id(),
            request,
            begun_at: self.clock.now(),
        };
        let outcome = self.store.begin_cutover(pending).await?;
        log_outcome("begin cutover", &outcome);
        Ok(outcome)
    }

    pub async fn commit(&self, cutover_id: CutoverId) -> Result<CutoverOutcome, ConduitError> {
        let outcome = self
            .store
            .resolve_cutover(cutover_id, true, self.clock.now())
            .await?;
        log_outcome("commit cutover", &outcome);
        Ok(outcome)
    }

    /// Drop the staged cutover and cancel the work it was holding back.
    pub async fn abandon(&self, cutover_id: CutoverId) -> Result<CutoverOutcome, ConduitError> {
        let outcome = self
            .store
            .resolve_cutover(cutover_id, false, self.clock.now())
            .await?;
        log_outcome("abandon cutover", &outcome);
        Ok(outcome)
    }

    /// Point each named pointer at the latest version of its dataset.
    ///
    /// Datasets with no published version are left out; if none resolve the
    /// request is rejected as empty.
    pub async fn promote_latest(
        &self,
        bindings: &[(PointerName, DatasetName)],
    ) -> Result<CutoverOutcome, ConduitError> {
        let mut request = CutoverRequest::new();
        for (pointer, dataset) in bindings {
            match self.store.latest_version(dataset).await? {
                Some(version) => request = request.pointer(pointer.clone(), version.version_id),
                None => warn!(%pointer, %dataset, "no published version to promote"),
            }
        }
        if request.is_empty() {
            return Ok(CutoverOutcome::rejected(CutoverRejection::Empty));
        }
        self.cutover(request).await
    }

    pub async fn snapshot(&self) -> Result<PointerSnapshot, ConduitError> {
        Ok(self.store.pointer_snapshot().await?)
    }

    pub async fn pending(&self) -> Result<Option<PendingCutover>, ConduitError> {
        Ok(self.store.pending_cutover().await?)
    }
}

fn log_outcome(action: &str, outcome: &CutoverOutcome) {
    match outcome {
        CutoverOutcome::Committed { snapshot } => info!(
            action,
            revision = snapshot.revision,
            config_version = ?snapshot.set.config_version,
            pointers = snapshot.set.pointers.len(),
            "pointer set committed"
        ),
        CutoverOutcome::Staged { pending } => {
            info!(action, cutover_id = %pending.cutover_id, "cutover staged")
        }
        CutoverOutcome::Abandoned {
            cutover_id,
            canceled_tasks,
        } => info!(action, %cutover_id, canceled = canceled_tasks.len(), "cutover abandoned"),
        CutoverOutcome::Rejected { rejection } => warn!(action, ?rejection, "cutover rejected"),
    }
}
