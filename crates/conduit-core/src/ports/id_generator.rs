//! IdGenerator port - ID 生成
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース。タイムスタンプ部は注入された `Clock` から取る

use crate::domain::ids::{CutoverId, JobId, LeaseToken, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator mints ids that can be created on any replica without coordination.
///
/// # Thread Safety
/// - `Send + Sync` so one generator is shared by every loop
pub trait IdGenerator: Send + Sync {
    fn job_id(&self) -> JobId;

    fn task_id(&self) -> TaskId;

    /// Fresh lease token for a claim. Never reused across claims.
    fn lease_token(&self) -> LeaseToken;

    fn cutover_id(&self) -> CutoverId;
}

/// ULID based generator.
///
/// With a `FixedClock` the timestamp part is deterministic; the random part is not.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn job_id(&self) -> JobId {
        JobId::from(self.next())
    }

    fn task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn lease_token(&self) -> LeaseToken {
        LeaseToken::from(self.next())
    }

    fn cutover_id(&self) -> CutoverId {
        CutoverId::from(self.next())
    }
}
