//! Domain - データモデル（ids, job, task, stream, dataset version, pointer, outbox 行）
//!
//! データと純粋な状態遷移のみ。store にも clock にも触れません。

pub mod completion;
pub mod dataset;
pub mod errors;
pub mod ids;
pub mod job;
pub mod outbox;
pub mod pointer;
pub mod stream;
pub mod task;

pub use self::completion::{
    ClaimGrant, ClaimOutcome, ClaimResult, CancelOutcome, CommitOutcome, CompleteOutcome,
    CompletionCommit, CompletionReceipt, CompletionRequest, CompletionStatus, FenceViolation,
    HeartbeatOutcome, NotClaimedReason, OutputTarget, Rejection, ResolvedInput, TaskPayload,
    check_fence,
};
pub use self::dataset::{
    DatasetVersion, OutputRecord, Publication, PublishOutcome, Reconciliation, VersionDescriptor,
};
pub use self::errors::{ErrorCategory, ErrorInfo};
pub use self::ids::{
    ConfigVersion, CutoverId, DatasetName, JobId, JobName, LeaseToken, PointerName, StreamId,
    TaskId, VersionId, WorkerId,
};
pub use self::job::{Activation, ExecutionStrategy, JobDefinition, JobSpec, OutputBinding};
pub use self::outbox::{OutboxEffect, OutboxEntry, OutboxStatus, WakeUp};
pub use self::pointer::{
    CutoverOutcome, CutoverRejection, CutoverRequest, PendingCutover, PointerSet, PointerSnapshot,
};
pub use self::stream::{
    OutputEvent, RangeSpan, ScheduleSpec, ScheduledRange, Span, StaleEvent, StreamRecord,
    StreamRef,
};
pub use self::task::{Fence, Lease, NewTask, TaskRecord, TaskStatus, TaskTrigger};
