//! DeliveryQueue port - executor への wake-up 配送
//!
//! queue は順序保証なし・at-least-once です。wake-up はヒントにすぎず、
//! 続く claim が成功するかは state store が決めます。

use crate::domain::WakeUp;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue operation failed: {0}")]
    OperationFailed(String),

    #[error("queue closed")]
    Closed,
}

/// DeliveryQueue carries wake-ups, partitioned by namespace.
///
/// - blocking pop with a timeout
/// - duplicates are possible and harmless
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn push(&self, ns: &str, wake_up: WakeUp) -> Result<(), QueueError>;

    /// `Ok(None)` on timeout.
    async fn pop(&self, ns: &str, timeout: Duration) -> Result<Option<WakeUp>, QueueError>;
}
