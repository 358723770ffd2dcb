//! WakeupSink port - outbox drainer が wake-up を渡す先
//!
//! execution strategy ごとに sink が 1 つあり、
//! [`DispatchTable`](crate::impls::DispatchTable) 経由で引きます。

use crate::domain::WakeUp;
use crate::ports::QueueError;
use async_trait::async_trait;

#[async_trait]
pub trait WakeupSink: Send + Sync {
    async fn deliver(&self, wake_up: WakeUp) -> Result<(), QueueError>;

    /// Short label for logs.
    fn name(&self) -> &str;
}
