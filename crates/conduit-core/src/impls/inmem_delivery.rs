//! InMemoryDeliveryQueue - ローカル実行とテスト用の wake-up queue
//!
//! - namespace ごとに `VecDeque` 1 つ、`tokio::sync::Mutex` の内側
//! - push 時に `Notify` でブロック中の `pop` を起こす

use crate::domain::WakeUp;
use crate::ports::{DeliveryQueue, QueueError};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Default)]
pub struct InMemoryDeliveryQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<WakeUp>>>>,
    notify: Arc<Notify>,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, ns: &str) -> usize {
        self.queues.lock().await.get(ns).map_or(0, VecDeque::len)
    }

    pub async fn is_empty(&self, ns: &str) -> bool {
        self.len(ns).await == 0
    }
}

#[async_trait::async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn push(&self, ns: &str, wake_up: WakeUp) -> Result<(), QueueError> {
        self.queues
            .lock()
            .await
            .entry(ns.to_string())
            .or_default()
            .push_back(wake_up);

        // namespaces share one Notify, so wake everyone and let them re-check
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, ns: &str, timeout: Duration) -> Result<Option<WakeUp>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            // register interest before checking, so a push in between is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(wake_up) = self
                .queues
                .lock()
                .await
                .get_mut(ns)
                .and_then(VecDeque::pop_front)
            {
                return Ok(Some(wake_up));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionStrategy, TaskId};
    use ulid::Ulid;

    fn wake_up() -> WakeUp {
        WakeUp {
            task_id: TaskId::from_ulid(Ulid::new()),
            attempt: 1,
            strategy: ExecutionStrategy::InProcess,
            payload: None,
        }
    }

    #[tokio::test]
    async fn test_push_pop_roundtrip() {
        let queue = InMemoryDeliveryQueue::new();
        let w = wake_up();
        queue.push("default", w.clone()).await.unwrap();
        let popped = queue.pop("default", Duration::from_secs(1)).await.unwrap();
        assert_eq!(popped, Some(w));
    }

    #[tokio::test]
    async fn test_pop_timeout() {
        let queue = InMemoryDeliveryQueue::new();
        let start = Instant::now();
        let popped = queue
            .pop("default", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn test_multiple_namespaces() {
        let queue = InMemoryDeliveryQueue::new();
        let w1 = wake_up();
        let w2 = wake_up();
        queue.push("ns1", w1.clone()).await.unwrap();
        queue.push("ns2", w2.clone()).await.unwrap();

        assert_eq!(queue.pop("ns1", Duration::from_secs(1)).await.unwrap(), Some(w1));
        assert_eq!(queue.pop("ns2", Duration::from_secs(1)).await.unwrap(), Some(w2));
        assert!(queue.is_empty("ns1").await);
    }

    #[tokio::test]
    async fn test_push_wakes_pop() {
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let w = wake_up();

        let pop_future = tokio::spawn({
            let queue = queue.clone();
            async move { queue.pop("default", Duration::from_secs(5)).await.unwrap() }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.push("default", w.clone()).await.unwrap();

        assert_eq!(pop_future.await.unwrap(), Some(w));
    }
}
