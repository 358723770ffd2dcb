//! DispatchTable - execution strategy → wake-up sink の対応表
//!
//! strategy は閉じた enum、sink は trait object です。
//! executor の種類を増やすときは sink を登録するだけで済みます。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{ExecutionStrategy, WakeUp};
use crate::ports::{DeliveryQueue, QueueError, WakeupSink};

/// Sink that pushes wake-ups onto a [`DeliveryQueue`] namespace.
pub struct QueueSink {
    queue: Arc<dyn DeliveryQueue>,
    namespace: String,
}

impl QueueSink {
    pub fn new(queue: Arc<dyn DeliveryQueue>, namespace: impl Into<String>) -> Self {
        Self {
            queue,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl WakeupSink for QueueSink {
    async fn deliver(&self, wake_up: WakeUp) -> Result<(), QueueError> {
        self.queue.push(&self.namespace, wake_up).await
    }

    fn name(&self) -> &str {
        &self.namespace
    }
}

#[derive(Clone, Default)]
pub struct DispatchTable {
    sinks: HashMap<ExecutionStrategy, Arc<dyn WakeupSink>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every strategy delivered to one queue namespace.
    pub fn single_queue(queue: Arc<dyn DeliveryQueue>, namespace: &str) -> Self {
        let sink: Arc<dyn WakeupSink> = Arc::new(QueueSink::new(queue, namespace));
        let mut table = Self::new();
        for strategy in ExecutionStrategy::ALL {
            table.register(strategy, Arc::clone(&sink));
        }
        table
    }

    /// Replaces any sink already registered for `strategy`.
    pub fn register(&mut self, strategy: ExecutionStrategy, sink: Arc<dyn WakeupSink>) {
        self.sinks.insert(strategy, sink);
    }

    pub fn get(&self, strategy: ExecutionStrategy) -> Option<Arc<dyn WakeupSink>> {
        self.sinks.get(&strategy).cloned()
    }

    pub fn missing(&self) -> Vec<ExecutionStrategy> {
        ExecutionStrategy::ALL
            .into_iter()
            .filter(|s| !self.sinks.contains_key(s))
            .collect()
    }

    pub async fn deliver(&self, wake_up: WakeUp) -> Result<(), QueueError> {
        let sink = self.get(wake_up.strategy).ok_or_else(|| {
            QueueError::OperationFailed(format!("no sink registered for {:?}", wake_up.strategy))
        })?;
        sink.deliver(wake_up).await
    }
}
