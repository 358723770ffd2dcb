//! DispatcherBuilder - ワイヤリングと起動時検証
//!
//! Fail-fast: 不正な config、operator の重複登録、期待した operator の欠落は
//! ループが起動する前に `build()` が報告します。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::domain::{ExecutionStrategy, WorkerId};
use crate::impls::{DispatchTable, QueueSink};
use crate::ports::{
    BackoffStrategy, Clock, DeliveryQueue, IdGenerator, StateStore, SystemClock, UlidGenerator,
    WakeupSink,
};
use crate::typed::{Handler, Operator, RegistryError, TypedRegistry};

use super::admin::Admin;
use super::config::{ConfigError, DispatcherConfig};
use super::cutover::CutoverCoordinator;
use super::event_router::EventRouter;
use super::lease_manager::LeaseManager;
use super::outbox_drainer::OutboxDrainer;
use super::planner::RangePlanner;
use super::reaper_loop::LeaseReaper;
use super::registry::DatasetVersionRegistry;
use super::retry_scheduler::RetryScheduler;
use super::tasks::TaskFactory;
use super::worker_loop::WorkerLoop;

/// ```ignore
/// let dispatcher = DispatcherBuilder::new(store, queue)
///     .config(DispatcherConfig::from_env()?)
///     .register::<Compact, _>(CompactHandler)?
///     .expect_operators(&[Compact::NAME])
///     .build()?;
/// let handle = dispatcher.spawn(4);
/// ```
pub struct DispatcherBuilder {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn DeliveryQueue>,
    config: DispatcherConfig,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    backoff: Option<Arc<dyn BackoffStrategy>>,
    sinks: HashMap<ExecutionStrategy, Arc<dyn WakeupSink>>,
    operators: TypedRegistry,
    expected_operators: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("missing operators: {0:?}. These operators were expected but not registered.")]
    MissingOperators(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl DispatcherBuilder {
    pub fn new(store: Arc<dyn StateStore>, queue: Arc<dyn DeliveryQueue>) -> Self {
        Self {
            store,
            queue,
            config: DispatcherConfig::default(),
            clock: None,
            ids: None,
            backoff: None,
            sinks: HashMap::new(),
            operators: TypedRegistry::new(),
            expected_operators: None,
        }
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Override the task retry policy built from the config.
    pub fn backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Route wake-ups of `strategy` to `sink` instead of the default queue namespace.
    pub fn sink(mut self, strategy: ExecutionStrategy, sink: Arc<dyn WakeupSink>) -> Self {
        self.sinks.insert(strategy, sink);
        self
    }

    pub fn register<T: Operator, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.operators.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn expect_operators(mut self, operators: &[&str]) -> Self {
        self.expected_operators = Some(operators.iter().map(|o| o.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Dispatcher, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_operators {
            let registered = self.operators.registered_operators();
            let missing: Vec<String> = expected
                .iter()
                .filter(|o| !registered.contains(o))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingOperators(missing));
            }
        }

        let config = self.config;
        let store = self.store;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let backoff: Arc<dyn BackoffStrategy> = self
            .backoff
            .unwrap_or_else(|| Arc::new(config.retry_backoff()));

        let default_sink: Arc<dyn WakeupSink> =
            Arc::new(QueueSink::new(Arc::clone(&self.queue), config.namespace.clone()));
        let mut dispatch = DispatchTable::new();
        for strategy in ExecutionStrategy::ALL {
            let sink = self
                .sinks
                .get(&strategy)
                .cloned()
                .unwrap_or_else(|| Arc::clone(&default_sink));
            dispatch.register(strategy, sink);
        }

        let tasks = TaskFactory::new(Arc::clone(&ids), Arc::clone(&backoff), config.default_max_attempts);
        let datasets = DatasetVersionRegistry::new(Arc::clone(&store), Arc::clone(&clock));
        let leases = LeaseManager::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&ids),
            datasets.clone(),
            config.lease_ttl(),
        );
        let router = EventRouter::new(Arc::clone(&store), Arc::clone(&clock), tasks.clone());
        let drainer = OutboxDrainer::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            dispatch,
            router.clone(),
            Arc::new(config.outbox_backoff()),
            config.outbox_batch,
            config.outbox_poll(),
            config.outbox_retention(),
        );
        let retries = RetryScheduler::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&backoff),
            config.retry_batch,
            config.retry_poll(),
        );
        let reaper = LeaseReaper::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.reaper_batch,
            config.reaper_poll(),
        );
        let planner = RangePlanner::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            tasks.clone(),
            config.planner_max_ranges,
            config.planner_poll(),
        );
        let cutover = CutoverCoordinator::new(Arc::clone(&store), Arc::clone(&clock), Arc::clone(&ids));
        let admin = Admin::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&ids),
            tasks,
            cutover.clone(),
        );

        Ok(Dispatcher {
            config,
            queue: self.queue,
            operators: Arc::new(self.operators),
            leases,
            datasets,
            router,
            drainer,
            retries,
            reaper,
            planner,
            cutover,
            admin,
        })
    }
}

/// A wired dispatcher. Components can be driven tick by tick, or all at once via `spawn`.
pub struct Dispatcher {
    config: DispatcherConfig,
    queue: Arc<dyn DeliveryQueue>,
    operators: Arc<TypedRegistry>,
    pub leases: LeaseManager,
    pub datasets: DatasetVersionRegistry,
    pub router: EventRouter,
    pub drainer: OutboxDrainer,
    pub retries: RetryScheduler,
    pub reaper: LeaseReaper,
    pub planner: RangePlanner,
    pub cutover: CutoverCoordinator,
    pub admin: Admin,
}

impl Dispatcher {
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// An in-process worker popping from the configured namespace.
    pub fn worker(&self, worker_id: impl Into<WorkerId>) -> WorkerLoop {
        WorkerLoop::new(
            worker_id.into(),
            self.leases.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.operators),
            self.config.namespace.clone(),
            self.config.pop_timeout(),
            self.config.heartbeat_interval(),
        )
    }

    /// Start the background loops plus `workers` in-process workers.
    pub fn spawn(&self, workers: usize) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::with_capacity(workers + 4);

        let drainer = self.drainer.clone();
        let rx = shutdown_rx.clone();
        joins.push(tokio::spawn(async move { drainer.run(rx).await }));

        let retries = self.retries.clone();
        let rx = shutdown_rx.clone();
        joins.push(tokio::spawn(async move { retries.run(rx).await }));

        let reaper = self.reaper.clone();
        let rx = shutdown_rx.clone();
        joins.push(tokio::spawn(async move { reaper.run(rx).await }));

        let planner = self.planner.clone();
        let rx = shutdown_rx.clone();
        joins.push(tokio::spawn(async move { planner.run(rx).await }));

        for n in 0..workers {
            let worker = self.worker(WorkerId::new(format!("worker-{n}")));
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move { worker.run(rx).await }));
        }

        info!(workers, "dispatcher started");
        DispatcherHandle { shutdown_tx, joins }
    }
}

/// Running dispatcher.
/// - dropping `shutdown_tx` stops every loop
/// - `shutdown_and_join()` waits for them to finish
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Stop taking new work. Runs already claimed finish and report.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
        info!("dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryDeliveryQueue, InMemoryStateStore};
    use crate::typed::handler::tests::{Echo, EchoHandler};

    fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new(
            Arc::new(InMemoryStateStore::new()),
            Arc::new(InMemoryDeliveryQueue::new()),
        )
    }

    #[test]
    fn build_success() {
        let dispatcher = builder()
            .register::<Echo, _>(EchoHandler)
            .unwrap()
            .expect_operators(&[Echo::NAME])
            .build();
        assert!(dispatcher.is_ok());
    }

    #[test]
    fn build_missing_operators() {
        let dispatcher = builder()
            .register::<Echo, _>(EchoHandler)
            .unwrap()
            .expect_operators(&[Echo::NAME, "test.other.v1"])
            .build();
        assert!(matches!(
            dispatcher,
            Err(BuildError::MissingOperators(missing)) if missing == vec!["test.other.v1".to_string()]
        ));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let dispatcher = builder()
            .config(DispatcherConfig {
                outbox_batch: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(dispatcher, Err(BuildError::Config(_))));
    }

    #[test]
    fn duplicate_operator_is_rejected() {
        let result = builder()
            .register::<Echo, _>(EchoHandler)
            .unwrap()
            .register::<Echo, _>(EchoHandler);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn spawn_and_shutdown() {
        let dispatcher = builder().build().unwrap();
        let handle = dispatcher.spawn(2);
        handle.shutdown_and_join().await;
    }
}
