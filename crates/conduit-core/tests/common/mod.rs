//! End-to-end テスト共通のハーネス

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use conduit_core::app::{Dispatcher, DispatcherBuilder, DispatcherConfig};
use conduit_core::domain::{
    Activation, ClaimGrant, ClaimOutcome, ConfigVersion, JobName, JobSpec, OutputRecord, Span,
    TaskId, TaskPayload, WorkerId,
};
use conduit_core::impls::{InMemoryDeliveryQueue, InMemoryStateStore};
use conduit_core::ports::FixedClock;
use conduit_core::typed::{Handler, Operator, OperatorError, Produced};

pub const RAW: &str = "raw.events";
pub const RAW_DATASET: &str = "raw_events";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        lease_ttl_ms: 30_000,
        heartbeat_interval_ms: 10_000,
        retry_backoff_base_ms: 1_000,
        retry_backoff_multiplier: 2.0,
        retry_backoff_max_ms: 60_000,
        default_max_attempts: 3,
        pop_timeout_ms: 10,
        ..DispatcherConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStateStore>,
    pub queue: Arc<InMemoryDeliveryQueue>,
    pub clock: Arc<FixedClock>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        let store = Arc::new(InMemoryStateStore::new());
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let clock = Arc::new(FixedClock::new(t0()));
        let dispatcher = DispatcherBuilder::new(store.clone(), queue.clone())
            .config(config)
            .clock(clock.clone())
            .register::<Ingest, _>(IngestHandler)
            .unwrap()
            .register::<Compact, _>(CompactHandler)
            .unwrap()
            .register::<Stall, _>(StallHandler)
            .unwrap()
            .build()
            .unwrap();
        Self {
            store,
            queue,
            clock,
            dispatcher,
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    /// v1 with a manually triggered job publishing `raw_events` on `raw.events`.
    pub async fn deploy_publisher(&self) -> JobName {
        let job = JobName::new("ingest");
        self.dispatcher
            .admin
            .deploy(
                ConfigVersion(1),
                vec![JobSpec::new(job.clone(), Ingest::NAME).publishes(RAW, RAW_DATASET)],
            )
            .await
            .unwrap();
        job
    }

    pub async fn trigger(&self, job: &JobName) -> TaskId {
        self.dispatcher
            .admin
            .trigger(job, serde_json::Value::Null, None)
            .await
            .unwrap()
            .task_id
    }

    pub async fn claim(&self, task_id: TaskId, worker: &str) -> ClaimGrant {
        match self
            .dispatcher
            .leases
            .claim(task_id, WorkerId::new(worker))
            .await
            .unwrap()
        {
            ClaimOutcome::Claimed(grant) => grant,
            other => panic!("expected a claim, got {other:?}"),
        }
    }
}

pub fn raw_output(storage_ref: &str, span: Span) -> OutputRecord {
    OutputRecord {
        dataset: RAW_DATASET.into(),
        storage_ref: storage_ref.to_string(),
        config_hash: "cfg-1".to_string(),
        span,
    }
}

pub fn ingest_job() -> JobSpec {
    JobSpec::new("ingest", Ingest::NAME)
        .activation(Activation::Scheduled)
        .publishes(RAW, RAW_DATASET)
}

pub fn compact_job(name: &str) -> JobSpec {
    JobSpec::new(name, Compact::NAME)
        .activation(Activation::OnEvent)
        .input(RAW)
}

/// Publishes the input range as a version of the job's dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ingest {}

impl Operator for Ingest {
    const NAME: &'static str = "test.ingest.v1";
}

pub struct IngestHandler;

#[async_trait]
impl Handler<Ingest> for IngestHandler {
    async fn handle(&self, _config: Ingest, payload: &TaskPayload) -> Result<Produced, OperatorError> {
        let Some(target) = &payload.output else {
            return Ok(Produced::nothing());
        };
        let span = payload
            .inputs
            .first()
            .map(|input| input.span)
            .unwrap_or(Span::cursor(0));
        Ok(Produced::single(
            target,
            format!("mem://{}/{span}", target.stream.stream),
            "cfg-1",
            span,
        ))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Compact {
    #[serde(default)]
    pub fail: bool,
}

impl Operator for Compact {
    const NAME: &'static str = "test.compact.v1";
}

pub struct CompactHandler;

#[async_trait]
impl Handler<Compact> for CompactHandler {
    async fn handle(&self, config: Compact, _payload: &TaskPayload) -> Result<Produced, OperatorError> {
        if config.fail {
            return Err(OperatorError::retryable("compaction failed"));
        }
        Ok(Produced::nothing())
    }
}

/// Never finishes on its own; runs until the worker drops it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stall {}

impl Operator for Stall {
    const NAME: &'static str = "test.stall.v1";
}

pub struct StallHandler;

#[async_trait]
impl Handler<Stall> for StallHandler {
    async fn handle(&self, _config: Stall, _payload: &TaskPayload) -> Result<Produced, OperatorError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(Produced::nothing())
    }
}
