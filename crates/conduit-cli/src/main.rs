//! ローカルデモ: スケジュール stream 1 本と依存 job 1 つ、すべてインメモリ
//!
//! `CONDUIT_DEMO_SECS`（デフォルト 10）秒、または Ctrl-C まで動かし、
//! 最新の dataset version を promote してから dispatcher の status を JSON で出力します。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{info, warn};

use conduit_core::app::{DispatcherBuilder, DispatcherConfig};
use conduit_core::domain::{
    Activation, ConfigVersion, CutoverOutcome, DatasetName, JobName, JobSpec, PointerName,
    ScheduleSpec, Span, StreamId, TaskPayload,
};
use conduit_core::impls::{InMemoryDeliveryQueue, InMemoryStateStore};
use conduit_core::observability::init_tracing;
use conduit_core::typed::{Handler, Operator, OperatorError, Produced};

const CLICKS: &str = "clicks.raw";
const CLICKS_DATASET: &str = "clicks";

/// Cuts one range of the clicks stream and publishes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Ingest {
    #[serde(default)]
    source: String,
}

impl Operator for Ingest {
    const NAME: &'static str = "demo.ingest.v1";
}

struct IngestHandler;

#[async_trait]
impl Handler<Ingest> for IngestHandler {
    async fn handle(&self, config: Ingest, payload: &TaskPayload) -> Result<Produced, OperatorError> {
        let Some(target) = &payload.output else {
            return Err(OperatorError::permanent("ingest needs an output binding"));
        };
        let span = payload
            .inputs
            .first()
            .map(|input| input.span)
            .unwrap_or(Span::cursor(0));
        Ok(Produced::single(
            target,
            format!("mem://{}/{}/{span}", config.source, target.stream),
            "ingest-v1",
            span,
        ))
    }
}

/// Rolls up each published range. Fails a few times first so retries show up in the logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Rollup {}

impl Operator for Rollup {
    const NAME: &'static str = "demo.rollup.v1";
}

struct RollupHandler {
    remaining_failures: AtomicU32,
}

impl RollupHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler<Rollup> for RollupHandler {
    async fn handle(&self, _config: Rollup, payload: &TaskPayload) -> Result<Produced, OperatorError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(OperatorError::retryable(format!("intentional failure (left={left})")));
        }

        for input in &payload.inputs {
            info!(
                task_id = %payload.task_id,
                span = %input.span,
                storage_ref = input.storage_ref.as_deref().unwrap_or("-"),
                "rolled up"
            );
        }
        Ok(Produced::nothing())
    }
}

fn demo_duration() -> anyhow::Result<Duration> {
    match std::env::var("CONDUIT_DEMO_SECS") {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("CONDUIT_DEMO_SECS must be an integer, got {raw:?}"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(10)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(std::env::var("CONDUIT_LOG_JSON").is_ok_and(|v| v == "1"));

    let config = DispatcherConfig::from_env().context("loading dispatcher config")?;
    let run_for = demo_duration()?;

    let dispatcher = DispatcherBuilder::new(
        Arc::new(InMemoryStateStore::new()),
        Arc::new(InMemoryDeliveryQueue::new()),
    )
    .config(config)
    .register::<Ingest, _>(IngestHandler)?
    .register::<Rollup, _>(RollupHandler::new(2))?
    .expect_operators(&[Ingest::NAME, Rollup::NAME])
    .build()?;

    let ingest = JobName::new("ingest_clicks");
    dispatcher
        .admin
        .deploy(
            ConfigVersion(1),
            vec![
                JobSpec::new(ingest.clone(), Ingest::NAME)
                    .activation(Activation::Scheduled)
                    .config(serde_json::json!({ "source": "edge" }))
                    .publishes(CLICKS, CLICKS_DATASET),
                JobSpec::new("rollup_clicks", Rollup::NAME)
                    .activation(Activation::OnEvent)
                    .input(CLICKS)
                    .max_attempts(4),
            ],
        )
        .await?;

    // Start a little in the past so the first ranges are due right away.
    let origin = chrono::Utc::now().timestamp() - 30;
    dispatcher
        .admin
        .apply_stream(
            &StreamId::new(CLICKS),
            ScheduleSpec {
                job: ingest,
                width: 5,
                origin,
            },
        )
        .await?;

    let handle = dispatcher.spawn(2);
    tokio::select! {
        _ = tokio::time::sleep(run_for) => info!(?run_for, "demo time is up"),
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!("interrupted");
        }
    }
    handle.shutdown_and_join().await;

    let promoted = dispatcher
        .cutover
        .promote_latest(&[(PointerName::new("clicks_live"), DatasetName::new(CLICKS_DATASET))])
        .await?;
    if let CutoverOutcome::Rejected { rejection } = &promoted {
        warn!(?rejection, "nothing promoted");
    }

    let status = dispatcher.admin.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
