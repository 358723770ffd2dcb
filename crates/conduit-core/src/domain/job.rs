//! Job 定義
//!
//! job は config の deploy で宣言され、以後変更されません。
//! 新しい config version で再 deploy すると、新しい `JobDefinition` に置き換わります。

use serde::{Deserialize, Serialize};

use super::ids::{ConfigVersion, DatasetName, JobId, JobName, StreamId};

/// How tasks for a job come into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Only through an operator trigger.
    Manual,
    /// One task per routed upstream event on any declared input stream.
    OnEvent,
    /// Driven by a range planner over a schedulable stream.
    Scheduled,
}

/// Where wake-ups for a job's tasks are sent.
///
/// The variants share one invocation contract (claim, heartbeat, complete);
/// they differ only in which sink receives the wake-up and what it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Function-style executor; the wake-up carries the full task payload.
    Invocation,
    /// Long-running executor polling a queue; the wake-up carries identity only.
    LongRunning,
    /// Executor hosted in the dispatcher process.
    InProcess,
}

impl ExecutionStrategy {
    pub const ALL: [ExecutionStrategy; 3] = [
        ExecutionStrategy::Invocation,
        ExecutionStrategy::LongRunning,
        ExecutionStrategy::InProcess,
    ];

    /// Whether wake-ups for this strategy embed the task payload.
    pub fn carries_payload(self) -> bool {
        matches!(self, ExecutionStrategy::Invocation)
    }
}

/// Output wiring of a job: the stream its events are emitted on and,
/// for single-output producers, the dataset it publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBinding {
    pub stream: StreamId,
    pub dataset: Option<DatasetName>,
}

/// Declarative job as written by whoever deploys configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: JobName,
    pub activation: Activation,
    pub strategy: ExecutionStrategy,
    /// Operator selector resolved by the executor.
    pub operator: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub inputs: Vec<StreamId>,
    #[serde(default)]
    pub output: Option<OutputBinding>,
    /// Overrides the dispatcher default when set.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Overrides the dispatcher lease TTL when set.
    #[serde(default)]
    pub lease_ttl_ms: Option<u64>,
}

impl JobSpec {
    pub fn new(name: impl Into<JobName>, operator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            activation: Activation::Manual,
            strategy: ExecutionStrategy::InProcess,
            operator: operator.into(),
            config: serde_json::Value::Null,
            inputs: Vec::new(),
            output: None,
            max_attempts: None,
            lease_ttl_ms: None,
        }
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn input(mut self, stream: impl Into<StreamId>) -> Self {
        self.inputs.push(stream.into());
        self
    }

    pub fn output_stream(mut self, stream: impl Into<StreamId>) -> Self {
        self.output = Some(OutputBinding {
            stream: stream.into(),
            dataset: None,
        });
        self
    }

    pub fn publishes(mut self, stream: impl Into<StreamId>, dataset: impl Into<DatasetName>) -> Self {
        self.output = Some(OutputBinding {
            stream: stream.into(),
            dataset: Some(dataset.into()),
        });
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn lease_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.lease_ttl_ms = Some(ttl_ms);
        self
    }
}

impl From<String> for JobName {
    fn from(s: String) -> Self {
        JobName::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        StreamId::new(s)
    }
}

impl From<String> for DatasetName {
    fn from(s: String) -> Self {
        DatasetName::new(s)
    }
}

/// A job as stored: one immutable row per (config version, job name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub job_id: JobId,
    pub config_version: ConfigVersion,
    pub spec: JobSpec,
}

impl JobDefinition {
    pub fn name(&self) -> &JobName {
        &self.spec.name
    }

    /// Whether a routed event on `stream` should create a task for this job.
    pub fn consumes(&self, stream: &StreamId) -> bool {
        self.spec.activation == Activation::OnEvent && self.spec.inputs.contains(stream)
    }

    pub fn output_stream(&self) -> Option<&StreamId> {
        self.spec.output.as_ref().map(|o| &o.stream)
    }

    pub fn output_dataset(&self) -> Option<&DatasetName> {
        self.spec.output.as_ref().and_then(|o| o.dataset.as_ref())
    }
}
