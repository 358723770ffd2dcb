//! Dispatcher の設定
//!
//! デフォルトのままで動きます。`from_env` が `CONDUIT_*` 環境変数で上書きします。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ports::ExponentialBackoff;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} is malformed: {reason}")]
    Malformed { name: String, reason: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Lease length granted on claim and on each heartbeat.
    pub lease_ttl_ms: u64,
    pub heartbeat_interval_ms: u64,

    pub outbox_poll_ms: u64,
    pub outbox_batch: usize,
    pub outbox_backoff_base_ms: u64,
    pub outbox_backoff_max_ms: u64,
    /// Done rows older than this are deleted by the drainer.
    pub outbox_retention_ms: u64,

    pub retry_poll_ms: u64,
    pub retry_batch: usize,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_multiplier: f64,
    pub retry_backoff_max_ms: u64,
    pub default_max_attempts: u32,

    pub reaper_poll_ms: u64,
    pub reaper_batch: usize,

    pub planner_poll_ms: u64,
    /// Upper bound on ranges emitted per stream per tick.
    pub planner_max_ranges: usize,

    /// Queue namespace wake-ups go to when no sink is registered.
    pub namespace: String,
    pub pop_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            outbox_poll_ms: 200,
            outbox_batch: 100,
            outbox_backoff_base_ms: 100,
            outbox_backoff_max_ms: 30_000,
            outbox_retention_ms: 3_600_000,
            retry_poll_ms: 500,
            retry_batch: 100,
            retry_backoff_base_ms: 2_000,
            retry_backoff_multiplier: 2.0,
            retry_backoff_max_ms: 300_000,
            default_max_attempts: 5,
            reaper_poll_ms: 1_000,
            reaper_batch: 100,
            planner_poll_ms: 1_000,
            planner_max_ranges: 50,
            namespace: "default".to_string(),
            pop_timeout_ms: 1_000,
        }
    }
}

impl DispatcherConfig {
    /// Defaults overlaid with `CONDUIT_*` environment variables, then validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };
        let mut c = Self::default();

        env.u64("CONDUIT_LEASE_TTL_MS", &mut c.lease_ttl_ms)?;
        env.u64("CONDUIT_HEARTBEAT_INTERVAL_MS", &mut c.heartbeat_interval_ms)?;
        env.u64("CONDUIT_OUTBOX_POLL_MS", &mut c.outbox_poll_ms)?;
        env.usize("CONDUIT_OUTBOX_BATCH", &mut c.outbox_batch)?;
        env.u64("CONDUIT_OUTBOX_BACKOFF_BASE_MS", &mut c.outbox_backoff_base_ms)?;
        env.u64("CONDUIT_OUTBOX_BACKOFF_MAX_MS", &mut c.outbox_backoff_max_ms)?;
        env.u64("CONDUIT_OUTBOX_RETENTION_MS", &mut c.outbox_retention_ms)?;
        env.u64("CONDUIT_RETRY_POLL_MS", &mut c.retry_poll_ms)?;
        env.usize("CONDUIT_RETRY_BATCH", &mut c.retry_batch)?;
        env.u64("CONDUIT_RETRY_BACKOFF_BASE_MS", &mut c.retry_backoff_base_ms)?;
        env.f64("CONDUIT_RETRY_BACKOFF_MULTIPLIER", &mut c.retry_backoff_multiplier)?;
        env.u64("CONDUIT_RETRY_BACKOFF_MAX_MS", &mut c.retry_backoff_max_ms)?;
        env.u32("CONDUIT_DEFAULT_MAX_ATTEMPTS", &mut c.default_max_attempts)?;
        env.u64("CONDUIT_REAPER_POLL_MS", &mut c.reaper_poll_ms)?;
        env.usize("CONDUIT_REAPER_BATCH", &mut c.reaper_batch)?;
        env.u64("CONDUIT_PLANNER_POLL_MS", &mut c.planner_poll_ms)?;
        env.usize("CONDUIT_PLANNER_MAX_RANGES", &mut c.planner_max_ranges)?;
        env.u64("CONDUIT_POP_TIMEOUT_MS", &mut c.pop_timeout_ms)?;
        if let Some(ns) = env.string("CONDUIT_NAMESPACE") {
            c.namespace = ns;
        }

        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("lease_ttl_ms", self.lease_ttl_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("outbox_poll_ms", self.outbox_poll_ms),
            ("retry_poll_ms", self.retry_poll_ms),
            ("reaper_poll_ms", self.reaper_poll_ms),
            ("planner_poll_ms", self.planner_poll_ms),
            ("outbox_batch", self.outbox_batch as u64),
            ("retry_batch", self.retry_batch as u64),
            ("reaper_batch", self.reaper_batch as u64),
            ("planner_max_ranges", self.planner_max_ranges as u64),
            ("default_max_attempts", u64::from(self.default_max_attempts)),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }

        if self.heartbeat_interval_ms >= self.lease_ttl_ms {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be shorter than lease_ttl_ms".into(),
            ));
        }
        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            return Err(ConfigError::Invalid(
                "retry_backoff_base_ms must not exceed retry_backoff_max_ms".into(),
            ));
        }
        if self.outbox_backoff_base_ms > self.outbox_backoff_max_ms {
            return Err(ConfigError::Invalid(
                "outbox_backoff_base_ms must not exceed outbox_backoff_max_ms".into(),
            ));
        }
        if !(self.retry_backoff_multiplier.is_finite() && self.retry_backoff_multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "retry_backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".into()));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn outbox_poll(&self) -> Duration {
        Duration::from_millis(self.outbox_poll_ms)
    }

    pub fn outbox_retention(&self) -> Duration {
        Duration::from_millis(self.outbox_retention_ms)
    }

    pub fn retry_poll(&self) -> Duration {
        Duration::from_millis(self.retry_poll_ms)
    }

    pub fn reaper_poll(&self) -> Duration {
        Duration::from_millis(self.reaper_poll_ms)
    }

    pub fn planner_poll(&self) -> Duration {
        Duration::from_millis(self.planner_poll_ms)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    /// Task retry policy, shared by explicit failures and lease expiry.
    pub fn retry_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.retry_backoff_base_ms),
            self.retry_backoff_multiplier,
            Duration::from_millis(self.retry_backoff_max_ms),
        )
    }

    /// Redelivery policy for outbox rows.
    pub fn outbox_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.outbox_backoff_base_ms),
            2.0,
            Duration::from_millis(self.outbox_backoff_max_ms),
        )
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn parse<T>(&self, name: &str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(v) = self.string(name) else {
            return Ok(());
        };
        *slot = v.parse::<T>().map_err(|e| ConfigError::Malformed {
            name: name.to_string(),
            reason: format!("{e} (got {v:?})"),
        })?;
        Ok(())
    }

    fn u64(&self, name: &str, slot: &mut u64) -> Result<(), ConfigError> {
        self.parse(name, slot)
    }

    fn u32(&self, name: &str, slot: &mut u32) -> Result<(), ConfigError> {
        self.parse(name, slot)
    }

    fn usize(&self, name: &str, slot: &mut usize) -> Result<(), ConfigError> {
        self.parse(name, slot)
    }

    fn f64(&self, name: &str, slot: &mut f64) -> Result<(), ConfigError> {
        self.parse(name, slot)
    }
}
