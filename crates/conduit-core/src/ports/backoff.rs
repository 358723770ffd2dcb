//! Backoff ポリシー - すべての retry 経路で共有
//!
//! retry scheduler、lease reaper、明示的な失敗はすべて同じ strategy を読むので、
//! task の次の遅延は attempt の終わり方に依存しません。

use std::time::Duration;

pub trait BackoffStrategy: Send + Sync {
    /// Delay before retrying after failure number `attempt` (1-indexed).
    fn delay(&self, attempt: u32) -> Duration;

    fn delay_ms(&self, attempt: u32) -> u64 {
        u64::try_from(self.delay(attempt).as_millis()).unwrap_or(u64::MAX)
    }
}

/// `base * multiplier^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            max,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 2.0, Duration::from_secs(300))
    }
}

impl BackoffStrategy for ExponentialBackoff {
    /// With base=2s, multiplier=2.0:
    /// - attempt 1: 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}
