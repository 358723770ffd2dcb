//! バックグラウンドループ共通のポーリング間隔制御

use std::time::Duration;

use tokio::sync::watch;

use crate::ports::{BackoffStrategy, ExponentialBackoff};

/// Decides how long a loop sleeps after each tick: no wait while there is work,
/// the poll interval when idle, exponential backoff after failures.
pub(crate) struct Pacer {
    idle: Duration,
    backoff: ExponentialBackoff,
    failures: u32,
}

impl Pacer {
    pub(crate) fn new(idle: Duration) -> Self {
        Self {
            idle,
            backoff: ExponentialBackoff::new(idle, 2.0, idle.saturating_mul(32)),
            failures: 0,
        }
    }

    pub(crate) fn after_success(&mut self, busy: bool) -> Duration {
        self.failures = 0;
        if busy { Duration::ZERO } else { self.idle }
    }

    pub(crate) fn after_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.backoff.delay(self.failures)
    }
}

/// Sleep for `delay` unless shutdown is requested first.
///
/// Returns `true` when the loop should stop. A dropped sender counts as shutdown.
pub(crate) async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    if delay.is_zero() {
        tokio::task::yield_now().await;
        return *shutdown.borrow();
    }
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
    }
}
