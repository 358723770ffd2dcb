//! RangePlanner - スケジュール stream を固定幅の range に切り出す
//!
//! 位置は epoch 秒です。range `[start, start + width)` は end を過ぎた時点で計画されます。
//! 各 range は `(stream, range)` の一意性行と task を一緒に挿入するので、
//! 同じ区間を二度（あるいは二つのレプリカから）計画しても task は range ごとに 1 つです。
//!
//! range task はそれを計画した stream に帰属し、in-flight 数と last error もそこに計上されます。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{RangeSpan, StreamId, StreamRecord, TaskId, TaskTrigger};
use crate::error::ConduitError;
use crate::ports::{Clock, ScheduleOutcome, StateStore};

use super::pacer::{Pacer, sleep_or_shutdown};
use super::tasks::TaskFactory;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReport {
    pub scheduled: Vec<TaskId>,
    /// Ranges that already had a task.
    pub existing: usize,
    /// Streams skipped because they are paused.
    pub paused: usize,
}

impl PlanReport {
    fn absorb(&mut self, other: PlanReport) {
        self.scheduled.extend(other.scheduled);
        self.existing += other.existing;
        self.paused += other.paused;
    }
}

/// Ranges due for a stream with the given schedule and progress.
pub fn due_ranges(origin: i64, width: i64, planned_through: Option<i64>, now: i64, limit: usize) -> Vec<RangeSpan> {
    let mut start = planned_through.map_or(origin, |p| p.max(origin));
    let mut ranges = Vec::new();
    while ranges.len() < limit {
        let Some(end) = start.checked_add(width) else {
            break;
        };
        if end > now {
            break;
        }
        ranges.push(RangeSpan::new(start, end));
        start = end;
    }
    ranges
}

#[derive(Clone)]
pub struct RangePlanner {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    tasks: TaskFactory,
    max_ranges: usize,
    poll: Duration,
}

impl RangePlanner {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        tasks: TaskFactory,
        max_ranges: usize,
        poll: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            tasks,
            max_ranges,
            poll,
        }
    }

    /// Plan every due range of one stream.
    pub async fn plan_stream(&self, stream: &StreamId) -> Result<PlanReport, ConduitError> {
        let record = self
            .store
            .get_stream(stream)
            .await?
            .ok_or_else(|| ConduitError::UnknownStream(stream.clone()))?;
        self.plan_record(&record).await
    }

    /// One pass over all scheduled, unpaused streams.
    pub async fn tick(&self) -> Result<PlanReport, ConduitError> {
        let mut report = PlanReport::default();
        for record in self.store.list_streams().await? {
            if record.schedule.is_none() {
                continue;
            }
            match self.plan_record(&record).await {
                Ok(r) => report.absorb(r),
                Err(e) if e.is_transient() => return Err(e),
                // One misconfigured stream does not hold up the others.
                Err(e) => warn!(stream = %record.stream, error = %e, "stream not planned"),
            }
        }
        Ok(report)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("range planner started");
        let mut pacer = Pacer::new(self.poll);
        loop {
            let delay = match self.tick().await {
                // Each tick is already capped at max_ranges per stream; keep going while capped.
                Ok(report) => pacer.after_success(report.scheduled.len() >= self.max_ranges),
                Err(e) => {
                    warn!(error = %e, "planner tick failed");
                    pacer.after_failure()
                }
            };
            if sleep_or_shutdown(&mut shutdown, delay).await {
                break;
            }
        }
        info!("range planner stopped");
    }

    async fn plan_record(&self, record: &StreamRecord) -> Result<PlanReport, ConduitError> {
        let mut report = PlanReport::default();
        let Some(schedule) = &record.schedule else {
            return Ok(report);
        };
        if record.paused {
            report.paused = 1;
            return Ok(report);
        }
        if schedule.width <= 0 {
            return Err(ConduitError::InvalidSchedule {
                stream: record.stream.clone(),
                reason: format!("width must be positive, got {}", schedule.width),
            });
        }

        let active = self
            .store
            .pointer_snapshot()
            .await?
            .set
            .config_version
            .ok_or(ConduitError::NoActiveConfig)?;
        let job = self
            .store
            .jobs_for_version(active)
            .await?
            .into_iter()
            .find(|job| job.name() == &schedule.job)
            .ok_or_else(|| ConduitError::UnknownJob {
                job: schedule.job.clone(),
                config_version: active,
            })?;

        let now = self.clock.now();
        let ranges = due_ranges(
            schedule.origin,
            schedule.width,
            record.planned_through,
            now.timestamp(),
            self.max_ranges,
        );

        for range in ranges {
            let task = self.tasks.build(
                &job,
                TaskTrigger::Range {
                    stream: record.stream.clone(),
                    range,
                },
                format!("range:{}:{}", record.stream, range),
            );
            match self.store.schedule_range(&record.stream, range, task, now).await? {
                ScheduleOutcome::Scheduled { task_id } => {
                    debug!(stream = %record.stream, %range, %task_id, "range scheduled");
                    report.scheduled.push(task_id);
                }
                ScheduleOutcome::AlreadyScheduled { .. } => report.existing += 1,
            }
        }

        if !report.scheduled.is_empty() {
            info!(stream = %record.stream, ranges = report.scheduled.len(), "ranges planned");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::nothing_due(0, 60, None, 59, vec![])]
    #[case::one_due(0, 60, None, 60, vec![(0, 60)])]
    #[case::resumes_from_planned(0, 60, Some(120), 250, vec![(120, 180), (180, 240)])]
    #[case::planned_before_origin(100, 10, Some(50), 125, vec![(100, 110), (110, 120)])]
    fn due_ranges_cases(
        #[case] origin: i64,
        #[case] width: i64,
        #[case] planned: Option<i64>,
        #[case] now: i64,
        #[case] expected: Vec<(i64, i64)>,
    ) {
        let got: Vec<(i64, i64)> = due_ranges(origin, width, planned, now, 10)
            .into_iter()
            .map(|r| (r.start, r.end))
            .collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn due_ranges_respects_limit() {
        assert_eq!(due_ranges(0, 1, None, 1_000, 5).len(), 5);
    }
}
