//! Stream, span, cursor, スケジュール済み range

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::ErrorInfo;
use super::ids::{JobName, StreamId, TaskId, VersionId};

/// Half-open interval `[start, end)` over a stream's position axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RangeSpan {
    pub start: i64,
    pub end: i64,
}

impl RangeSpan {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn width(&self) -> i64 {
        self.end - self.start
    }
}

impl fmt::Display for RangeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// What part of a stream an event or publication covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Span {
    Cursor { position: i64 },
    Range(RangeSpan),
}

impl Span {
    pub fn cursor(position: i64) -> Self {
        Span::Cursor { position }
    }

    pub fn range(start: i64, end: i64) -> Self {
        Span::Range(RangeSpan::new(start, end))
    }

    /// Position the stream cursor reaches once this span is processed.
    pub fn high_water(&self) -> i64 {
        match self {
            Span::Cursor { position } => *position,
            Span::Range(range) => range.end,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Span::Cursor { position } => write!(f, "@{position}"),
            Span::Range(range) => write!(f, "[{range})"),
        }
    }
}

/// A stream identity pinned to the generation it was produced under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamRef {
    pub stream: StreamId,
    pub generation: u64,
}

impl StreamRef {
    pub fn new(stream: impl Into<StreamId>, generation: u64) -> Self {
        Self {
            stream: stream.into(),
            generation,
        }
    }
}

impl fmt::Display for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stream, self.generation)
    }
}

/// A committed output event, routed to dependents by the event router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub source: StreamRef,
    pub span: Span,
    /// Dataset version published alongside the event, if any.
    #[serde(default)]
    pub version: Option<VersionId>,
}

impl OutputEvent {
    pub fn new(source: StreamRef, span: Span) -> Self {
        Self {
            source,
            span,
            version: None,
        }
    }

    /// Stable identity of the event; the same event always maps to the same key.
    pub fn dedupe_key(&self) -> String {
        format!("event:{}:{}", self.source, self.span)
    }
}

/// How a schedulable stream is cut into ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Job that processes each range; resolved against the active config version.
    pub job: JobName,
    pub width: i64,
    pub origin: i64,
}

/// Per-stream progress row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub stream: StreamId,
    pub generation: u64,
    /// Monotonic high-water mark of processed positions.
    pub cursor: Option<i64>,
    /// End of the last range handed to the planner.
    pub planned_through: Option<i64>,
    pub schedule: Option<ScheduleSpec>,
    pub paused: bool,
    pub last_error: Option<ErrorInfo>,
    pub updated_at: DateTime<Utc>,
}

impl StreamRecord {
    pub fn new(stream: StreamId, now: DateTime<Utc>) -> Self {
        Self {
            stream,
            generation: 0,
            cursor: None,
            planned_through: None,
            schedule: None,
            paused: false,
            last_error: None,
            updated_at: now,
        }
    }

    pub fn stream_ref(&self) -> StreamRef {
        StreamRef {
            stream: self.stream.clone(),
            generation: self.generation,
        }
    }

    /// Move the cursor forward to `position`. Never moves it back.
    ///
    /// Returns whether the cursor changed.
    pub fn advance_cursor(&mut self, position: i64, now: DateTime<Utc>) -> bool {
        match self.cursor {
            Some(current) if current >= position => false,
            _ => {
                self.cursor = Some(position);
                self.updated_at = now;
                true
            }
        }
    }

    pub fn advance_planned(&mut self, end: i64, now: DateTime<Utc>) {
        if self.planned_through.is_none_or(|p| p < end) {
            self.planned_through = Some(end);
            self.updated_at = now;
        }
    }
}

/// Uniqueness row for `(stream, range)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRange {
    pub stream: StreamId,
    pub range: RangeSpan,
    pub task_id: TaskId,
    pub created_at: DateTime<Utc>,
}

/// An event whose generation was superseded before it could be routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleEvent {
    pub event: OutputEvent,
    pub current_generation: u64,
    pub recorded_at: DateTime<Utc>,
}
