//! Run Timeline
//!
//! Records when each workflow starts and finishes so the CLI can show
//! per-workflow durations and an ASCII Gantt chart of the run.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
}

/// A single event in the run timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Workflow key (`tool_name`)
    pub workflow: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Start/end span of one workflow, in milliseconds since run start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub workflow: String,
    pub start_ms: u128,
    pub end_ms: u128,
    pub failed: bool,
}

impl Span {
    pub fn duration_ms(&self) -> u128 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Tracks the execution timeline of a run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_event(&mut self, workflow: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            workflow: workflow.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finished workflows ordered by start time.
    pub fn spans(&self) -> Vec<Span> {
        let mut starts: HashMap<&str, u128> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            let at = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    starts.insert(event.workflow.as_str(), at);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.remove(event.workflow.as_str()) {
                        spans.push(Span {
                            workflow: event.workflow.clone(),
                            start_ms: start,
                            end_ms: at,
                            failed: event.event_type == EventType::Failed,
                        });
                    }
                }
            }
        }

        spans.sort_by(|a, b| a.start_ms.cmp(&b.start_ms).then_with(|| a.workflow.cmp(&b.workflow)));
        spans
    }

    /// Workflow durations in milliseconds.
    pub fn durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .map(|span| {
                let ms = span.duration_ms();
                (span.workflow, ms)
            })
            .collect()
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each workflow is a bar scaled to 50 columns of total run time;
    /// failed workflows are drawn with `x`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }
        let scale = 50.0 / total_time as f64;

        for span in self.spans() {
            let start_pos = (span.start_ms as f64 * scale) as usize;
            let width = (span.duration_ms() as f64 * scale).max(1.0) as usize;
            let mark = if span.failed { "x" } else { "#" };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&mark.repeat(width));

            output.push_str(&format!(
                "{} |{:<51}| ({} ms)\n",
                truncate(&span.workflow, 24),
                bar,
                span.duration_ms()
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
