//! Execution Timeline
//!
//! Records when steps start and finish so a run can be summarized as
//! per-step durations or an ASCII Gantt chart.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    /// Up to date, not run
    Skipped,
    Failed,
}

/// A single event, stamped relative to the start of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    pub step_id: String,
    pub event_type: EventType,
    pub at: Duration,
}

/// Tracks the execution timeline of a workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record(&mut self, step_id: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            event_type,
            at: self.start_time.elapsed(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Time since the timeline was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Start and end offsets of every step that started and then finished.
    fn spans(&self) -> Vec<(String, Duration, Duration)> {
        let mut starts: BTreeMap<&str, Duration> = BTreeMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            match event.event_type {
                EventType::Started => {
                    starts.insert(&event.step_id, event.at);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.remove(event.step_id.as_str()) {
                        spans.push((event.step_id.clone(), start, event.at));
                    }
                }
                EventType::Skipped => {}
            }
        }

        spans.sort_by_key(|(_, start, _)| *start);
        spans
    }

    /// Wall time of each step that ran.
    pub fn durations(&self) -> BTreeMap<String, Duration> {
        self.spans()
            .into_iter()
            .map(|(id, start, end)| (id, end.saturating_sub(start)))
            .collect()
    }

    /// Renders an ASCII Gantt chart `width` columns wide.
    ///
    /// ```
    /// use rulegraph::monitoring::{EventType, ExecutionTimeline};
    ///
    /// let mut timeline = ExecutionTimeline::new();
    /// timeline.record("align", EventType::Started);
    /// timeline.record("align", EventType::Completed);
    /// assert!(timeline.gantt_chart(40).contains("align"));
    /// ```
    pub fn gantt_chart(&self, width: usize) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");
        let spans = self.spans();

        let total = spans
            .iter()
            .map(|(_, _, end)| *end)
            .max()
            .unwrap_or_default()
            .max(Duration::from_millis(1));
        let width = width.max(1);
        let scale = width as f64 / total.as_secs_f64();

        for (step_id, start, end) in &spans {
            let offset = ((start.as_secs_f64() * scale) as usize).min(width - 1);
            let length = (((*end - *start).as_secs_f64() * scale) as usize)
                .max(1)
                .min(width - offset);

            let bar = format!(
                "{}{}{}",
                " ".repeat(offset),
                "#".repeat(length),
                " ".repeat(width - offset - length)
            );
            output.push_str(&format!(
                "{} |{}| ({} ms)\n",
                truncate(step_id, 16),
                bar,
                (*end - *start).as_millis()
            ));
        }

        let skipped = self
            .events
            .iter()
            .filter(|e| e.event_type == EventType::Skipped)
            .count();
        if skipped > 0 {
            output.push_str(&format!("\n{} step(s) up to date\n", skipped));
        }
        output.push_str(&format!("\nTotal: {} ms\n", total.as_millis()));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or shortens a label to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
