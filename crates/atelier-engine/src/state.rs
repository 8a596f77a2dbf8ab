use std::time::{Duration, Instant};

use atelier_contracts::events::{EventPayload, EventWriter, RETRY_SCHEDULED};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Submitted,
    InProgress,
    Completed,
    Failed,
    TimedOut,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

/// Per-call bookkeeping. Created when a job is submitted, dropped when it
/// reaches a terminal phase; never shared between jobs.
#[derive(Debug)]
pub struct JobState {
    job_id: String,
    phase: JobPhase,
    started: Instant,
    /// Retries performed so far, across every request of the job.
    pub attempt: u32,
    pub provider_job_id: Option<String>,
    pub raw_accumulator: String,
    warnings: Vec<String>,
    events: Option<EventWriter>,
}

impl JobState {
    pub fn new(job_id: impl Into<String>, events: Option<EventWriter>) -> Self {
        Self {
            job_id: job_id.into(),
            phase: JobPhase::Submitted,
            started: Instant::now(),
            attempt: 0,
            provider_job_id: None,
            raw_accumulator: String::new(),
            warnings: Vec::new(),
            events,
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Moves to `next` unless a terminal phase was already reached.
    pub fn advance(&mut self, next: JobPhase) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.phase = next;
        true
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        if message.trim().is_empty() || self.warnings.iter().any(|row| row == &message) {
            return;
        }
        self.warnings.push(message);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    pub fn record_retry(&mut self, label: &str, attempt: u32, delay: Duration, reason: &str) {
        self.attempt += 1;
        let mut payload = EventPayload::new();
        payload.insert("label".to_string(), Value::String(label.to_string()));
        payload.insert("attempt".to_string(), Value::from(attempt));
        payload.insert("delay_s".to_string(), Value::from(delay.as_secs_f64()));
        payload.insert("reason".to_string(), Value::String(reason.to_string()));
        self.emit(RETRY_SCHEDULED, payload);
    }

    /// Writes a job event; a log failure is kept as a warning instead of failing the job.
    pub fn emit(&mut self, event_type: &str, payload: EventPayload) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.emit(&self.job_id, event_type, payload) {
            let message = format!("event log write failed ({event_type}): {err}");
            self.warn(message);
        }
    }
}
