//! Ephemeral state of one run, folded from engine events.
//!
//! Owned by the control loop; background tasks never touch it.

use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;

use super::engine::{RunEvent, RunOutcome};

/// Cap on retained output lines; the oldest are dropped first.
const MAX_LINES: usize = 5000;

#[derive(Debug)]
pub struct RunState {
    pub lines: Vec<String>,
    /// Lines dropped from the front to respect the retention cap.
    pub dropped_lines: usize,
    progress: f64,
    pub started_at: DateTime<Local>,
    pub outcome: Option<RunOutcome>,
    cancel: CancellationToken,
}

impl RunState {
    pub fn new(started_at: DateTime<Local>, cancel: CancellationToken) -> Self {
        Self {
            lines: Vec::new(),
            dropped_lines: 0,
            progress: 0.0,
            started_at,
            outcome: None,
            cancel,
        }
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn is_running(&self) -> bool {
        self.outcome.is_none()
    }

    /// Request cancellation; the outcome arrives later as an event.
    pub fn cancel(&self) {
        if self.is_running() {
            self.cancel.cancel();
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn elapsed_secs(&self) -> i64 {
        (Local::now() - self.started_at).num_seconds().max(0)
    }

    pub fn apply(&mut self, event: RunEvent) {
        match event {
            RunEvent::Line { text, progress } => {
                if self.outcome.is_some() {
                    return;
                }
                self.progress = self.progress.max(progress.clamp(0.0, 1.0));
                self.lines.push(text);
                if self.lines.len() > MAX_LINES {
                    let excess = self.lines.len() - MAX_LINES;
                    self.lines.drain(..excess);
                    self.dropped_lines += excess;
                }
            }
            RunEvent::Finished(outcome) => {
                if self.outcome.is_some() {
                    return;
                }
                if outcome == RunOutcome::Success {
                    self.progress = 1.0;
                }
                self.outcome = Some(outcome);
            }
        }
    }
}
