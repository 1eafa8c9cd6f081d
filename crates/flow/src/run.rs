//! Scenario run lifecycle.
//!
//! `NotStarted → InProgress → {Completed, Failed}`; a failed run is terminal
//! and must be re-run from scratch, since partially mutated UI state (a
//! half-registered account, a read mailbox message) is never rolled back.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// Lifecycle phase of a single scenario run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunPhase {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

struct RunState {
    phase: RunPhase,
    current_step: String,
}

/// Shared handle on a run's phase and current step.
///
/// The step label is what turns a bare wall-clock timeout into an
/// attributable failure: whoever enforces the overall budget reads the label
/// to name the step that stalled.
#[derive(Clone)]
pub struct StepTracker {
    state: Arc<Mutex<RunState>>,
}

impl StepTracker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RunState {
                phase: RunPhase::NotStarted,
                current_step: String::new(),
            })),
        }
    }

    pub fn begin(&self) {
        let mut state = self.state.lock();
        if state.phase == RunPhase::NotStarted {
            state.phase = RunPhase::InProgress;
        }
    }

    /// Record the step about to execute. Ignored outside `InProgress`.
    pub fn enter(&self, step: &str) {
        let mut state = self.state.lock();
        if state.phase == RunPhase::InProgress {
            trace!(step, "entering step");
            state.current_step = step.to_string();
        }
    }

    pub fn complete(&self) {
        let mut state = self.state.lock();
        if state.phase == RunPhase::InProgress {
            state.phase = RunPhase::Completed;
        }
    }

    /// Terminal; a failed run cannot transition again.
    pub fn fail(&self) {
        let mut state = self.state.lock();
        if state.phase != RunPhase::Completed {
            state.phase = RunPhase::Failed;
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.state.lock().phase
    }

    pub fn current_step(&self) -> String {
        self.state.lock().current_step.clone()
    }
}

impl Default for StepTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_happy_path() {
        let tracker = StepTracker::new();
        assert_eq!(tracker.phase(), RunPhase::NotStarted);

        tracker.begin();
        assert_eq!(tracker.phase(), RunPhase::InProgress);

        tracker.enter("register user");
        assert_eq!(tracker.current_step(), "register user");

        tracker.complete();
        assert_eq!(tracker.phase(), RunPhase::Completed);
    }

    #[test]
    fn failed_is_terminal() {
        let tracker = StepTracker::new();
        tracker.begin();
        tracker.enter("open inbox");
        tracker.fail();
        assert_eq!(tracker.phase(), RunPhase::Failed);

        tracker.begin();
        tracker.complete();
        assert_eq!(tracker.phase(), RunPhase::Failed);
        // Step label of the failure point survives for attribution.
        assert_eq!(tracker.current_step(), "open inbox");
    }

    #[test]
    fn steps_ignored_before_begin() {
        let tracker = StepTracker::new();
        tracker.enter("too early");
        assert_eq!(tracker.current_step(), "");
    }
}
