//! Scenario run reports and captured artifacts.

use chrono::{DateTime, Utc};
use scenario_flow::RunPhase;
use serde::Serialize;

/// Artifacts captured during a run; retained on failure for diagnosis.
#[derive(Debug, Default)]
pub struct Artifacts {
    /// Labelled PNG screenshots in capture order.
    pub screenshots: Vec<(String, Vec<u8>)>,
    /// Console lines and runner notes.
    pub console: Vec<String>,
}

impl Artifacts {
    pub fn add_screenshot(&mut self, label: impl Into<String>, bytes: Vec<u8>) {
        self.screenshots.push((label.into(), bytes));
    }

    pub fn note(&mut self, line: impl Into<String>) {
        self.console.push(line.into());
    }
}

/// Outcome of one scenario run as handed back to the runner.
#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    #[serde(serialize_with = "phase_str")]
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Step active when the run failed, for timeout attribution.
    pub failed_step: Option<String>,
    pub error: Option<String>,
    #[serde(skip)]
    pub artifacts: Artifacts,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.phase == RunPhase::Completed
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

fn phase_str<S: serde::Serializer>(phase: &RunPhase, ser: S) -> Result<S::Ok, S::Error> {
    let label = match phase {
        RunPhase::NotStarted => "not-started",
        RunPhase::InProgress => "in-progress",
        RunPhase::Completed => "completed",
        RunPhase::Failed => "failed",
    };
    ser.serialize_str(label)
}
