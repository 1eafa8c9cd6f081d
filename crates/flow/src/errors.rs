//! Flow control error types.

use portal_driver::DriverError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the flow controller.
///
/// Only `Timeout` is ever retried, and only inside
/// [`assert_eventually_visible`](crate::retry::assert_eventually_visible).
/// Everything else is fatal to the current scenario run.
#[derive(Debug, Error)]
pub enum FlowError {
    /// An awaited condition did not occur within its budget.
    #[error("step '{step}' timed out after {waited:?}")]
    Timeout { step: String, waited: Duration },

    /// Terminal form of `Timeout` once the retry budget is exhausted;
    /// carries the final attempt's real failure.
    #[error("condition '{condition}' not satisfied after {attempts} attempts")]
    AssertionTimeout {
        condition: String,
        attempts: u32,
        #[source]
        source: Box<FlowError>,
    },

    /// `await_first_of` was handed nothing to race.
    #[error("race set is empty")]
    EmptyRaceSet,

    /// Driver failure (element not found, protocol i/o). Never retried.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl FlowError {
    /// Step or condition description attached to the error, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            FlowError::Timeout { step, .. } => Some(step),
            FlowError::AssertionTimeout { condition, .. } => Some(condition),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FlowError::Timeout { .. } | FlowError::AssertionTimeout { .. }
        )
    }
}
