//! Scenario flow controller.
//!
//! Sequencing primitives for driving a multi-page, multi-actor UI without
//! unconditioned sleeps: bounded waits, first-to-resolve races over pending
//! outcomes, pre-registered one-shot event waits (so a trigger can never
//! outrun its listener), and bounded re-assertion of flaky UI state.

pub mod errors;
pub mod retry;
pub mod run;
pub mod sync;

pub use errors::FlowError;
pub use retry::{assert_eventually_visible, Condition, RetryBudget, SelectorVisible};
pub use run::{RunPhase, StepTracker};
pub use sync::{await_first_of, await_spawned_page, with_bounded_wait, EventWaiter, Outcome};
