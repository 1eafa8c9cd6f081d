//! Portal onboarding scenarios.
//!
//! Each scenario is a deterministic sequence of steps driven through the
//! [`portal_driver::Driver`] trait, synchronized with the flow primitives
//! from `scenario_flow`. Scenarios never sleep for fixed durations and never
//! rely on an ambient "current page"; every step names the page it acts on.

pub mod config;
pub mod report;
pub mod scenarios;
pub mod steps;

pub use config::{ScenarioConfig, UserProfile};
pub use report::{Artifacts, ScenarioReport};
pub use scenarios::{run_scenario, ScenarioKind};
pub use steps::TokenCapture;
