//! meshpilot library surface.
//!
//! The binary is a thin wrapper over [`cli::app::run`]; the runner is
//! exported so integration tests can execute scenarios without going
//! through argument parsing.

pub mod cli;
pub mod runner;

pub use runner::{RunOptions, RunSummary};
