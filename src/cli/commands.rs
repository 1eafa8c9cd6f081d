use clap::Subcommand;

use super::doctor::DoctorArgs;
use super::run::RunArgs;

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// List the available scenarios
    List,

    /// Run one or more scenarios against the portal
    Run(RunArgs),

    /// Check the local environment (browser binary, portal reachability knobs)
    Doctor(DoctorArgs),
}
