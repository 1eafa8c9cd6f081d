use anyhow::Result;

use super::commands::Commands;
use super::doctor::cmd_doctor;
use super::env::CliArgs;
use super::list::cmd_list;
use super::run::cmd_run;

pub async fn dispatch(cli: &CliArgs) -> Result<()> {
    match &cli.command {
        Commands::List => cmd_list(),
        Commands::Run(args) => cmd_run(args.clone()).await,
        Commands::Doctor(args) => cmd_doctor(args.clone()).await,
    }
}
