use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use super::dispatch::dispatch;
use super::env::CliArgs;
use super::runtime::{init_logging, load_local_env_overrides};

pub async fn run() -> Result<()> {
    load_local_env_overrides();
    let cli = CliArgs::parse();

    init_logging(&cli.log_level, cli.debug)?;
    info!("meshpilot v{}", env!("CARGO_PKG_VERSION"));

    match dispatch(&cli).await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!("command failed: {err:#}");
            Err(err)
        }
    }
}
