use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Args;
use portal_scenarios::ScenarioKind;

use crate::runner::{run_scenarios, RunOptions};

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Scenario names to run (see `meshpilot list`)
    pub scenarios: Vec<String>,

    /// Run every known scenario
    #[arg(long, conflicts_with = "scenarios")]
    pub all: bool,

    /// Portal root url (defaults to MESHPILOT_PORTAL_URL)
    #[arg(long)]
    pub portal_url: Option<String>,

    /// Organization name override
    #[arg(long)]
    pub org_name: Option<String>,

    /// Run the browser headless
    #[arg(long)]
    pub headless: bool,

    /// Record video when the environment supports it
    #[arg(long)]
    pub video: bool,

    /// Overall wall-clock budget per scenario (e.g. 90s, 2m)
    #[arg(long, value_parser = humantime::parse_duration, default_value = "90s")]
    pub budget: Duration,

    /// Per-step wait bound
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    pub step_timeout: Duration,

    /// Directory for failure screenshots and reports
    #[arg(long, default_value = "artifacts")]
    pub artifacts_dir: PathBuf,
}

pub async fn cmd_run(args: RunArgs) -> Result<()> {
    let kinds: Vec<ScenarioKind> = if args.all {
        ScenarioKind::all().to_vec()
    } else if args.scenarios.is_empty() {
        bail!("no scenario named; pass names or --all (see `meshpilot list`)");
    } else {
        args.scenarios
            .iter()
            .map(|name| {
                ScenarioKind::from_name(name)
                    .ok_or_else(|| anyhow!("unknown scenario {name:?} (see `meshpilot list`)"))
            })
            .collect::<Result<_>>()?
    };

    let options = RunOptions {
        kinds,
        portal_url: args.portal_url,
        org_name: args.org_name,
        headless: args.headless,
        video: args.video,
        budget: args.budget,
        step_timeout: args.step_timeout,
        artifacts_dir: args.artifacts_dir,
    };

    let summary = run_scenarios(options).await?;
    summary.print();
    if summary.failed > 0 {
        bail!("{} of {} scenarios failed", summary.failed, summary.total());
    }
    Ok(())
}
