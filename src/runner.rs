//! Sequential scenario runner behind the `run` subcommand.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{info, warn};

use portal_driver::{detect_chrome_executable, event_bus, CdpDriver, DriverConfig};
use portal_scenarios::{run_scenario, ScenarioConfig, ScenarioKind, ScenarioReport};

pub struct RunOptions {
    pub kinds: Vec<ScenarioKind>,
    pub portal_url: Option<String>,
    pub org_name: Option<String>,
    pub headless: bool,
    pub video: bool,
    pub budget: Duration,
    pub step_timeout: Duration,
    pub artifacts_dir: PathBuf,
}

pub struct RunSummary {
    pub reports: Vec<ScenarioReport>,
    pub failed: usize,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.reports.len()
    }

    pub fn print(&self) {
        println!();
        for report in &self.reports {
            let verdict = if report.passed() { "PASS" } else { "FAIL" };
            print!(
                "{verdict}  {:<28} {:>6}ms",
                report.name,
                report.duration_ms()
            );
            match (&report.failed_step, &report.error) {
                (Some(step), Some(err)) => println!("  at {step:?}: {err}"),
                _ => println!(),
            }
        }
        println!(
            "\n{} passed, {} failed",
            self.total() - self.failed,
            self.failed
        );
    }
}

/// Run the requested scenarios one after another against a single browser.
/// Failed runs leave their screenshots and a JSON report under the
/// artifacts directory; a failure never stops the remaining scenarios.
pub async fn run_scenarios(options: RunOptions) -> Result<RunSummary> {
    let driver_cfg = DriverConfig {
        executable: detect_chrome_executable().unwrap_or_default(),
        headless: options.headless || DriverConfig::default().headless,
        ..DriverConfig::default()
    };

    let bus = event_bus(256);
    let driver = Arc::new(CdpDriver::new(driver_cfg, bus));
    Arc::clone(&driver)
        .start()
        .await
        .context("failed to start the browser driver")?;

    let mut reports = Vec::with_capacity(options.kinds.len());
    let mut failed = 0;

    for kind in &options.kinds {
        let cfg = scenario_config(&options);
        info!(scenario = kind.name(), email = %cfg.user.email, "running scenario");

        let report = run_scenario(driver.as_ref(), &cfg, *kind).await;
        if !report.passed() {
            failed += 1;
            if let Err(err) = persist_artifacts(&options.artifacts_dir, &report).await {
                warn!(%err, "failed to write artifacts");
            }
        }
        reports.push(report);
    }

    driver.shutdown().await;
    Ok(RunSummary { reports, failed })
}

fn scenario_config(options: &RunOptions) -> ScenarioConfig {
    let mut cfg = ScenarioConfig {
        org_name: options.org_name.clone(),
        step_timeout: options.step_timeout,
        overall_budget: options.budget,
        video: options.video,
        ..ScenarioConfig::default()
    };
    if let Some(url) = &options.portal_url {
        cfg.portal_base_url = url.clone();
    }
    cfg
}

async fn persist_artifacts(dir: &PathBuf, report: &ScenarioReport) -> Result<()> {
    let run_dir = dir.join(&report.name);
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    for (label, bytes) in &report.artifacts.screenshots {
        fs::write(run_dir.join(format!("{label}.png")), bytes).await?;
    }
    if !report.artifacts.console.is_empty() {
        fs::write(
            run_dir.join("console.log"),
            report.artifacts.console.join("\n"),
        )
        .await?;
    }
    fs::write(
        run_dir.join("report.json"),
        serde_json::to_vec_pretty(report)?,
    )
    .await?;

    info!(dir = %run_dir.display(), "artifacts written");
    Ok(())
}
