//! Scenario catalogue and the runner entry point.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use portal_driver::{Driver, PageId, SelectorState};
use scenario_flow::{with_bounded_wait, FlowError, StepTracker};

use crate::config::ScenarioConfig;
use crate::report::{Artifacts, ScenarioReport};
use crate::steps;

/// The scenarios the runner knows how to execute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScenarioKind {
    /// Register a fresh account and verify it end to end.
    RegisterAndVerify,
    /// Registration plus a sign-out/sign-in cycle capturing the token
    /// endpoint response.
    RegisterAndCaptureToken,
    /// Full onboarding through organization creation and a resource
    /// download.
    ResourceDownload,
}

impl ScenarioKind {
    pub fn all() -> &'static [ScenarioKind] {
        &[
            ScenarioKind::RegisterAndVerify,
            ScenarioKind::RegisterAndCaptureToken,
            ScenarioKind::ResourceDownload,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioKind::RegisterAndVerify => "register-and-verify",
            ScenarioKind::RegisterAndCaptureToken => "register-and-capture-token",
            ScenarioKind::ResourceDownload => "resource-download",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ScenarioKind::RegisterAndVerify => {
                "register a new user, follow the verification mail, land signed in"
            }
            ScenarioKind::RegisterAndCaptureToken => {
                "register and verify, then sign out and back in capturing the token response"
            }
            ScenarioKind::ResourceDownload => {
                "onboard an organization and confirm a resource export downloads"
            }
        }
    }

    pub fn from_name(name: &str) -> Option<ScenarioKind> {
        ScenarioKind::all().iter().copied().find(|k| k.name() == name)
    }
}

/// Page the scenario is currently driving; read on failure for the
/// diagnostic screenshot.
#[derive(Clone, Default)]
struct ActivePage(Arc<Mutex<Option<PageId>>>);

impl ActivePage {
    fn set(&self, page: PageId) {
        *self.0.lock() = Some(page);
    }

    fn get(&self) -> Option<PageId> {
        *self.0.lock()
    }
}

/// Execute one scenario under the overall wall-clock budget and report the
/// outcome. A budget timeout is attributed to the step that was running
/// when the clock ran out, not to the scenario as a whole.
pub async fn run_scenario(
    driver: &dyn Driver,
    cfg: &ScenarioConfig,
    kind: ScenarioKind,
) -> ScenarioReport {
    let tracker = StepTracker::new();
    let active = ActivePage::default();
    let mut artifacts = Artifacts::default();
    let started_at = Utc::now();

    info!(scenario = kind.name(), "scenario starting");
    tracker.begin();

    let body = run_body(driver, cfg, kind, &tracker, &active, &mut artifacts);
    let outcome = with_bounded_wait(kind.name(), cfg.overall_budget, body).await;

    let (failed_step, error) = match outcome {
        Ok(()) => {
            tracker.complete();
            info!(scenario = kind.name(), "scenario completed");
            (None, None)
        }
        Err(err) => {
            tracker.fail();
            // Whether the overall clock or a step itself failed, the
            // tracker knows which step was in flight.
            let failed_step = tracker.current_step();
            error!(
                scenario = kind.name(),
                step = %failed_step,
                %err,
                "scenario failed"
            );
            if let Some(page) = active.get() {
                match driver.screenshot(page, Duration::from_secs(5)).await {
                    Ok(png) => artifacts.add_screenshot(format!("{}-failure", kind.name()), png),
                    Err(shot_err) => {
                        warn!(%shot_err, "failure screenshot unavailable")
                    }
                }
            }
            (Some(failed_step), Some(err.to_string()))
        }
    };

    ScenarioReport {
        name: kind.name().to_string(),
        phase: tracker.phase(),
        started_at,
        finished_at: Utc::now(),
        failed_step,
        error,
        artifacts,
    }
}

async fn run_body(
    driver: &dyn Driver,
    cfg: &ScenarioConfig,
    kind: ScenarioKind,
    tracker: &StepTracker,
    active: &ActivePage,
    artifacts: &mut Artifacts,
) -> Result<(), FlowError> {
    match kind {
        ScenarioKind::RegisterAndVerify => {
            register_and_verify(driver, cfg, tracker, active, artifacts).await?;
        }
        ScenarioKind::RegisterAndCaptureToken => {
            let page = register_and_verify(driver, cfg, tracker, active, artifacts).await?;

            tracker.enter("sign out");
            let page = steps::sign_out(driver, page, cfg).await?;
            record_frame(driver, cfg, active, artifacts, "sign-out").await;

            tracker.enter("sign in and capture token");
            let (_, token) = steps::sign_in_capture_token(driver, page, cfg).await?;
            record_frame(driver, cfg, active, artifacts, "sign-in").await;
            artifacts.note(format!(
                "token endpoint {} answered {}",
                token.url, token.status
            ));
        }
        ScenarioKind::ResourceDownload => {
            let page = register_and_verify(driver, cfg, tracker, active, artifacts).await?;

            tracker.enter("onboard organization");
            let page = steps::onboard_organization(driver, page, cfg).await?;
            record_frame(driver, cfg, active, artifacts, "org-onboarded").await;

            tracker.enter("create and download resource");
            steps::create_and_download_resource(driver, page, cfg).await?;
            record_frame(driver, cfg, active, artifacts, "resource-downloaded").await;
        }
    }
    Ok(())
}

/// With video capture on, keep a labelled frame of the active page after
/// each completed step. Capture is best effort; a failed shot never fails
/// the run.
async fn record_frame(
    driver: &dyn Driver,
    cfg: &ScenarioConfig,
    active: &ActivePage,
    artifacts: &mut Artifacts,
    label: &str,
) {
    if !cfg.video {
        return;
    }
    let Some(page) = active.get() else { return };
    match driver.screenshot(page, Duration::from_secs(5)).await {
        Ok(png) => artifacts.add_screenshot(format!("frame-{label}"), png),
        Err(err) => warn!(%err, label, "video frame unavailable"),
    }
}

/// Shared leading chain: open the portal, register, follow the mail link,
/// flip the admin-side verification flag, confirm the signed-in landing.
/// Returns the page the verified session lives on.
async fn register_and_verify(
    driver: &dyn Driver,
    cfg: &ScenarioConfig,
    tracker: &StepTracker,
    active: &ActivePage,
    artifacts: &mut Artifacts,
) -> Result<PageId, FlowError> {
    tracker.enter("open portal");
    let page = driver.create_page(&cfg.portal_base_url).await?;
    active.set(page);
    record_frame(driver, cfg, active, artifacts, "portal-opened").await;

    tracker.enter("register new user");
    let page = steps::register_new_user(driver, page, cfg).await?;
    record_frame(driver, cfg, active, artifacts, "registered").await;

    tracker.enter("activate email via admin");
    let page = steps::activate_email_via_admin(driver, page, cfg).await?;
    record_frame(driver, cfg, active, artifacts, "email-activated").await;

    tracker.enter("open verification mail");
    let page = steps::open_verification_mail(driver, page, cfg).await?;
    active.set(page);
    record_frame(driver, cfg, active, artifacts, "verification-tab").await;

    tracker.enter("confirm signed-in landing");
    driver
        .wait_for_selector(page, "text=Welcome", SelectorState::Visible, cfg.step_timeout)
        .await?;
    record_frame(driver, cfg, active, artifacts, "landing").await;

    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_driver::mock::{ClickEffect, MockDriver, PageScript};
    use scenario_flow::RunPhase;
    use std::time::Duration;

    fn quick_config() -> ScenarioConfig {
        ScenarioConfig {
            portal_base_url: "https://portal.test/".into(),
            step_timeout: Duration::from_millis(500),
            overall_budget: Duration::from_secs(5),
            ..ScenarioConfig::default()
        }
    }

    /// Wire the mock portal for the registration chain shared by every
    /// scenario.
    fn script_registration(driver: &MockDriver, cfg: &ScenarioConfig) {
        let email = cfg.user.email.clone();

        driver.route(
            "https://portal.test/",
            PageScript::new("Portal")
                .with_visible("text=Register")
                .with_visible("input[name=\"email\"]")
                .with_visible("input[id=\"password\"]")
                .with_visible("input[id=\"password-confirm\"]")
                .with_visible("input[id=\"firstName\"]")
                .with_visible("input[id=\"lastName\"]")
                .with_visible("input[value=\"Register\"]"),
        );
        driver.on_click(
            "input[value=\"Register\"]",
            ClickEffect::Navigate {
                url: "https://portal.test/registered".into(),
            },
        );
        driver.route(
            "https://portal.test/registered",
            PageScript::new("Registered"),
        );

        driver.route(
            "https://portal.test/keycloak/",
            PageScript::new("Admin login")
                .with_visible("input[name=\"username\"]")
                .with_visible("input[name=\"password\"]")
                .with_visible("button[type=\"submit\"]"),
        );
        driver.route(
            "https://portal.test/keycloak/admin/master/console/#/welcome/users/",
            PageScript::new("User admin")
                .with_visible("input[placeholder=\"Search user\"]")
                .with_visible("button[type=\"submit\"]")
                .with_visible(format!("text={email}"))
                .with_visible("text=Email verified")
                .with_visible("text=Save"),
        );
        driver.route(
            "https://portal.test/keycloak/realms/master/protocol/openid-connect/logout",
            PageScript::new("Logout").with_visible("text=Logout"),
        );

        driver.route(
            "https://portal.test/mailpit/",
            PageScript::new("Inbox")
                .with_visible(format!("text=To: {email}"))
                .with_visible("text=Link to e-mail address verification"),
        );
        driver.on_click(
            "text=Link to e-mail address verification",
            ClickEffect::OpenPage {
                url: "https://portal.test/welcome".into(),
                delay: Duration::from_millis(5),
            },
        );
        driver.route(
            "https://portal.test/welcome",
            PageScript::new("Welcome").with_visible("text=Welcome"),
        );
    }

    #[tokio::test]
    async fn register_and_verify_completes() {
        let cfg = quick_config();
        let driver = MockDriver::new();
        script_registration(&driver, &cfg);

        let report = run_scenario(&driver, &cfg, ScenarioKind::RegisterAndVerify).await;
        assert!(report.passed(), "report: {:?}", report.error);
        assert_eq!(report.phase, RunPhase::Completed);
        assert!(report.failed_step.is_none());
        // Video capture is off by default, so a passing run keeps no frames.
        assert!(report.artifacts.screenshots.is_empty());
    }

    #[tokio::test]
    async fn video_toggle_captures_step_frames() {
        let mut cfg = quick_config();
        cfg.video = true;
        let driver = MockDriver::new();
        script_registration(&driver, &cfg);

        let report = run_scenario(&driver, &cfg, ScenarioKind::RegisterAndVerify).await;
        assert!(report.passed(), "report: {:?}", report.error);

        let frames: Vec<&str> = report
            .artifacts
            .screenshots
            .iter()
            .map(|(label, _)| label.as_str())
            .collect();
        assert!(frames.len() >= 5, "frames: {frames:?}");
        assert!(frames.iter().all(|l| l.starts_with("frame-")));
        assert!(frames.contains(&"frame-portal-opened"));
        assert!(frames.contains(&"frame-landing"));
    }

    #[tokio::test]
    async fn capture_token_records_the_response() {
        let cfg = quick_config();
        let driver = MockDriver::new();
        // Registered before the shared script so this richer landing page
        // wins the route tie.
        driver.route(
            "https://portal.test/welcome",
            PageScript::new("Welcome")
                .with_visible("text=Welcome")
                .with_visible("[data-testid=\"options-toggle\"]")
                .with_visible("text=Sign out"),
        );
        script_registration(&driver, &cfg);

        driver.on_click(
            "text=Sign out",
            ClickEffect::Navigate {
                url: "https://portal.test/signin".into(),
            },
        );
        driver.route(
            "https://portal.test/signin",
            PageScript::new("Sign in")
                .with_visible("input[name=\"username\"]")
                .with_visible("input[name=\"password\"]")
                .with_visible("button[type=\"submit\"]"),
        );
        driver.on_click(
            "button[type=\"submit\"]",
            ClickEffect::EmitResponse {
                method: "POST".into(),
                url: "https://portal.test/keycloak/realms/portal/protocol/openid-connect/token"
                    .into(),
                status: 200,
                delay: Duration::from_millis(10),
            },
        );

        let report = run_scenario(&driver, &cfg, ScenarioKind::RegisterAndCaptureToken).await;
        assert!(report.passed(), "report: {:?}", report.error);
        assert!(report
            .artifacts
            .console
            .iter()
            .any(|line| line.contains("answered 200")));
    }

    #[tokio::test]
    async fn resource_download_accepts_the_download_event() {
        let cfg = quick_config();
        let driver = MockDriver::new();
        driver.route(
            "https://portal.test/welcome",
            PageScript::new("Welcome")
                .with_visible("text=Welcome")
                .with_visible("input[name=\"organizationName\"]")
                .with_visible("text=Create Organization"),
        );
        script_registration(&driver, &cfg);

        driver.on_click(
            "text=Create Organization",
            ClickEffect::Reveal {
                selector: "text=Organization ready".into(),
                delay: Duration::from_millis(10),
            },
        );
        driver.on_click(
            "text=Create Organization",
            ClickEffect::Reveal {
                selector: "text=Create Resource".into(),
                delay: Duration::from_millis(10),
            },
        );
        driver.on_click(
            "text=Create Resource",
            ClickEffect::Reveal {
                selector: "text=Resource ready".into(),
                delay: Duration::from_millis(10),
            },
        );
        driver.on_click(
            "text=Create Resource",
            ClickEffect::Reveal {
                selector: "text=Download".into(),
                delay: Duration::from_millis(10),
            },
        );
        // No success banner is scripted; the download event alone must
        // satisfy the race.
        driver.on_click(
            "text=Download",
            ClickEffect::EmitDownload {
                url: "https://portal.test/export/resource.yaml".into(),
                suggested_name: Some("resource.yaml".into()),
                delay: Duration::from_millis(10),
            },
        );

        let report = run_scenario(&driver, &cfg, ScenarioKind::ResourceDownload).await;
        assert!(report.passed(), "report: {:?}", report.error);
    }

    #[tokio::test]
    async fn failure_names_the_stalled_step() {
        let cfg = quick_config();
        let driver = MockDriver::new();
        // Only the landing page is scripted; registration never gets its
        // form, so the second step stalls.
        driver.route(
            "https://portal.test/",
            PageScript::new("Portal").with_visible("text=Register"),
        );

        let report = run_scenario(&driver, &cfg, ScenarioKind::RegisterAndVerify).await;
        assert_eq!(report.phase, RunPhase::Failed);
        assert_eq!(report.failed_step.as_deref(), Some("register new user"));
        assert!(report.error.is_some());
    }

    #[test]
    fn names_round_trip() {
        for kind in ScenarioKind::all() {
            assert_eq!(ScenarioKind::from_name(kind.name()), Some(*kind));
        }
        assert_eq!(ScenarioKind::from_name("no-such"), None);
    }
}
