//! End-to-end onboarding runs against the scripted driver.
//!
//! The full registration chain (register, verification mail, admin flag,
//! signed-in landing) must complete inside a fixed wall-clock budget, and a
//! stalled run must name the step that was in flight when the budget ran
//! out.

use std::time::Duration;

use portal_driver::mock::{ClickEffect, MockDriver, PageScript};
use portal_scenarios::{run_scenario, ScenarioConfig, ScenarioKind};
use scenario_flow::RunPhase;

fn config() -> ScenarioConfig {
    ScenarioConfig {
        portal_base_url: "https://portal.test/".into(),
        step_timeout: Duration::from_millis(800),
        overall_budget: Duration::from_secs(10),
        ..ScenarioConfig::default()
    }
}

fn script_portal(driver: &MockDriver, cfg: &ScenarioConfig) {
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
            delay: Duration::from_millis(20),
        },
    );
    driver.route(
        "https://portal.test/welcome",
        PageScript::new("Welcome").with_visible("text=Welcome"),
    );
}

#[tokio::test]
async fn registration_chain_completes_within_budget() {
    let cfg = config();
    let driver = MockDriver::new();
    script_portal(&driver, &cfg);

    let report = run_scenario(&driver, &cfg, ScenarioKind::RegisterAndVerify).await;

    assert!(report.passed(), "report: {:?}", report.error);
    assert_eq!(report.phase, RunPhase::Completed);
    assert!(
        report.duration_ms() < cfg.overall_budget.as_millis() as i64,
        "run took {}ms",
        report.duration_ms()
    );
}

#[tokio::test]
async fn stalled_landing_is_attributed_to_its_step() {
    let mut cfg = config();
    // Per-step waits outlast the overall budget, so the wall clock is what
    // trips, and the report must still name the stalled step.
    cfg.overall_budget = Duration::from_millis(900);
    cfg.step_timeout = Duration::from_secs(5);

    let driver = MockDriver::new();
    // Registered first so it wins the route tie against the scripted
    // welcome page: the verification tab never shows the landing marker.
    driver.route(
        "https://portal.test/welcome",
        PageScript::new("Blank welcome"),
    );
    script_portal(&driver, &cfg);

    let report = run_scenario(&driver, &cfg, ScenarioKind::RegisterAndVerify).await;

    assert_eq!(report.phase, RunPhase::Failed);
    assert_eq!(
        report.failed_step.as_deref(),
        Some("confirm signed-in landing"),
        "error: {:?}",
        report.error
    );
    assert!(report.error.is_some());
}
