//! Individual scenario steps.
//!
//! Every step takes the page it acts on and returns the page subsequent
//! actions must target. New tabs opened as a side effect of a click are
//! observed through pre-registered event waits, never through implicit
//! focus; the active page handle always flows through the call chain.

use tracing::{debug, info};

use portal_driver::{Driver, PageEvent, PageId, SelectorState};
use scenario_flow::{
    assert_eventually_visible, await_first_of, await_spawned_page, EventWaiter, FlowError,
    Outcome, RetryBudget, SelectorVisible,
};

use crate::config::ScenarioConfig;

const TOKEN_ENDPOINT_FRAGMENT: &str = "/protocol/openid-connect/token";

/// Fill the registration form and submit it, pairing the submit click with
/// a navigation wait registered beforehand.
pub async fn register_new_user(
    driver: &dyn Driver,
    page: PageId,
    cfg: &ScenarioConfig,
) -> Result<PageId, FlowError> {
    let t = cfg.step_timeout;
    driver.click(page, "text=Register", t).await?;
    driver
        .wait_for_selector(page, "input[name=\"email\"]", SelectorState::Visible, t)
        .await?;

    driver
        .fill(page, "input[name=\"email\"]", &cfg.user.email, t)
        .await?;
    driver
        .fill(page, "input[id=\"password\"]", &cfg.user.password, t)
        .await?;
    driver
        .fill(
            page,
            "input[id=\"password-confirm\"]",
            &cfg.user.password,
            t,
        )
        .await?;
    driver
        .fill(page, "input[id=\"firstName\"]", &cfg.user.first_name, t)
        .await?;
    driver
        .fill(page, "input[id=\"lastName\"]", &cfg.user.last_name, t)
        .await?;

    // The wait must be installed before the click or the resulting
    // navigation can slip past it.
    let nav = EventWaiter::install(driver, "registration submit navigation");
    driver.click(page, "input[value=\"Register\"]", t).await?;
    nav.wait_matching(t, |ev| matches!(ev, PageEvent::Navigated { page: p, .. } if *p == page))
        .await?;

    info!(email = %cfg.user.email, "registration submitted");
    Ok(page)
}

/// Open the mail-capture inbox, find the verification message, and follow
/// its link. The link opens a new tab; the returned handle is that tab.
pub async fn open_verification_mail(
    driver: &dyn Driver,
    page: PageId,
    cfg: &ScenarioConfig,
) -> Result<PageId, FlowError> {
    let t = cfg.step_timeout;
    driver.navigate(page, &cfg.mail_inbox_url(), t).await?;

    let row = format!("text=To: {}", cfg.user.email);
    driver
        .wait_for_selector(page, &row, SelectorState::Visible, t)
        .await?;
    driver.click(page, &row, t).await?;

    let link = "text=Link to e-mail address verification";
    driver
        .wait_for_selector(page, link, SelectorState::Visible, t)
        .await?;

    let verified = await_spawned_page(
        driver,
        page,
        "follow e-mail verification link",
        t,
        || driver.click(page, link, t),
    )
    .await?;

    debug!(from = ?page, to = ?verified, "verification tab opened");
    Ok(verified)
}

/// Admin-console fallback: toggle the account's "Email verified" flag by
/// hand. The toggle render is flaky after the user search, hence the
/// reload-and-retry assertion.
pub async fn activate_email_via_admin(
    driver: &dyn Driver,
    page: PageId,
    cfg: &ScenarioConfig,
) -> Result<PageId, FlowError> {
    let t = cfg.step_timeout;
    driver
        .navigate(page, &cfg.portal_url("keycloak/"), t)
        .await?;

    driver
        .fill(page, "input[name=\"username\"]", &cfg.admin_user, t)
        .await?;
    driver
        .fill(page, "input[name=\"password\"]", &cfg.admin_password, t)
        .await?;
    driver.click(page, "button[type=\"submit\"]", t).await?;

    driver
        .navigate(
            page,
            &cfg.portal_url("keycloak/admin/master/console/#/welcome/users/"),
            t,
        )
        .await?;
    driver
        .fill(page, "input[placeholder=\"Search user\"]", &cfg.user.email, t)
        .await?;
    driver.click(page, "button[type=\"submit\"]", t).await?;
    driver
        .click(page, &format!("text={}", cfg.user.email), t)
        .await?;

    let toggle = SelectorVisible::new("text=Email verified");
    assert_eventually_visible(
        driver,
        page,
        &toggle,
        RetryBudget::default(),
        t,
        true,
    )
    .await?;
    driver.click(page, "text=Email verified", t).await?;

    driver
        .wait_for_selector(page, "text=Save", SelectorState::Visible, t)
        .await?;
    driver.click(page, "text=Save", t).await?;

    driver
        .navigate(
            page,
            &cfg.portal_url("keycloak/realms/master/protocol/openid-connect/logout"),
            t,
        )
        .await?;
    driver
        .wait_for_selector(page, "text=Logout", SelectorState::Visible, t)
        .await?;
    driver.click(page, "text=Logout", t).await?;

    Ok(page)
}

/// Sign the verified session out through the account menu.
pub async fn sign_out(
    driver: &dyn Driver,
    page: PageId,
    cfg: &ScenarioConfig,
) -> Result<PageId, FlowError> {
    let t = cfg.step_timeout;
    driver
        .click(page, "[data-testid=\"options-toggle\"]", t)
        .await?;
    driver
        .wait_for_selector(page, "text=Sign out", SelectorState::Visible, t)
        .await?;
    driver.click(page, "text=Sign out", t).await?;
    Ok(page)
}

/// Token-endpoint response observed while signing in.
#[derive(Clone, Debug)]
pub struct TokenCapture {
    pub url: String,
    pub status: i64,
}

/// Sign back in, capturing the token-endpoint response. The response wait
/// is installed before the credentials are submitted.
pub async fn sign_in_capture_token(
    driver: &dyn Driver,
    page: PageId,
    cfg: &ScenarioConfig,
) -> Result<(PageId, TokenCapture), FlowError> {
    let t = cfg.step_timeout;
    driver
        .wait_for_selector(page, "input[name=\"username\"]", SelectorState::Visible, t)
        .await?;

    let token_wait = EventWaiter::install(driver, "token endpoint response");

    driver
        .fill(page, "input[name=\"username\"]", &cfg.user.email, t)
        .await?;
    driver
        .fill(page, "input[name=\"password\"]", &cfg.user.password, t)
        .await?;
    driver.click(page, "button[type=\"submit\"]", t).await?;

    let event = token_wait
        .wait_matching(t, |ev| {
            matches!(
                ev,
                PageEvent::ResponseReceived { page: p, method, url, .. }
                    if *p == page && method == "POST" && url.contains(TOKEN_ENDPOINT_FRAGMENT)
            )
        })
        .await?;

    let capture = match event {
        PageEvent::ResponseReceived { url, status, .. } => TokenCapture { url, status },
        other => {
            return Err(FlowError::Driver(
                portal_driver::DriverError::new(portal_driver::DriverErrorKind::Internal)
                    .with_hint(format!("matched non-response event {other:?}")),
            ))
        }
    };
    info!(status = capture.status, "token response captured");
    Ok((page, capture))
}

/// Onboard the organization, using the runner-supplied name override when
/// present.
pub async fn onboard_organization(
    driver: &dyn Driver,
    page: PageId,
    cfg: &ScenarioConfig,
) -> Result<PageId, FlowError> {
    let t = cfg.step_timeout;
    let org = cfg.organization_name();

    driver
        .wait_for_selector(
            page,
            "input[name=\"organizationName\"]",
            SelectorState::Visible,
            t,
        )
        .await?;
    driver
        .fill(page, "input[name=\"organizationName\"]", &org, t)
        .await?;
    driver.click(page, "text=Create Organization", t).await?;

    let ready = SelectorVisible::new("text=Organization ready");
    assert_eventually_visible(driver, page, &ready, RetryBudget::default(), t, false).await?;

    info!(org = %org, "organization onboarded");
    Ok(page)
}

/// Create a resource and confirm the export reached the browser: the
/// download-start event races the inline success banner, first wins. Either
/// signal alone is accepted; the losing wait is abandoned.
pub async fn create_and_download_resource(
    driver: &dyn Driver,
    page: PageId,
    cfg: &ScenarioConfig,
) -> Result<PageId, FlowError> {
    let t = cfg.step_timeout;

    driver.click(page, "text=Create Resource", t).await?;
    driver
        .wait_for_selector(page, "text=Resource ready", SelectorState::Visible, t)
        .await?;

    let download_wait = EventWaiter::install(driver, "resource download start");
    driver.click(page, "text=Download", t).await?;

    let download: Outcome<'_, Result<(), FlowError>> = Box::pin(async move {
        download_wait
            .wait_matching(t, |ev| {
                matches!(ev, PageEvent::DownloadStarted { page: p, .. } if *p == page)
            })
            .await
            .map(|_| ())
    });
    let banner: Outcome<'_, Result<(), FlowError>> = Box::pin(async move {
        driver
            .wait_for_selector(page, "text=Download started", SelectorState::Visible, t)
            .await
            .map_err(FlowError::from)
    });

    let (winner, result) = await_first_of(vec![download, banner]).await?;
    result?;
    debug!(
        signal = if winner == 0 { "download-event" } else { "banner" },
        "download confirmed"
    );
    Ok(page)
}
