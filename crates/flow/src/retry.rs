//! Bounded re-assertion of flaky UI state.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::errors::FlowError;
use portal_driver::{Driver, DriverError, PageId};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const RELOAD_DEADLINE: Duration = Duration::from_secs(10);

/// Bounded attempt counter governing re-assertion of flaky UI state.
#[derive(Clone, Copy, Debug)]
pub struct RetryBudget {
    max_attempts: u32,
}

impl RetryBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(3)
    }
}

/// A described boolean UI condition.
#[async_trait]
pub trait Condition: Send + Sync {
    fn describe(&self) -> &str;

    /// Single-shot evaluation; the retry primitive owns the polling.
    async fn eval(&self, driver: &dyn Driver, page: PageId) -> Result<bool, DriverError>;
}

/// The common case: a selector is visible on the page.
pub struct SelectorVisible {
    selector: String,
    describe: String,
}

impl SelectorVisible {
    pub fn new(selector: impl Into<String>) -> Self {
        let selector = selector.into();
        let describe = format!("{selector} visible");
        Self { selector, describe }
    }
}

#[async_trait]
impl Condition for SelectorVisible {
    fn describe(&self) -> &str {
        &self.describe
    }

    async fn eval(&self, driver: &dyn Driver, page: PageId) -> Result<bool, DriverError> {
        driver.is_visible(page, &self.selector).await
    }
}

/// Evaluate `condition` with a bounded per-attempt wait; on a timed-out
/// attempt with budget remaining, optionally reload the page (recovers a
/// stuck single-page-app render) and try again.
///
/// Only attempt timeouts are retried. A driver failure during evaluation or
/// reload is fatal immediately. When the budget is exhausted the final
/// attempt's timeout is propagated inside the terminal error, not swallowed.
pub async fn assert_eventually_visible(
    driver: &dyn Driver,
    page: PageId,
    condition: &dyn Condition,
    budget: RetryBudget,
    per_attempt: Duration,
    reload_between: bool,
) -> Result<(), FlowError> {
    let mut last_timeout = None;

    for attempt in 1..=budget.max_attempts() {
        let due = Instant::now() + per_attempt;
        loop {
            if condition.eval(driver, page).await? {
                debug!(
                    condition = condition.describe(),
                    attempt, "condition satisfied"
                );
                return Ok(());
            }
            if Instant::now() >= due {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }

        last_timeout = Some(FlowError::Timeout {
            step: condition.describe().to_string(),
            waited: per_attempt,
        });

        if attempt < budget.max_attempts() {
            warn!(
                condition = condition.describe(),
                attempt,
                reload = reload_between,
                "attempt timed out, retrying"
            );
            if reload_between {
                driver.reload(page, RELOAD_DEADLINE).await?;
            }
        }
    }

    // max_attempts >= 1, so at least one timeout was recorded.
    let source = last_timeout.unwrap_or(FlowError::EmptyRaceSet);
    Err(FlowError::AssertionTimeout {
        condition: condition.describe().to_string(),
        attempts: budget.max_attempts(),
        source: Box::new(source),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_driver::mock::MockDriver;
    use portal_driver::DriverErrorKind;

    #[tokio::test]
    async fn passes_on_third_attempt_after_two_reloads() {
        let driver = MockDriver::new();
        let page = driver.create_page("about:blank").await.unwrap();
        driver.reveal_after_reloads(page, "text=Switch", 2);

        let condition = SelectorVisible::new("text=Switch");
        assert_eventually_visible(
            &driver,
            page,
            &condition,
            RetryBudget::new(3),
            Duration::from_millis(60),
            true,
        )
        .await
        .unwrap();

        assert_eq!(driver.reload_count(page), 2);
    }

    #[tokio::test]
    async fn exhausted_budget_keeps_the_original_cause() {
        let driver = MockDriver::new();
        let page = driver.create_page("about:blank").await.unwrap();

        let condition = SelectorVisible::new("text=Never");
        let err = assert_eventually_visible(
            &driver,
            page,
            &condition,
            RetryBudget::new(3),
            Duration::from_millis(40),
            true,
        )
        .await
        .unwrap_err();

        // Exactly 3 attempts, 2 reloads; the last attempt's timeout is the
        // cause, not a generic retry-exhausted error.
        assert_eq!(driver.reload_count(page), 2);
        match err {
            FlowError::AssertionTimeout {
                condition,
                attempts,
                source,
            } => {
                assert_eq!(condition, "text=Never visible");
                assert_eq!(attempts, 3);
                match *source {
                    FlowError::Timeout { ref step, .. } => {
                        assert_eq!(step, "text=Never visible")
                    }
                    ref other => panic!("expected Timeout source, got {other:?}"),
                }
            }
            other => panic!("expected AssertionTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_reload_when_disabled() {
        let driver = MockDriver::new();
        let page = driver.create_page("about:blank").await.unwrap();

        let condition = SelectorVisible::new("text=Never");
        let _ = assert_eventually_visible(
            &driver,
            page,
            &condition,
            RetryBudget::new(2),
            Duration::from_millis(30),
            false,
        )
        .await;
        assert_eq!(driver.reload_count(page), 0);
    }

    struct FailingCondition;

    #[async_trait]
    impl Condition for FailingCondition {
        fn describe(&self) -> &str {
            "broken evaluator"
        }

        async fn eval(&self, _driver: &dyn Driver, _page: PageId) -> Result<bool, DriverError> {
            Err(DriverError::element_not_found("div.gone"))
        }
    }

    #[tokio::test]
    async fn driver_failure_is_fatal_and_never_retried() {
        let driver = MockDriver::new();
        let page = driver.create_page("about:blank").await.unwrap();

        let err = assert_eventually_visible(
            &driver,
            page,
            &FailingCondition,
            RetryBudget::new(3),
            Duration::from_millis(100),
            true,
        )
        .await
        .unwrap_err();

        assert_eq!(driver.reload_count(page), 0);
        match err {
            FlowError::Driver(inner) => {
                assert_eq!(inner.kind, DriverErrorKind::ElementNotFound)
            }
            other => panic!("expected Driver error, got {other:?}"),
        }
    }

    #[test]
    fn zero_budget_is_clamped_to_one_attempt() {
        assert_eq!(RetryBudget::new(0).max_attempts(), 1);
    }
}
