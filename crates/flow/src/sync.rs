//! Bounded waits, races, and pre-registered event waits.

use std::future::Future;
use std::time::Duration;

use futures::future::{select_all, BoxFuture};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::errors::FlowError;
use portal_driver::{Driver, DriverError, DriverErrorKind, PageEvent, PageId};

/// A pending action outcome: the one-shot eventual result of a triggered UI
/// action. Consumed exactly once; losing a race abandons it without
/// cancelling the underlying operation.
pub type Outcome<'a, T> = BoxFuture<'a, T>;

/// Race `fut` against a timer. The single point where "how long do we wait"
/// policy lives; the timer winning yields [`FlowError::Timeout`] carrying the
/// step description.
pub async fn with_bounded_wait<T, E, F>(
    step: &str,
    limit: Duration,
    fut: F,
) -> Result<T, FlowError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<FlowError>,
{
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(FlowError::Timeout {
            step: step.to_string(),
            waited: limit,
        }),
    }
}

/// Resolve as soon as any one outcome resolves; later resolutions are
/// discarded. Returns the winner's index so the caller can branch on which
/// of several possible next screens appeared.
///
/// No timeout is enforced at this layer. A race where no outcome carries its
/// own bound can hang; compose [`with_bounded_wait`] per outcome.
pub async fn await_first_of<T>(outcomes: Vec<Outcome<'_, T>>) -> Result<(usize, T), FlowError> {
    if outcomes.is_empty() {
        return Err(FlowError::EmptyRaceSet);
    }
    let (value, index, rest) = select_all(outcomes).await;
    trace!(winner = index, abandoned = rest.len(), "race resolved");
    drop(rest);
    Ok((index, value))
}

/// A one-shot event wait whose subscription is taken at construction time.
///
/// Install the waiter, then invoke the trigger, then await: an event fired
/// synchronously with the trigger is buffered on the subscription rather
/// than lost. Registering after the trigger is the lost-event race this type
/// exists to make unrepresentable.
pub struct EventWaiter {
    rx: broadcast::Receiver<PageEvent>,
    what: String,
}

impl EventWaiter {
    pub fn install(driver: &dyn Driver, what: impl Into<String>) -> Self {
        Self {
            rx: driver.subscribe(),
            what: what.into(),
        }
    }

    /// Await the first event matching `matches`, up to `limit`.
    pub async fn wait_matching<F>(
        mut self,
        limit: Duration,
        mut matches: F,
    ) -> Result<PageEvent, FlowError>
    where
        F: FnMut(&PageEvent) -> bool + Send,
    {
        let deadline = Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.rx.recv()).await {
                Ok(Ok(event)) => {
                    if matches(&event) {
                        return Ok(event);
                    }
                    trace!(what = %self.what, ?event, "event skipped");
                }
                Ok(Err(RecvError::Lagged(missed))) => {
                    debug!(what = %self.what, missed, "event bus lagged");
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(FlowError::Driver(
                        DriverError::new(DriverErrorKind::Internal)
                            .with_hint("page event bus closed"),
                    ));
                }
                Err(_) => {
                    return Err(FlowError::Timeout {
                        step: self.what,
                        waited: limit,
                    });
                }
            }
        }
    }
}

/// Run a trigger known to open a new page and return the handle of the page
/// it spawned.
///
/// Interest in the page-opened event is registered before the trigger future
/// is polled; this ordering is what makes the primitive race-free.
pub async fn await_spawned_page<F, Fut>(
    driver: &dyn Driver,
    origin: PageId,
    trigger_desc: &str,
    limit: Duration,
    trigger: F,
) -> Result<PageId, FlowError>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<(), DriverError>> + Send,
{
    let waiter = EventWaiter::install(driver, trigger_desc);
    trigger().await?;

    let event = waiter
        .wait_matching(limit, |ev| {
            matches!(ev, PageEvent::Opened { page, .. } if *page != origin)
        })
        .await?;

    match event {
        PageEvent::Opened { page, .. } => {
            debug!(?page, trigger = trigger_desc, "spawned page observed");
            Ok(page)
        }
        _ => Err(FlowError::Driver(
            DriverError::new(DriverErrorKind::Internal).with_hint("matched non-open event"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_driver::mock::{ClickEffect, MockDriver, PageScript};
    use tokio::time::sleep;

    #[tokio::test]
    async fn bounded_wait_passes_value_through() {
        let result: Result<u32, FlowError> = with_bounded_wait(
            "quick step",
            Duration::from_millis(100),
            async { Ok::<_, FlowError>(7) },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn bounded_wait_names_the_stalled_step() {
        let result: Result<(), FlowError> = with_bounded_wait(
            "wait for portal banner",
            Duration::from_millis(20),
            async {
                sleep(Duration::from_secs(5)).await;
                Ok::<_, FlowError>(())
            },
        )
        .await;
        match result {
            Err(FlowError::Timeout { step, waited }) => {
                assert_eq!(step, "wait for portal banner");
                assert_eq!(waited, Duration::from_millis(20));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_of_returns_the_early_branch() {
        let started = Instant::now();
        let a: Outcome<'_, &str> = Box::pin(async {
            sleep(Duration::from_millis(10)).await;
            "a"
        });
        let b: Outcome<'_, &str> = Box::pin(async {
            sleep(Duration::from_millis(50)).await;
            "b"
        });

        let (index, value) = await_first_of(vec![a, b]).await.unwrap();
        assert_eq!(index, 0);
        assert_eq!(value, "a");
        // The losing branch is not awaited.
        assert!(started.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn first_of_rejects_empty_race_set() {
        let outcomes: Vec<Outcome<'_, ()>> = Vec::new();
        assert!(matches!(
            await_first_of(outcomes).await,
            Err(FlowError::EmptyRaceSet)
        ));
    }

    #[tokio::test]
    async fn spawned_page_handle_is_distinct_and_usable() {
        let driver = MockDriver::new();
        driver.route("https://portal.dev.local/", PageScript::new("Portal"));
        driver.route(
            "https://portal.dev.local/verify",
            PageScript::new("Verified").with_visible("text=Welcome"),
        );
        let origin = driver
            .create_page("https://portal.dev.local/")
            .await
            .unwrap();
        driver.on_click(
            "a.verify",
            ClickEffect::OpenPage {
                url: "https://portal.dev.local/verify".into(),
                delay: Duration::from_millis(10),
            },
        );

        let spawned = await_spawned_page(
            &driver,
            origin,
            "click e-mail verification link",
            Duration::from_secs(1),
            || driver.click(origin, "a.verify", Duration::from_secs(1)),
        )
        .await
        .unwrap();

        assert_ne!(spawned, origin);
        assert_eq!(driver.title(spawned).await.unwrap(), "Verified");
        assert!(driver.is_visible(spawned, "text=Welcome").await.unwrap());
    }

    #[tokio::test]
    async fn spawned_page_timeout_names_the_trigger() {
        let driver = MockDriver::new();
        driver.route(
            "https://portal.dev.local/",
            PageScript::new("Portal").with_visible("a.dud"),
        );
        let origin = driver
            .create_page("https://portal.dev.local/")
            .await
            .unwrap();

        // Clicking a.dud opens nothing.
        let result = await_spawned_page(
            &driver,
            origin,
            "click dead link",
            Duration::from_millis(30),
            || driver.click(origin, "a.dud", Duration::from_secs(1)),
        )
        .await;

        match result {
            Err(FlowError::Timeout { step, .. }) => assert_eq!(step, "click dead link"),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    /// The subscription is taken before the trigger runs, so even a page
    /// that opens synchronously with the click is never missed. Repeated to
    /// shake out scheduling-order flakiness.
    #[tokio::test]
    async fn pre_registered_wait_never_misses_instant_spawn() {
        for _ in 0..25 {
            let driver = MockDriver::new();
            driver.route("https://portal.dev.local/", PageScript::new("Portal"));
            let origin = driver
                .create_page("https://portal.dev.local/")
                .await
                .unwrap();
            driver.on_click(
                "a.instant",
                ClickEffect::OpenPage {
                    url: "https://portal.dev.local/popup".into(),
                    delay: Duration::ZERO,
                },
            );

            let spawned = await_spawned_page(
                &driver,
                origin,
                "click instant popup link",
                Duration::from_millis(500),
                || driver.click(origin, "a.instant", Duration::from_secs(1)),
            )
            .await
            .expect("pre-registered wait must not miss the open event");
            assert_ne!(spawned, origin);
        }
    }

    #[tokio::test]
    async fn waiter_skips_unrelated_events() {
        let driver = MockDriver::new();
        driver.route("https://portal.dev.local/", PageScript::new("Portal"));
        let origin = driver
            .create_page("https://portal.dev.local/")
            .await
            .unwrap();
        driver.on_click(
            "button.signin",
            ClickEffect::EmitResponse {
                method: "POST".into(),
                url: "https://portal.dev.local/keycloak/token".into(),
                status: 200,
                delay: Duration::from_millis(10),
            },
        );
        driver.set_visible(origin, "button.signin");

        let waiter = EventWaiter::install(&driver, "token response");
        driver
            .click(origin, "button.signin", Duration::from_secs(1))
            .await
            .unwrap();
        // A navigation event lands first and must be skipped.
        driver
            .navigate(origin, "https://portal.dev.local/home", Duration::from_secs(1))
            .await
            .unwrap();

        let event = waiter
            .wait_matching(Duration::from_secs(1), |ev| {
                matches!(
                    ev,
                    PageEvent::ResponseReceived { method, url, .. }
                        if method == "POST" && url.contains("/token")
                )
            })
            .await
            .unwrap();
        match event {
            PageEvent::ResponseReceived { status, .. } => assert_eq!(status, 200),
            other => panic!("expected ResponseReceived, got {other:?}"),
        }
    }
}
