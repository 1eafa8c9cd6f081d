//! Scripted in-memory driver.
//!
//! Backs the flow-controller and scenario tests the same way the no-op
//! transport backs the real driver: pages are plain records, selector
//! visibility follows scripted routes, and click effects replay the
//! asynchronous side effects of a real UI (new tabs, navigations, network
//! responses, downloads) after an optional delay.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::driver::{Driver, SelectorState};
use crate::error::{DriverError, DriverErrorKind};
use crate::events::{event_bus, EventBus, PageEvent};
use crate::ids::PageId;

/// Side effect attached to a selector click.
#[derive(Clone, Debug)]
pub enum ClickEffect {
    /// A new tab opens with the given url after the delay.
    OpenPage { url: String, delay: Duration },
    /// The page navigates in place.
    Navigate { url: String },
    /// A network response is observed after the delay.
    EmitResponse {
        method: String,
        url: String,
        status: i64,
        delay: Duration,
    },
    /// A download starts after the delay.
    EmitDownload {
        url: String,
        suggested_name: Option<String>,
        delay: Duration,
    },
    /// Another selector on the same page becomes visible after the delay.
    Reveal { selector: String, delay: Duration },
}

/// What a page looks like once a url matching the route prefix is loaded.
#[derive(Clone, Debug, Default)]
pub struct PageScript {
    pub title: String,
    pub visible: Vec<String>,
    pub text: Vec<(String, String)>,
}

impl PageScript {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            visible: Vec::new(),
            text: Vec::new(),
        }
    }

    pub fn with_visible(mut self, selector: impl Into<String>) -> Self {
        self.visible.push(selector.into());
        self
    }

    pub fn with_text(mut self, selector: impl Into<String>, text: impl Into<String>) -> Self {
        self.text.push((selector.into(), text.into()));
        self
    }
}

#[derive(Default)]
struct MockPage {
    url: String,
    title: String,
    visible: HashSet<String>,
    text: HashMap<String, String>,
    filled: HashMap<String, String>,
    reloads: u32,
    // selector -> reload count at which it becomes visible
    reveal_after_reloads: HashMap<String, u32>,
}

struct Inner {
    bus: EventBus,
    pages: DashMap<PageId, Mutex<MockPage>>,
    routes: Mutex<Vec<(String, PageScript)>>,
    click_rules: DashMap<String, Vec<ClickEffect>>,
    poll: Duration,
}

/// Scripted driver double; cheap to clone, shared state inside.
#[derive(Clone)]
pub struct MockDriver {
    inner: Arc<Inner>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                bus: event_bus(64),
                pages: DashMap::new(),
                routes: Mutex::new(Vec::new()),
                click_rules: DashMap::new(),
                poll: Duration::from_millis(5),
            }),
        }
    }

    /// Script what pages at urls starting with `prefix` look like.
    pub fn route(&self, prefix: impl Into<String>, script: PageScript) {
        self.inner.routes.lock().push((prefix.into(), script));
    }

    /// Attach a side effect to clicking `selector` (effects accumulate).
    pub fn on_click(&self, selector: impl Into<String>, effect: ClickEffect) {
        self.inner
            .click_rules
            .entry(selector.into())
            .or_default()
            .push(effect);
    }

    /// Make `selector` appear on `page` once it has been reloaded `n` times.
    pub fn reveal_after_reloads(&self, page: PageId, selector: impl Into<String>, n: u32) {
        if let Some(entry) = self.inner.pages.get(&page) {
            entry.lock().reveal_after_reloads.insert(selector.into(), n);
        }
    }

    /// Make `selector` visible on `page` immediately.
    pub fn set_visible(&self, page: PageId, selector: impl Into<String>) {
        if let Some(entry) = self.inner.pages.get(&page) {
            entry.lock().visible.insert(selector.into());
        }
    }

    pub fn reload_count(&self, page: PageId) -> u32 {
        self.inner
            .pages
            .get(&page)
            .map(|entry| entry.lock().reloads)
            .unwrap_or(0)
    }

    /// Value last typed into `selector`, if any.
    pub fn filled_value(&self, page: PageId, selector: &str) -> Option<String> {
        self.inner
            .pages
            .get(&page)
            .and_then(|entry| entry.lock().filled.get(selector).cloned())
    }

    pub fn page_url(&self, page: PageId) -> Option<String> {
        self.inner
            .pages
            .get(&page)
            .map(|entry| entry.lock().url.clone())
    }

    fn apply_route(inner: &Inner, page_state: &mut MockPage, url: &str) {
        page_state.url = url.to_string();
        // Longest matching prefix wins.
        let routes = inner.routes.lock();
        let mut best: Option<&(String, PageScript)> = None;
        for candidate in routes.iter() {
            if url.starts_with(&candidate.0) {
                match best {
                    Some((prefix, _)) if prefix.len() >= candidate.0.len() => {}
                    _ => best = Some(candidate),
                }
            }
        }
        if let Some((_, script)) = best {
            page_state.title = script.title.clone();
            page_state.visible = script.visible.iter().cloned().collect();
            page_state.text = script.text.iter().cloned().collect();
        } else {
            page_state.title.clear();
            page_state.visible.clear();
            page_state.text.clear();
        }
    }

    fn spawn_page(inner: &Arc<Inner>, url: &str, opener: Option<PageId>) -> PageId {
        let page = PageId::new();
        let mut state = MockPage::default();
        Self::apply_route(inner, &mut state, url);
        inner.pages.insert(page, Mutex::new(state));
        let _ = inner.bus.send(PageEvent::Opened { page, opener });
        if !url.is_empty() {
            let _ = inner.bus.send(PageEvent::Navigated {
                page,
                url: url.to_string(),
            });
        }
        page
    }

    fn run_effects(&self, page: PageId, selector: &str) {
        let effects = self
            .inner
            .click_rules
            .get(selector)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        for effect in effects {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                match effect {
                    ClickEffect::OpenPage { url, delay } => {
                        sleep(delay).await;
                        Self::spawn_page(&inner, &url, Some(page));
                    }
                    ClickEffect::Navigate { url } => {
                        if let Some(entry) = inner.pages.get(&page) {
                            Self::apply_route(&inner, &mut entry.lock(), &url);
                        }
                        let _ = inner.bus.send(PageEvent::Navigated { page, url });
                    }
                    ClickEffect::EmitResponse {
                        method,
                        url,
                        status,
                        delay,
                    } => {
                        sleep(delay).await;
                        let _ = inner.bus.send(PageEvent::ResponseReceived {
                            page,
                            method,
                            url,
                            status,
                        });
                    }
                    ClickEffect::EmitDownload {
                        url,
                        suggested_name,
                        delay,
                    } => {
                        sleep(delay).await;
                        let _ = inner.bus.send(PageEvent::DownloadStarted {
                            page,
                            url,
                            suggested_name,
                        });
                    }
                    ClickEffect::Reveal { selector, delay } => {
                        sleep(delay).await;
                        if let Some(entry) = inner.pages.get(&page) {
                            entry.lock().visible.insert(selector);
                        }
                    }
                }
            });
        }
    }

    fn with_page<T>(
        &self,
        page: PageId,
        f: impl FnOnce(&mut MockPage) -> T,
    ) -> Result<T, DriverError> {
        let entry = self.inner.pages.get(&page).ok_or_else(|| {
            DriverError::new(DriverErrorKind::Internal).with_hint(format!("unknown page {page:?}"))
        })?;
        let mut guard = entry.lock();
        Ok(f(&mut guard))
    }

    fn selector_known(state: &MockPage, selector: &str) -> bool {
        state.visible.contains(selector) || state.text.contains_key(selector)
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn create_page(&self, url: &str) -> Result<PageId, DriverError> {
        Ok(Self::spawn_page(&self.inner, url, None))
    }

    async fn close_page(&self, page: PageId) -> Result<(), DriverError> {
        self.inner.pages.remove(&page).ok_or_else(|| {
            DriverError::new(DriverErrorKind::Internal).with_hint(format!("unknown page {page:?}"))
        })?;
        let _ = self.inner.bus.send(PageEvent::Closed { page });
        Ok(())
    }

    async fn navigate(
        &self,
        page: PageId,
        url: &str,
        _deadline: Duration,
    ) -> Result<(), DriverError> {
        self.with_page(page, |state| {
            Self::apply_route(&self.inner, state, url);
        })?;
        let _ = self.inner.bus.send(PageEvent::Navigated {
            page,
            url: url.to_string(),
        });
        Ok(())
    }

    async fn reload(&self, page: PageId, _deadline: Duration) -> Result<(), DriverError> {
        self.with_page(page, |state| {
            state.reloads += 1;
            let reloads = state.reloads;
            let due: Vec<String> = state
                .reveal_after_reloads
                .iter()
                .filter(|(_, n)| reloads >= **n)
                .map(|(sel, _)| sel.clone())
                .collect();
            for sel in due {
                state.visible.insert(sel);
            }
        })
    }

    async fn click(
        &self,
        page: PageId,
        selector: &str,
        _deadline: Duration,
    ) -> Result<(), DriverError> {
        let has_rule = self.inner.click_rules.contains_key(selector);
        let known = self.with_page(page, |state| Self::selector_known(state, selector))?;
        if !known && !has_rule {
            return Err(DriverError::element_not_found(selector));
        }
        self.run_effects(page, selector);
        Ok(())
    }

    async fn fill(
        &self,
        page: PageId,
        selector: &str,
        value: &str,
        _deadline: Duration,
    ) -> Result<(), DriverError> {
        let known = self.with_page(page, |state| {
            if Self::selector_known(state, selector) {
                state.filled.insert(selector.to_string(), value.to_string());
                true
            } else {
                false
            }
        })?;
        if known {
            Ok(())
        } else {
            Err(DriverError::element_not_found(selector))
        }
    }

    async fn wait_for_selector(
        &self,
        page: PageId,
        selector: &str,
        state: SelectorState,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let due = Instant::now() + timeout;
        loop {
            let visible = self.with_page(page, |p| p.visible.contains(selector))?;
            let satisfied = match state {
                SelectorState::Visible | SelectorState::Attached => visible,
                SelectorState::Hidden => !visible,
            };
            if satisfied {
                return Ok(());
            }
            if Instant::now() >= due {
                return match state {
                    SelectorState::Hidden => Err(DriverError::new(DriverErrorKind::NavTimeout)
                        .with_hint(format!("selector {selector:?} still visible"))),
                    _ => Err(DriverError::element_not_found(selector)),
                };
            }
            sleep(self.inner.poll).await;
        }
    }

    async fn is_visible(&self, page: PageId, selector: &str) -> Result<bool, DriverError> {
        self.with_page(page, |state| state.visible.contains(selector))
    }

    async fn get_text(
        &self,
        page: PageId,
        selector: &str,
        _deadline: Duration,
    ) -> Result<String, DriverError> {
        let text = self.with_page(page, |state| state.text.get(selector).cloned())?;
        text.ok_or_else(|| DriverError::element_not_found(selector))
    }

    async fn title(&self, page: PageId) -> Result<String, DriverError> {
        self.with_page(page, |state| state.title.clone())
    }

    async fn current_url(&self, page: PageId) -> Result<String, DriverError> {
        self.with_page(page, |state| state.url.clone())
    }

    async fn screenshot(&self, page: PageId, _deadline: Duration) -> Result<Vec<u8>, DriverError> {
        let url = self.with_page(page, |state| state.url.clone())?;
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend_from_slice(url.as_bytes());
        Ok(bytes)
    }

    fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.inner.bus.subscribe()
    }
}
