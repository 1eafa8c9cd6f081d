//! Driver trait and the CDP-backed implementation.
//!
//! The `CdpDriver` owns the transport, keeps the target/session maps, and
//! translates raw protocol events into [`PageEvent`]s on the shared bus. DOM
//! operations go through `Runtime.evaluate` against the page's session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::error::{DriverError, DriverErrorKind};
use crate::events::{EventBus, PageEvent};
use crate::ids::{BrowserId, PageId};
use crate::transport::{ChromiumTransport, CommandTarget, NoopTransport, Transport, TransportEvent};

/// Element state a selector wait can target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SelectorState {
    Attached,
    Visible,
    Hidden,
}

/// Minimal browser capability surface the flow layer and scenarios consume.
///
/// Every operation addresses an explicit [`PageId`]; there is no ambient
/// "current page". New tabs are observed through the event bus, never through
/// implicit focus changes.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn create_page(&self, url: &str) -> Result<PageId, DriverError>;
    async fn close_page(&self, page: PageId) -> Result<(), DriverError>;
    async fn navigate(&self, page: PageId, url: &str, deadline: Duration)
        -> Result<(), DriverError>;
    async fn reload(&self, page: PageId, deadline: Duration) -> Result<(), DriverError>;
    async fn click(&self, page: PageId, selector: &str, deadline: Duration)
        -> Result<(), DriverError>;
    async fn fill(
        &self,
        page: PageId,
        selector: &str,
        value: &str,
        deadline: Duration,
    ) -> Result<(), DriverError>;
    async fn wait_for_selector(
        &self,
        page: PageId,
        selector: &str,
        state: SelectorState,
        timeout: Duration,
    ) -> Result<(), DriverError>;
    /// Single-shot visibility check, no waiting.
    async fn is_visible(&self, page: PageId, selector: &str) -> Result<bool, DriverError>;
    async fn get_text(
        &self,
        page: PageId,
        selector: &str,
        deadline: Duration,
    ) -> Result<String, DriverError>;
    async fn title(&self, page: PageId) -> Result<String, DriverError>;
    async fn current_url(&self, page: PageId) -> Result<String, DriverError>;
    async fn screenshot(&self, page: PageId, deadline: Duration) -> Result<Vec<u8>, DriverError>;

    /// Subscribe to the page event bus. Callers that need an event caused by
    /// their own trigger must subscribe before invoking the trigger.
    fn subscribe(&self) -> broadcast::Receiver<PageEvent>;
}

/// CDP driver with pluggable transport.
pub struct CdpDriver {
    pub browser_id: BrowserId,
    bus: EventBus,
    transport: Arc<dyn Transport>,
    targets: DashMap<String, PageId>,
    page_targets: DashMap<PageId, String>,
    sessions: DashMap<String, PageId>,
    page_sessions: DashMap<PageId, String>,
    request_methods: DashMap<String, String>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CdpDriver {
    /// Build a driver, falling back to the inert transport when no Chromium
    /// executable or websocket endpoint is available.
    pub fn new(cfg: DriverConfig, bus: EventBus) -> Self {
        let have_browser =
            cfg.websocket_url.is_some() || (!cfg.executable.as_os_str().is_empty() && cfg.executable.exists());

        let transport: Arc<dyn Transport> = if have_browser {
            info!(target: "portal-driver", "using chromium transport");
            Arc::new(ChromiumTransport::new(cfg.clone()))
        } else {
            warn!(
                target: "portal-driver",
                "chromium executable not found; driver runs inert (set MESHPILOT_CHROME)"
            );
            Arc::new(NoopTransport)
        };
        Self::with_transport(bus, transport)
    }

    pub fn with_transport(bus: EventBus, transport: Arc<dyn Transport>) -> Self {
        Self {
            browser_id: BrowserId::new(),
            bus,
            transport,
            targets: DashMap::new(),
            page_targets: DashMap::new(),
            sessions: DashMap::new(),
            page_sessions: DashMap::new(),
            request_methods: DashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<(), DriverError> {
        {
            let guard = self.tasks.lock().await;
            if !guard.is_empty() {
                return Ok(());
            }
        }

        self.transport.start().await?;
        let loop_task = spawn(Self::event_loop(Arc::clone(&self)));
        self.tasks.lock().await.push(loop_task);
        debug!(target: "portal-driver", "event loop started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut handles = self.tasks.lock().await;
        while let Some(handle) = handles.pop() {
            let _ = handle.await;
        }
    }

    async fn event_loop(self: Arc<Self>) {
        loop {
            select! {
                _ = self.shutdown.cancelled() => break,
                event = self.transport.next_event() => {
                    match event {
                        Some(ev) => self.handle_event(ev).await,
                        None => {
                            if self.shutdown.is_cancelled() {
                                break;
                            }
                            // Inert transport never yields; park until shutdown.
                            self.shutdown.cancelled().await;
                            break;
                        }
                    }
                }
            }
        }
        debug!(target: "portal-driver", "event loop exiting");
    }

    async fn handle_event(&self, event: TransportEvent) {
        if let Err(err) = self.process_event(event).await {
            warn!(target: "portal-driver", ?err, "cdp event handling error");
        }
    }

    async fn process_event(&self, event: TransportEvent) -> Result<(), DriverError> {
        match event.method.as_str() {
            "Target.targetCreated" => self.on_target_created(event.params)?,
            "Target.targetDestroyed" => self.on_target_destroyed(event.params)?,
            "Target.attachedToTarget" => self.on_target_attached(event.params).await?,
            "Target.detachedFromTarget" => self.on_target_detached(event.params)?,
            "Page.frameNavigated" => self.on_frame_navigated(event).await?,
            "Page.downloadWillBegin" => self.on_download_will_begin(event)?,
            "Network.requestWillBeSent" => self.on_request_will_be_sent(event)?,
            "Network.responseReceived" => self.on_response_received(event)?,
            "Runtime.consoleAPICalled" => self.on_console_called(event)?,
            _ => {
                debug!(target: "portal-driver", method = %event.method, "unhandled cdp event");
            }
        }
        Ok(())
    }

    fn on_target_created(&self, params: Value) -> Result<(), DriverError> {
        let payload: TargetCreatedParams = decode(params)?;
        if payload.target_info.target_type != "page" {
            return Ok(());
        }

        let target_id = payload.target_info.target_id;
        let page = PageId::new();
        self.targets.insert(target_id.clone(), page);
        self.page_targets.insert(page, target_id);

        let opener = payload
            .target_info
            .opener_id
            .and_then(|opener| self.targets.get(&opener).map(|entry| *entry.value()));
        let _ = self.bus.send(PageEvent::Opened { page, opener });
        Ok(())
    }

    fn on_target_destroyed(&self, params: Value) -> Result<(), DriverError> {
        let payload: TargetDestroyedParams = decode(params)?;
        if let Some((_, page)) = self.targets.remove(&payload.target_id) {
            self.page_targets.remove(&page);
            self.sessions.retain(|_, v| *v != page);
            self.page_sessions.remove(&page);
            let _ = self.bus.send(PageEvent::Closed { page });
        }
        Ok(())
    }

    async fn on_target_attached(&self, params: Value) -> Result<(), DriverError> {
        let payload: AttachedToTargetParams = decode(params)?;
        if payload.target_info.target_type != "page" {
            return Ok(());
        }

        if let Some(entry) = self.targets.get(&payload.target_info.target_id) {
            let page = *entry.value();
            self.sessions.insert(payload.session_id.clone(), page);
            self.page_sessions.insert(page, payload.session_id.clone());
            self.enable_session_domains(payload.session_id).await;
        }
        Ok(())
    }

    fn on_target_detached(&self, params: Value) -> Result<(), DriverError> {
        let payload: DetachedFromTargetParams = decode(params)?;
        if let Some((_, page)) = self.sessions.remove(&payload.session_id) {
            self.page_sessions.remove(&page);
        }
        Ok(())
    }

    /// Page, Network and Runtime domains must be enabled per session before
    /// their events are delivered.
    async fn enable_session_domains(&self, session_id: String) {
        for method in ["Page.enable", "Network.enable", "Runtime.enable"] {
            if let Err(err) = self
                .transport
                .send_command(
                    CommandTarget::Session(session_id.clone()),
                    method,
                    json!({}),
                )
                .await
            {
                warn!(target: "portal-driver", ?err, method, "failed to enable domain");
            }
        }
        if let Err(err) = self
            .transport
            .send_command(
                CommandTarget::Session(session_id),
                "Page.setLifecycleEventsEnabled",
                json!({ "enabled": true }),
            )
            .await
        {
            debug!(target: "portal-driver", ?err, "lifecycle events not enabled");
        }
    }

    async fn on_frame_navigated(&self, event: TransportEvent) -> Result<(), DriverError> {
        let payload: FrameNavigatedParams = decode(event.params)?;
        // Only the main frame counts as a page navigation.
        if payload.frame.parent_id.is_some() {
            return Ok(());
        }
        if let Some(page) = self.page_from_session(event.session_id.as_ref()) {
            let _ = self.bus.send(PageEvent::Navigated {
                page,
                url: payload.frame.url,
            });
        }
        Ok(())
    }

    fn on_download_will_begin(&self, event: TransportEvent) -> Result<(), DriverError> {
        let payload: DownloadWillBeginParams = decode(event.params)?;
        if let Some(page) = self.page_from_session(event.session_id.as_ref()) {
            let _ = self.bus.send(PageEvent::DownloadStarted {
                page,
                url: payload.url,
                suggested_name: payload.suggested_filename,
            });
        }
        Ok(())
    }

    fn on_request_will_be_sent(&self, event: TransportEvent) -> Result<(), DriverError> {
        let payload: RequestWillBeSentParams = decode(event.params)?;
        self.request_methods
            .insert(payload.request_id, payload.request.method);
        Ok(())
    }

    fn on_response_received(&self, event: TransportEvent) -> Result<(), DriverError> {
        let payload: ResponseReceivedParams = decode(event.params)?;
        let method = self
            .request_methods
            .remove(&payload.request_id)
            .map(|(_, m)| m)
            .unwrap_or_else(|| "GET".to_string());

        if let Some(page) = self.page_from_session(event.session_id.as_ref()) {
            let _ = self.bus.send(PageEvent::ResponseReceived {
                page,
                method,
                url: payload.response.url,
                status: payload.response.status,
            });
        }
        Ok(())
    }

    fn on_console_called(&self, event: TransportEvent) -> Result<(), DriverError> {
        let payload: ConsoleApiCalledParams = decode(event.params)?;
        if let Some(page) = self.page_from_session(event.session_id.as_ref()) {
            let text = payload
                .args
                .iter()
                .filter_map(|arg| arg.value.as_ref())
                .map(value_preview)
                .collect::<Vec<_>>()
                .join(" ");
            let _ = self.bus.send(PageEvent::Console {
                page,
                level: payload.kind,
                text,
            });
        }
        Ok(())
    }

    fn page_from_session(&self, session: Option<&String>) -> Option<PageId> {
        session.and_then(|sid| self.sessions.get(sid).map(|entry| *entry.value()))
    }

    async fn send_page_command(
        &self,
        page: PageId,
        method: &str,
        params: Value,
    ) -> Result<Value, DriverError> {
        let session = self
            .page_sessions
            .get(&page)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::Internal)
                    .with_hint(format!("missing cdp session for page {page:?}"))
            })?;
        self.transport
            .send_command(CommandTarget::Session(session), method, params)
            .await
    }

    async fn evaluate(&self, page: PageId, expression: &str) -> Result<Value, DriverError> {
        let response = self
            .send_page_command(
                page,
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        Ok(response
            .get("result")
            .and_then(|v| v.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn wait_for_dom_ready(&self, page: PageId, deadline: Instant) -> Result<(), DriverError> {
        loop {
            if Instant::now() >= deadline {
                return Err(DriverError::new(DriverErrorKind::NavTimeout)
                    .with_hint("document never became ready"));
            }

            let ready = self
                .evaluate(page, "document.readyState")
                .await?
                .as_str()
                .map(|state| matches!(state, "interactive" | "complete"))
                .unwrap_or(false);

            if ready {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, DriverError> {
    serde_json::from_value(params)
        .map_err(|err| DriverError::new(DriverErrorKind::Internal).with_hint(err.to_string()))
}

fn value_preview(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn js_literal(text: &str) -> Result<String, DriverError> {
    serde_json::to_string(text)
        .map_err(|err| DriverError::new(DriverErrorKind::Internal).with_hint(err.to_string()))
}

fn selector_predicate(selector_literal: &str, state: SelectorState) -> String {
    let visible_expr = format!(
        "(() => {{ const el = document.querySelector({sel}); if (!el) return false; \
         const rect = el.getBoundingClientRect(); \
         const style = window.getComputedStyle(el); \
         return rect.width > 0 && rect.height > 0 && style.visibility !== 'hidden' && style.display !== 'none'; }})()",
        sel = selector_literal
    );
    match state {
        SelectorState::Attached => format!(
            "(() => !!document.querySelector({sel}))()",
            sel = selector_literal
        ),
        SelectorState::Visible => visible_expr,
        SelectorState::Hidden => format!("!({visible_expr})"),
    }
}

#[async_trait]
impl Driver for CdpDriver {
    async fn create_page(&self, url: &str) -> Result<PageId, DriverError> {
        let response = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.createTarget",
                json!({ "url": url }),
            )
            .await?;
        let target_id = response
            .get("targetId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::Internal)
                    .with_hint("createTarget missing targetId")
            })?
            .to_string();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(entry) = self.targets.get(&target_id) {
                let page = *entry.value();
                if self.page_sessions.contains_key(&page) {
                    return Ok(page);
                }
            }
            if Instant::now() >= deadline {
                return Err(DriverError::new(DriverErrorKind::Internal)
                    .with_hint("timed out waiting for target attach"));
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    async fn close_page(&self, page: PageId) -> Result<(), DriverError> {
        let target_id = self
            .page_targets
            .get(&page)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::Internal)
                    .with_hint(format!("unknown page {page:?}"))
            })?;
        self.transport
            .send_command(
                CommandTarget::Browser,
                "Target.closeTarget",
                json!({ "targetId": target_id }),
            )
            .await
            .map(|_| ())
    }

    async fn navigate(
        &self,
        page: PageId,
        url: &str,
        deadline: Duration,
    ) -> Result<(), DriverError> {
        let due = Instant::now() + deadline;
        self.send_page_command(page, "Page.navigate", json!({ "url": url }))
            .await?;
        self.wait_for_dom_ready(page, due).await
    }

    async fn reload(&self, page: PageId, deadline: Duration) -> Result<(), DriverError> {
        let due = Instant::now() + deadline;
        self.send_page_command(page, "Page.reload", json!({}))
            .await?;
        // Give the reload a beat to tear the old document down before the
        // readiness poll, or it observes the outgoing document as complete.
        sleep(Duration::from_millis(100)).await;
        self.wait_for_dom_ready(page, due).await
    }

    async fn click(
        &self,
        page: PageId,
        selector: &str,
        _deadline: Duration,
    ) -> Result<(), DriverError> {
        let literal = js_literal(selector)?;
        let expression = format!(
            "(() => {{ const el = document.querySelector({literal}); if (!el) return false; \
             el.scrollIntoView({{ block: 'center' }}); el.click(); return true; }})()"
        );
        match self.evaluate(page, &expression).await?.as_bool() {
            Some(true) => Ok(()),
            _ => Err(DriverError::element_not_found(selector)),
        }
    }

    async fn fill(
        &self,
        page: PageId,
        selector: &str,
        value: &str,
        _deadline: Duration,
    ) -> Result<(), DriverError> {
        let sel = js_literal(selector)?;
        let val = js_literal(value)?;
        // Set the value through the prototype setter so framework-bound
        // inputs observe the change, then fire input/change.
        let expression = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return false; \
             el.focus(); \
             const proto = el.tagName === 'TEXTAREA' ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype; \
             const desc = Object.getOwnPropertyDescriptor(proto, 'value'); \
             if (desc && desc.set) {{ desc.set.call(el, {val}); }} else {{ el.value = {val}; }} \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
             return true; }})()"
        );
        match self.evaluate(page, &expression).await?.as_bool() {
            Some(true) => Ok(()),
            _ => Err(DriverError::element_not_found(selector)),
        }
    }

    async fn wait_for_selector(
        &self,
        page: PageId,
        selector: &str,
        state: SelectorState,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let literal = js_literal(selector)?;
        let predicate = selector_predicate(&literal, state);
        let due = Instant::now() + timeout;

        loop {
            if self
                .evaluate(page, &predicate)
                .await?
                .as_bool()
                .unwrap_or(false)
            {
                return Ok(());
            }
            if Instant::now() >= due {
                return match state {
                    SelectorState::Hidden => Err(DriverError::new(DriverErrorKind::NavTimeout)
                        .with_hint(format!("selector {selector:?} still visible"))),
                    _ => Err(DriverError::element_not_found(selector)),
                };
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    async fn is_visible(&self, page: PageId, selector: &str) -> Result<bool, DriverError> {
        let literal = js_literal(selector)?;
        let predicate = selector_predicate(&literal, SelectorState::Visible);
        Ok(self
            .evaluate(page, &predicate)
            .await?
            .as_bool()
            .unwrap_or(false))
    }

    async fn get_text(
        &self,
        page: PageId,
        selector: &str,
        _deadline: Duration,
    ) -> Result<String, DriverError> {
        let literal = js_literal(selector)?;
        let expression = format!(
            "(() => {{ const el = document.querySelector({literal}); \
             return el ? el.textContent : null; }})()"
        );
        match self.evaluate(page, &expression).await? {
            Value::String(text) => Ok(text),
            _ => Err(DriverError::element_not_found(selector)),
        }
    }

    async fn title(&self, page: PageId) -> Result<String, DriverError> {
        Ok(self
            .evaluate(page, "document.title")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn current_url(&self, page: PageId) -> Result<String, DriverError> {
        Ok(self
            .evaluate(page, "window.location.href")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn screenshot(&self, page: PageId, _deadline: Duration) -> Result<Vec<u8>, DriverError> {
        let response = self
            .send_page_command(page, "Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = response
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::Internal).with_hint("screenshot missing data")
            })?;
        STANDARD
            .decode(data)
            .map_err(|err| DriverError::new(DriverErrorKind::Internal).with_hint(err.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.bus.subscribe()
    }
}

#[derive(Debug, Deserialize)]
struct TargetCreatedParams {
    #[serde(rename = "targetInfo")]
    target_info: TargetInfoPayload,
}

#[derive(Debug, Deserialize)]
struct TargetDestroyedParams {
    #[serde(rename = "targetId")]
    target_id: String,
}

#[derive(Debug, Deserialize)]
struct AttachedToTargetParams {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "targetInfo")]
    target_info: TargetInfoPayload,
}

#[derive(Debug, Deserialize)]
struct DetachedFromTargetParams {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct TargetInfoPayload {
    #[serde(rename = "targetId")]
    target_id: String,
    #[serde(rename = "type")]
    target_type: String,
    #[serde(rename = "openerId")]
    opener_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FrameNavigatedParams {
    frame: FramePayload,
}

#[derive(Debug, Deserialize)]
struct FramePayload {
    #[serde(rename = "parentId")]
    parent_id: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct DownloadWillBeginParams {
    url: String,
    #[serde(rename = "suggestedFilename")]
    suggested_filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RequestWillBeSentParams {
    #[serde(rename = "requestId")]
    request_id: String,
    request: RequestPayload,
}

#[derive(Debug, Deserialize)]
struct RequestPayload {
    method: String,
}

#[derive(Debug, Deserialize)]
struct ResponseReceivedParams {
    #[serde(rename = "requestId")]
    request_id: String,
    response: ResponsePayload,
}

#[derive(Debug, Deserialize)]
struct ResponsePayload {
    url: String,
    status: i64,
}

#[derive(Debug, Deserialize)]
struct ConsoleApiCalledParams {
    #[serde(rename = "type")]
    kind: String,
    args: Vec<RemoteObjectPayload>,
}

#[derive(Debug, Deserialize)]
struct RemoteObjectPayload {
    value: Option<Value>,
}
