//! Pluggable CDP transport.
//!
//! The real transport launches (or attaches to) a Chromium instance and
//! multiplexes raw protocol commands and events over its DevTools websocket.
//! The no-op transport stands in when no browser is available so the rest of
//! the stack stays constructible in tests and on machines without Chromium.

use std::collections::{HashMap, VecDeque};
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::io::{AsyncBufReadExt, BufReader};
use futures::stream::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::error::{DriverError, DriverErrorKind};

/// Raw protocol event as delivered by the websocket.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Addressing for a protocol command.
#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<(), DriverError>;
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, DriverError>;
}

/// Inert transport used when no browser is reachable.
#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn start(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        None
    }

    async fn send_command(
        &self,
        _target: CommandTarget,
        method: &str,
        _params: Value,
    ) -> Result<Value, DriverError> {
        Err(DriverError::new(DriverErrorKind::Internal)
            .with_hint(format!("transport not available for method {method}")))
    }
}

/// Transport backed by a live Chromium DevTools connection.
pub struct ChromiumTransport {
    cfg: DriverConfig,
    wire: Arc<OnceCell<Mutex<Option<Arc<Wire>>>>>,
}

impl ChromiumTransport {
    pub fn new(cfg: DriverConfig) -> Self {
        Self {
            cfg,
            wire: Arc::new(OnceCell::new()),
        }
    }

    /// Current wire, reconnecting if the previous one died.
    async fn wire(&self) -> Result<Arc<Wire>, DriverError> {
        let cell = self.wire.get_or_init(|| async { Mutex::new(None) }).await;
        let mut guard = cell.lock().await;

        if let Some(wire) = guard.as_ref() {
            if wire.healthy() {
                return Ok(wire.clone());
            }
            warn!(target: "portal-transport", "wire lost; reconnecting to chromium");
        }

        let wire = Arc::new(Wire::connect(self.cfg.clone()).await?);
        *guard = Some(wire.clone());
        Ok(wire)
    }
}

#[async_trait]
impl Transport for ChromiumTransport {
    async fn start(&self) -> Result<(), DriverError> {
        let wire = self.wire().await?;
        let deadline = self.cfg.default_deadline;

        wire.dispatch(
            CommandTarget::Browser,
            "Target.setDiscoverTargets",
            json!({ "discover": true }),
            deadline,
        )
        .await?;

        wire.dispatch(
            CommandTarget::Browser,
            "Target.setAutoAttach",
            json!({
                "autoAttach": true,
                "waitForDebuggerOnStart": false,
                "flatten": true,
            }),
            deadline,
        )
        .await?;

        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        match self.wire().await {
            Ok(wire) => wire.next_event().await,
            Err(err) => {
                warn!(target: "portal-transport", ?err, "no wire for event stream");
                None
            }
        }
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, DriverError> {
        let wire = self.wire().await?;
        wire.dispatch(target, method, params, self.cfg.default_deadline)
            .await
    }
}

struct CommandRequest {
    target: CommandTarget,
    method: String,
    params: Value,
    reply: oneshot::Sender<Result<Value, DriverError>>,
}

/// One live websocket connection plus the pump task feeding it.
struct Wire {
    requests: mpsc::Sender<CommandRequest>,
    events: Mutex<mpsc::Receiver<TransportEvent>>,
    pump: JoinHandle<()>,
    browser: Mutex<Option<Child>>,
    healthy: Arc<AtomicBool>,
}

impl Wire {
    async fn connect(cfg: DriverConfig) -> Result<Self, DriverError> {
        let (browser, ws_url) = match cfg.websocket_url.clone() {
            Some(url) => (None, url),
            None => {
                let mut child = launch_chromium(&cfg)?;
                let url = wait_for_devtools_url(&mut child, Duration::from_secs(20)).await?;
                (Some(child), url)
            }
        };

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| {
                DriverError::new(DriverErrorKind::CdpIo)
                    .with_hint(format!("devtools websocket connect failed: {err}"))
            })?;

        let (requests, request_rx) = mpsc::channel(128);
        let (event_tx, events) = mpsc::channel(512);
        let healthy = Arc::new(AtomicBool::new(true));

        let pump_flag = healthy.clone();
        let pump = tokio::spawn(async move {
            let reason = pump(conn, request_rx, event_tx).await;
            pump_flag.store(false, Ordering::Relaxed);
            match reason {
                PumpExit::ConnectionClosed => {
                    debug!(target: "portal-transport", "devtools connection closed")
                }
                PumpExit::Failed(err) => {
                    warn!(target: "portal-transport", ?err, "devtools pump stopped")
                }
            }
        });

        info!(target: "portal-transport", url = %ws_url, "connected to chromium devtools");

        Ok(Self {
            requests,
            events: Mutex::new(events),
            pump,
            browser: Mutex::new(browser),
            healthy,
        })
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn dispatch(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, DriverError> {
        let (reply, on_reply) = oneshot::channel();
        self.requests
            .send(CommandRequest {
                target,
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| {
                DriverError::new(DriverErrorKind::CdpIo).with_hint("transport pump is gone")
            })?;

        match tokio::time::timeout(deadline, on_reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DriverError::new(DriverErrorKind::CdpIo)
                .with_hint(format!("pump dropped reply for {method}"))),
            Err(_) => Err(DriverError::new(DriverErrorKind::NavTimeout)
                .with_hint(format!("no reply to {method} within {deadline:?}"))
                .retriable(true)),
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events.lock().await.recv().await
    }
}

impl Drop for Wire {
    fn drop(&mut self) {
        self.healthy.store(false, Ordering::Relaxed);
        self.pump.abort();

        // The child, if we launched one, dies with the wire.
        if let Ok(mut guard) = self.browser.try_lock() {
            if let Some(mut child) = guard.take() {
                debug!(target: "portal-transport", "terminating chromium child");
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = child.kill().await;
                    });
                }
            }
        }
    }
}

/// Commands submitted but not yet answered, keyed by protocol call id.
struct Inflight(HashMap<CallId, oneshot::Sender<Result<Value, DriverError>>>);

impl Inflight {
    fn new() -> Self {
        Self(HashMap::new())
    }

    fn track(&mut self, id: CallId, reply: oneshot::Sender<Result<Value, DriverError>>) {
        self.0.insert(id, reply);
    }

    fn settle(&mut self, resp: Response) {
        if let Some(reply) = self.0.remove(&resp.id) {
            let _ = reply.send(response_to_result(resp));
        }
    }

    fn fail_all(&mut self, err: &DriverError) {
        for (_, reply) in self.0.drain() {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

enum PumpExit {
    ConnectionClosed,
    Failed(DriverError),
}

/// Drive the websocket: submit queued commands, pair responses to their
/// callers, forward events. Runs until the connection ends, failing every
/// outstanding command on the way out.
async fn pump(
    mut conn: Connection<CdpEventMessage>,
    mut requests: mpsc::Receiver<CommandRequest>,
    events: mpsc::Sender<TransportEvent>,
) -> PumpExit {
    let mut inflight = Inflight::new();

    loop {
        tokio::select! {
            Some(req) = requests.recv() => {
                let session = match req.target {
                    CommandTarget::Browser => None,
                    CommandTarget::Session(id) => Some(CdpSessionId::from(id)),
                };
                let method: MethodId = req.method.clone().into();
                match conn.submit_command(method, session, req.params) {
                    Ok(call_id) => inflight.track(call_id, req.reply),
                    Err(err) => {
                        let _ = req.reply.send(Err(DriverError::new(DriverErrorKind::CdpIo)
                            .with_hint(format!("could not submit {}: {err}", req.method))));
                    }
                }
            }
            message = conn.next() => match message {
                Some(Ok(Message::Response(resp))) => inflight.settle(resp),
                Some(Ok(Message::Event(event))) => match into_transport_event(event) {
                    Ok(ev) => {
                        if events.send(ev).await.is_err() {
                            // Nobody is listening any more.
                            return PumpExit::ConnectionClosed;
                        }
                    }
                    Err(err) => {
                        warn!(target: "portal-transport", ?err, "dropping undecodable event");
                    }
                },
                Some(Err(err)) => {
                    let err = classify_cdp_error(err);
                    inflight.fail_all(&err);
                    return PumpExit::Failed(err);
                }
                None => {
                    inflight.fail_all(
                        &DriverError::new(DriverErrorKind::CdpIo)
                            .with_hint("devtools connection closed"),
                    );
                    return PumpExit::ConnectionClosed;
                }
            }
        }
    }
}

fn into_transport_event(event: CdpEventMessage) -> Result<TransportEvent, DriverError> {
    let raw: CdpJsonEventMessage = event.try_into().map_err(|err| {
        DriverError::new(DriverErrorKind::Internal).with_hint(format!("event decode: {err}"))
    })?;
    Ok(TransportEvent {
        method: raw.method.into_owned(),
        params: raw.params,
        session_id: raw.session_id,
    })
}

fn response_to_result(resp: Response) -> Result<Value, DriverError> {
    match (resp.result, resp.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(DriverError::new(DriverErrorKind::CdpIo)
            .with_hint(format!("browser error {}: {}", error.code, error.message))
            .retriable(error.code >= 500)),
        (None, None) => Err(DriverError::new(DriverErrorKind::Internal)
            .with_hint("browser reply carried neither result nor error")),
    }
}

fn classify_cdp_error(err: CdpError) -> DriverError {
    let hint = err.to_string();
    match err {
        CdpError::Timeout => DriverError::new(DriverErrorKind::NavTimeout)
            .with_hint(hint)
            .retriable(true),
        CdpError::FrameNotFound(_) | CdpError::JavascriptException(_) | CdpError::Serde(_) => {
            DriverError::new(DriverErrorKind::Internal).with_hint(hint)
        }
        _ => DriverError::new(DriverErrorKind::CdpIo)
            .with_hint(hint)
            .retriable(true),
    }
}

fn launch_chromium(cfg: &DriverConfig) -> Result<Child, DriverError> {
    if !cfg.executable.as_os_str().is_empty() && !cfg.executable.exists() {
        return Err(DriverError::new(DriverErrorKind::CdpIo).with_hint(format!(
            "chrome executable not found at {} (set MESHPILOT_CHROME)",
            cfg.executable.display()
        )));
    }

    let mut builder = BrowserConfig::builder()
        .request_timeout(cfg.default_deadline)
        .launch_timeout(Duration::from_secs(20));

    if !cfg.headless {
        builder = builder.with_head();
    }

    let mut args = vec![
        "--disable-background-networking",
        "--disable-background-timer-throttling",
        "--disable-breakpad",
        "--disable-component-update",
        "--disable-default-apps",
        "--disable-dev-shm-usage",
        "--disable-extensions",
        "--disable-hang-monitor",
        "--disable-popup-blocking",
        "--disable-prompt-on-repost",
        "--disable-sync",
        "--no-first-run",
        "--no-default-browser-check",
        "--password-store=basic",
        "--remote-allow-origins=*",
    ];
    if cfg.headless {
        args.push("--headless=new");
        args.push("--hide-scrollbars");
        args.push("--mute-audio");
    }
    // The portal under test runs on a self-signed local certificate.
    if cfg.ignore_https_errors {
        args.push("--ignore-certificate-errors");
    }
    builder = builder.args(args);

    if !cfg.executable.as_os_str().is_empty() {
        builder = builder.chrome_executable(cfg.executable.clone());
    }

    let config = builder.build().map_err(|err| {
        DriverError::new(DriverErrorKind::Internal).with_hint(format!("browser config: {err}"))
    })?;
    config.launch().map_err(|err| {
        DriverError::new(DriverErrorKind::CdpIo)
            .with_hint(format!("chromium did not launch: {err}"))
    })
}

/// Pull the DevTools browser endpoint out of a chromium stderr line, if the
/// line announces one.
fn devtools_url_from_line(line: &str) -> Option<&str> {
    let start = line.find("ws://").or_else(|| line.find("wss://"))?;
    let url = line[start..].split_whitespace().next()?;
    if url.contains("/devtools/browser/") {
        Some(url)
    } else {
        None
    }
}

const STDERR_TAIL: usize = 10;

/// Watch chromium's stderr until it announces its DevTools endpoint. On
/// failure the last few stderr lines go into the error hint, since that is
/// where chromium explains itself.
async fn wait_for_devtools_url(
    child: &mut Child,
    limit: Duration,
) -> Result<String, DriverError> {
    let stderr = child.stderr.take().ok_or_else(|| {
        DriverError::new(DriverErrorKind::Internal).with_hint("chromium stderr was not piped")
    })?;
    let mut lines = BufReader::new(stderr).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);

    let scan = async {
        while let Some(line) = lines.next().await {
            let line = line.map_err(|err| {
                DriverError::new(DriverErrorKind::CdpIo)
                    .with_hint(format!("reading chromium stderr: {err}"))
            })?;
            if let Some(url) = devtools_url_from_line(&line) {
                return Ok(url.to_string());
            }
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Err(DriverError::new(DriverErrorKind::CdpIo).with_hint(format!(
            "chromium exited without a devtools endpoint; stderr tail: {}",
            tail.iter().cloned().collect::<Vec<_>>().join(" | ")
        )))
    };

    match tokio::time::timeout(limit, scan).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::new(DriverErrorKind::NavTimeout)
            .with_hint(format!("devtools endpoint not announced within {limit:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devtools_url_is_extracted_from_announcement_line() {
        let line = "DevTools listening on ws://127.0.0.1:9222/devtools/browser/abc-123";
        assert_eq!(
            devtools_url_from_line(line),
            Some("ws://127.0.0.1:9222/devtools/browser/abc-123")
        );
    }

    #[test]
    fn unrelated_stderr_lines_are_ignored() {
        assert_eq!(devtools_url_from_line("[WARNING] gpu init failed"), None);
        // Page-level websocket urls are not the browser endpoint.
        assert_eq!(
            devtools_url_from_line("ws://127.0.0.1:9222/devtools/page/XYZ"),
            None
        );
    }

    fn reply(body: Value) -> Response {
        serde_json::from_value(body).expect("well-formed response")
    }

    #[test]
    fn browser_error_replies_map_to_cdp_io() {
        let resp = reply(json!({
            "id": 1,
            "error": { "code": -32000, "message": "No target with given id" },
        }));
        let err = response_to_result(resp).unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::CdpIo);
        assert!(!err.retriable);
        assert!(err.hint.unwrap().contains("No target with given id"));
    }

    #[test]
    fn empty_replies_are_internal_errors() {
        let resp = reply(json!({ "id": 2 }));
        let err = response_to_result(resp).unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Internal);
    }
}
