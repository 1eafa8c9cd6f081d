//! Browser automation driver for the meshpilot portal scenarios.
//!
//! Exposes a small asynchronous [`Driver`] surface (navigate, click, fill,
//! selector waits, text queries, screenshots) plus a one-shot page event
//! stream. The default implementation speaks the Chromium DevTools Protocol
//! through a pluggable transport; a scripted in-memory driver backs the
//! scenario and flow-controller tests.

use std::{env, path::PathBuf};
use which::which;

pub mod driver;
pub mod mock;
pub mod transport;

pub use config::DriverConfig;
pub use driver::{CdpDriver, Driver, SelectorState};
pub use error::{DriverError, DriverErrorKind};
pub use events::{event_bus, EventBus, PageEvent};
pub use ids::{BrowserId, PageId};
pub use mock::MockDriver;

pub mod ids {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// Unique identifier for the browser instance owned by the driver.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct BrowserId(pub Uuid);

    /// Unique identifier for a page/tab within the browser context.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct PageId(pub Uuid);

    impl BrowserId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for BrowserId {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PageId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for PageId {
        fn default() -> Self {
            Self::new()
        }
    }
}

pub mod error {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    /// High-level error categories surfaced by the driver.
    #[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
    pub enum DriverErrorKind {
        #[error("navigation timed out")]
        NavTimeout,
        #[error("cdp i/o failure")]
        CdpIo,
        #[error("element not found")]
        ElementNotFound,
        #[error("internal error")]
        Internal,
    }

    /// Enriched error metadata passed back to the flow layer.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DriverError {
        pub kind: DriverErrorKind,
        pub hint: Option<String>,
        pub retriable: bool,
    }

    impl fmt::Display for DriverError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for DriverError {}

    impl DriverError {
        pub fn new(kind: DriverErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                retriable: false,
            }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn retriable(mut self, flag: bool) -> Self {
            self.retriable = flag;
            self
        }

        pub fn element_not_found(selector: &str) -> Self {
            Self::new(DriverErrorKind::ElementNotFound)
                .with_hint(format!("selector {selector:?} never appeared"))
        }
    }
}

pub mod events {
    use super::ids::PageId;
    use serde::{Deserialize, Serialize};
    use tokio::sync::broadcast;

    /// One-shot asynchronous UI events observed on the browser context.
    ///
    /// Listeners interested in an event caused by their own trigger must
    /// subscribe *before* invoking the trigger; delivery to subscriptions
    /// taken afterwards is not guaranteed.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub enum PageEvent {
        Opened {
            page: PageId,
            opener: Option<PageId>,
        },
        Closed {
            page: PageId,
        },
        Navigated {
            page: PageId,
            url: String,
        },
        ResponseReceived {
            page: PageId,
            method: String,
            url: String,
            status: i64,
        },
        DownloadStarted {
            page: PageId,
            url: String,
            suggested_name: Option<String>,
        },
        Console {
            page: PageId,
            level: String,
            text: String,
        },
    }

    impl PageEvent {
        /// Page the event belongs to.
        pub fn page(&self) -> PageId {
            match self {
                PageEvent::Opened { page, .. }
                | PageEvent::Closed { page }
                | PageEvent::Navigated { page, .. }
                | PageEvent::ResponseReceived { page, .. }
                | PageEvent::DownloadStarted { page, .. }
                | PageEvent::Console { page, .. } => *page,
            }
        }
    }

    /// Shared event bus carrying [`PageEvent`]s.
    pub type EventBus = broadcast::Sender<PageEvent>;

    pub fn event_bus(capacity: usize) -> EventBus {
        let (tx, _) = broadcast::channel(capacity.max(1));
        tx
    }
}

pub mod config {
    use super::detect_chrome_executable;
    use serde::{Deserialize, Serialize};
    use std::{env, path::PathBuf, time::Duration};

    /// Configuration for launching and tuning the driver.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DriverConfig {
        pub executable: PathBuf,
        pub headless: bool,
        pub ignore_https_errors: bool,
        pub default_deadline: Duration,
        pub websocket_url: Option<String>,
    }

    impl Default for DriverConfig {
        fn default() -> Self {
            Self {
                executable: detect_chrome_executable().unwrap_or_default(),
                headless: resolve_headless_default(),
                ignore_https_errors: true,
                default_deadline: Duration::from_secs(30),
                websocket_url: None,
            }
        }
    }

    fn resolve_headless_default() -> bool {
        // MESHPILOT_HEADLESS: "0", "false", "no", "off" means headful
        match env::var("MESHPILOT_HEADLESS") {
            Ok(value) => {
                let lower = value.to_ascii_lowercase();
                !matches!(lower.as_str(), "0" | "false" | "no" | "off")
            }
            Err(_) => true,
        }
    }
}

/// Locate a Chromium-family executable, preferring the explicit override.
pub fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("MESHPILOT_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in chrome_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    for candidate in os_specific_chrome_paths() {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    None
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "freebsd"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        &["chrome"]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut paths = Vec::new();
        for key in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
            if let Ok(value) = env::var(key) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    let root = PathBuf::from(trimmed);
                    paths.push(root.join("Google/Chrome/Application/chrome.exe"));
                    paths.push(root.join("Chromium/Application/chrome.exe"));
                }
            }
        }
        paths
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::detect_chrome_executable;
    use std::{env, fs};
    use tempfile::tempdir;

    #[test]
    fn detects_from_env_var() {
        let dir = tempdir().unwrap();
        let exe_path = dir.path().join("my-chrome");
        fs::write(&exe_path, b"").unwrap();
        let original = env::var("MESHPILOT_CHROME").ok();
        env::set_var("MESHPILOT_CHROME", exe_path.to_string_lossy().to_string());
        let detected = detect_chrome_executable();
        if let Some(value) = original {
            env::set_var("MESHPILOT_CHROME", value);
        } else {
            env::remove_var("MESHPILOT_CHROME");
        }
        assert_eq!(detected, Some(exe_path));
    }
}
