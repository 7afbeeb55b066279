//! Browser driver contract
//!
//! The browser itself is an external collaborator; the core only depends on
//! this async trait. One skill call owns one driver instance at a time;
//! concurrent skills each launch their own via [`BrowserLauncher`].
//!
//! [`MockBrowser`] is the scripted in-process implementation used by tests
//! and offline runs: it records every action, lets tests mark selectors
//! visible, and can be told to fail specific selectors.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NervaError, Result};

/// Navigation completion criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitUntil {
    Load,
    #[default]
    DomContentLoaded,
    NetworkIdle,
}

/// Selector wait criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorState {
    Attached,
    #[default]
    Visible,
    Hidden,
}

/// Launch options passed to the external driver
#[derive(Debug, Clone, Default)]
pub struct BrowserConfig {
    pub headless: bool,
    /// Persistent profile directory for authenticated sessions
    pub user_data_dir: Option<PathBuf>,
}

/// Factory for per-skill-call browser instances
pub trait BrowserLauncher: Send + Sync {
    fn launch(&self, config: &BrowserConfig) -> Result<Box<dyn BrowserDriver>>;
}

/// Placeholder launcher for installs without a browser driver wired in.
/// Browser-bound skills fail cleanly; everything else keeps working.
pub struct UnconfiguredLauncher;

impl BrowserLauncher for UnconfiguredLauncher {
    fn launch(&self, _config: &BrowserConfig) -> Result<Box<dyn BrowserDriver>> {
        Err(NervaError::Browser {
            reason: "no browser driver configured".to_string(),
        })
    }
}

/// Async browser contract consumed by playbooks and the vision agent
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str, wait_until: WaitUntil) -> Result<()>;
    async fn click(&self, selector: &str, timeout: Duration) -> Result<()>;
    async fn fill(&self, selector: &str, text: &str, timeout: Duration) -> Result<()>;
    async fn get_text(&self, selector: &str, timeout: Duration) -> Result<String>;
    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
        state: SelectorState,
    ) -> Result<()>;
    async fn evaluate(&self, script: &str) -> Result<Value>;
    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>>;
    async fn press_key(&self, key: &str) -> Result<()>;
    async fn select(&self, selector: &str, value: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// MOCK BROWSER
// ============================================================================

/// Everything the mock saw, for assertions
#[derive(Debug, Clone, PartialEq)]
pub enum BrowserAction {
    Navigate(String),
    Click(String),
    Fill(String, String),
    GetText(String),
    WaitFor(String),
    Evaluate(String),
    Screenshot,
    PressKey(String),
    Select(String, String),
    Close,
}

#[derive(Default)]
struct MockState {
    actions: Vec<BrowserAction>,
    visible: HashSet<String>,
    failing: HashSet<String>,
    eval_results: Vec<Value>,
    text_results: Vec<String>,
    navigation_blocked: bool,
    closed: bool,
}

/// Scripted browser for tests and offline runs
#[derive(Clone, Default)]
pub struct MockBrowser {
    state: Arc<Mutex<MockState>>,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a selector as present/visible.
    pub fn set_visible(&self, selector: impl Into<String>) {
        self.state.lock().unwrap().visible.insert(selector.into());
    }

    /// Make interactions with a selector fail with `SelectorNotFound`.
    pub fn fail_selector(&self, selector: impl Into<String>) {
        self.state.lock().unwrap().failing.insert(selector.into());
    }

    /// Make every navigation fail (unrecoverable browser error).
    pub fn block_navigation(&self) {
        self.state.lock().unwrap().navigation_blocked = true;
    }

    pub fn queue_eval_result(&self, value: Value) {
        self.state.lock().unwrap().eval_results.push(value);
    }

    pub fn queue_text(&self, text: impl Into<String>) {
        self.state.lock().unwrap().text_results.push(text.into());
    }

    pub fn actions(&self) -> Vec<BrowserAction> {
        self.state.lock().unwrap().actions.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn record(&self, action: BrowserAction) {
        self.state.lock().unwrap().actions.push(action);
    }

    fn check_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        if self.state.lock().unwrap().failing.contains(selector) {
            return Err(NervaError::SelectorNotFound {
                selector: selector.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }
}

/// Launcher that hands out clones of one shared mock (so tests can inspect
/// actions after the skill call finishes).
pub struct MockLauncher {
    browser: MockBrowser,
}

impl MockLauncher {
    pub fn new(browser: MockBrowser) -> Self {
        Self { browser }
    }
}

impl BrowserLauncher for MockLauncher {
    fn launch(&self, _config: &BrowserConfig) -> Result<Box<dyn BrowserDriver>> {
        Ok(Box::new(self.browser.clone()))
    }
}

#[async_trait]
impl BrowserDriver for MockBrowser {
    async fn navigate(&self, url: &str, _wait_until: WaitUntil) -> Result<()> {
        if self.state.lock().unwrap().navigation_blocked {
            return Err(NervaError::NavigationBlocked {
                url: url.to_string(),
                reason: "navigation blocked".to_string(),
            });
        }
        self.record(BrowserAction::Navigate(url.to_string()));
        Ok(())
    }

    async fn click(&self, selector: &str, timeout: Duration) -> Result<()> {
        self.check_selector(selector, timeout)?;
        self.record(BrowserAction::Click(selector.to_string()));
        Ok(())
    }

    async fn fill(&self, selector: &str, text: &str, timeout: Duration) -> Result<()> {
        self.check_selector(selector, timeout)?;
        self.record(BrowserAction::Fill(selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn get_text(&self, selector: &str, timeout: Duration) -> Result<String> {
        self.check_selector(selector, timeout)?;
        self.record(BrowserAction::GetText(selector.to_string()));
        let mut state = self.state.lock().unwrap();
        Ok(if state.text_results.is_empty() {
            String::new()
        } else {
            state.text_results.remove(0)
        })
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
        _state: SelectorState,
    ) -> Result<()> {
        self.record(BrowserAction::WaitFor(selector.to_string()));
        let visible = self.state.lock().unwrap().visible.contains(selector);
        if !visible {
            self.check_selector(selector, timeout)?;
            // Unknown selectors that were not scripted as failing are treated
            // as appearing immediately, which keeps playbook fixtures short.
        }
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        self.record(BrowserAction::Evaluate(script.to_string()));
        let mut state = self.state.lock().unwrap();
        Ok(if state.eval_results.is_empty() {
            Value::Null
        } else {
            state.eval_results.remove(0)
        })
    }

    async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>> {
        self.record(BrowserAction::Screenshot);
        Ok(b"\x89PNG mock".to_vec())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        self.record(BrowserAction::PressKey(key.to_string()));
        Ok(())
    }

    async fn select(&self, selector: &str, value: &str) -> Result<()> {
        self.check_selector(selector, Duration::ZERO)?;
        self.record(BrowserAction::Select(
            selector.to_string(),
            value.to_string(),
        ));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.actions.push(BrowserAction::Close);
        Ok(())
    }
}
