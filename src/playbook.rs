//! Playbook runner - deterministic browser sequences
//!
//! Playbooks cover flows with stable selectors (known app UIs) so no vision
//! model is consulted per step. Steps run strictly in order; each step may
//! carry a guard (skip, not fail, when false), a `wait_for` selector, and an
//! `on_failure` policy. Preconditions and postconditions are step lists run
//! through the same executor; a failed postcondition fails the playbook even
//! when every step succeeded.
//!
//! Playbooks are plain data with a lossless YAML representation, so skills
//! can embed them as documents:
//!
//! ```yaml
//! name: mail.inbox
//! steps:
//!   - name: open
//!     navigate:
//!       url: https://mail.example.com
//!   - name: inbox_ready
//!     wait:
//!       selector: "#inbox"
//!   - name: shot
//!     screenshot: {}
//! ```

use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::browser::{BrowserDriver, SelectorState, WaitUntil};
use crate::context::RunContext;
use crate::error::{NervaError, Result};

/// Backoff between retry attempts of one step
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
/// Guard probes should answer fast; they are not waits.
const GUARD_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// DECLARATIVE TYPES
// ============================================================================

/// Browser action of one step (externally tagged for YAML ergonomics)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Navigate {
        url: String,
        #[serde(default)]
        wait_until: WaitUntil,
    },
    Click {
        selector: String,
    },
    Fill {
        selector: String,
        text: String,
    },
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    Evaluate {
        script: String,
    },
    Screenshot {
        #[serde(default)]
        full_page: bool,
    },
    PressKey {
        key: String,
    },
    Select {
        selector: String,
        value: String,
    },
}

/// Declarative predicate guarding a step. All present conditions must hold;
/// `not` negates its inner guard. An empty guard is true.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Guard {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector_visible: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_present: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<Guard>>,
}

impl Guard {
    pub fn selector_visible(selector: impl Into<String>) -> Self {
        Self {
            selector_visible: Some(selector.into()),
            ..Default::default()
        }
    }

    pub fn artifact_present(key: impl Into<String>) -> Self {
        Self {
            artifact_present: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn negated(inner: Guard) -> Self {
        Self {
            not: Some(Box::new(inner)),
            ..Default::default()
        }
    }
}

/// What to do when a step's action raises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnFailure {
    #[default]
    Abort,
    Continue,
    Retry(u32),
}

// Plain YAML forms: `abort`, `continue`, or `{retry: n}`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum OnFailureRepr {
    Word(String),
    Retry { retry: u32 },
}

impl Serialize for OnFailure {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let repr = match self {
            OnFailure::Abort => OnFailureRepr::Word("abort".to_string()),
            OnFailure::Continue => OnFailureRepr::Word("continue".to_string()),
            OnFailure::Retry(n) => OnFailureRepr::Retry { retry: *n },
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OnFailure {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        match OnFailureRepr::deserialize(deserializer)? {
            OnFailureRepr::Word(word) => match word.as_str() {
                "abort" => Ok(OnFailure::Abort),
                "continue" => Ok(OnFailure::Continue),
                other => Err(serde::de::Error::custom(format!(
                    "unknown on_failure '{}' (expected abort, continue, or retry)",
                    other
                ))),
            },
            OnFailureRepr::Retry { retry } => Ok(OnFailure::Retry(retry)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookStep {
    pub name: String,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
    #[serde(default, skip_serializing_if = "is_default_on_failure")]
    pub on_failure: OnFailure,
}

fn is_default_on_failure(v: &OnFailure) -> bool {
    *v == OnFailure::Abort
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Playbook {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preconditions: Vec<PlaybookStep>,
    #[serde(default)]
    pub steps: Vec<PlaybookStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postconditions: Vec<PlaybookStep>,
}

impl Playbook {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(Into::into)
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookReport {
    pub playbook: String,
    pub ok: bool,
    pub steps: Vec<StepOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl PlaybookReport {
    pub fn step(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.name == name)
    }
}

// ============================================================================
// RUNNER
// ============================================================================

pub struct PlaybookRunner {
    step_timeout: Duration,
}

impl PlaybookRunner {
    pub fn new(step_timeout: Duration) -> Self {
        Self { step_timeout }
    }

    /// Execute a playbook. Artifacts (evaluate results, screenshots) land in
    /// `ctx.artifacts` keyed by step name. The cancellation token in `ctx` is
    /// checked between steps.
    #[instrument(skip(self, playbook, browser, ctx), fields(playbook = %playbook.name))]
    pub async fn run(
        &self,
        playbook: &Playbook,
        browser: &dyn BrowserDriver,
        ctx: &RunContext,
    ) -> PlaybookReport {
        let mut report = PlaybookReport {
            playbook: playbook.name.clone(),
            ok: true,
            steps: Vec::new(),
            failure: None,
        };

        // Preconditions may navigate; any failure aborts before the steps.
        for step in &playbook.preconditions {
            let outcome = self.run_step(step, browser, ctx).await;
            let failed = outcome.status == StepStatus::Failed;
            report.steps.push(outcome);
            if failed {
                report.ok = false;
                report.failure = Some(format!("precondition '{}' failed", step.name));
                return report;
            }
        }

        let mut aborted = false;
        for (index, step) in playbook.steps.iter().enumerate() {
            if ctx.is_cancelled() {
                report.ok = false;
                report.failure = Some("cancelled".to_string());
                self.skip_rest(&playbook.steps[index..], &mut report);
                return report;
            }
            if aborted {
                report.steps.push(StepOutcome {
                    name: step.name.clone(),
                    status: StepStatus::Skipped,
                    error: None,
                    attempts: 0,
                });
                continue;
            }

            let outcome = self.run_step(step, browser, ctx).await;
            let failed = outcome.status == StepStatus::Failed;
            report.steps.push(outcome);

            if failed {
                match step.on_failure {
                    OnFailure::Continue => {}
                    // Retry exhausts inside run_step, then falls back to abort.
                    OnFailure::Abort | OnFailure::Retry(_) => {
                        report.ok = false;
                        report.failure = Some(format!("step '{}' failed", step.name));
                        aborted = true;
                    }
                }
            }
        }

        // Postconditions run even after a tolerated failure; they decide the
        // final verdict unless the playbook already aborted.
        if !aborted {
            for step in &playbook.postconditions {
                let outcome = self.run_step(step, browser, ctx).await;
                let failed = outcome.status == StepStatus::Failed;
                report.steps.push(outcome);
                if failed {
                    report.ok = false;
                    report.failure = Some(format!("postcondition '{}' failed", step.name));
                    return report;
                }
            }
        }

        report
    }

    fn skip_rest(&self, steps: &[PlaybookStep], report: &mut PlaybookReport) {
        for step in steps {
            report.steps.push(StepOutcome {
                name: step.name.clone(),
                status: StepStatus::Skipped,
                error: None,
                attempts: 0,
            });
        }
    }

    async fn run_step(
        &self,
        step: &PlaybookStep,
        browser: &dyn BrowserDriver,
        ctx: &RunContext,
    ) -> StepOutcome {
        if let Some(guard) = &step.guard {
            if !self.eval_guard(guard, browser, ctx).await {
                debug!(step = %step.name, "guard false, skipping");
                return StepOutcome {
                    name: step.name.clone(),
                    status: StepStatus::Skipped,
                    error: None,
                    attempts: 0,
                };
            }
        }

        let max_attempts = match step.on_failure {
            OnFailure::Retry(n) => n.max(1) + 1,
            _ => 1,
        };

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.execute_action(step, browser, ctx).await {
                Ok(()) => {
                    return StepOutcome {
                        name: step.name.clone(),
                        status: StepStatus::Ok,
                        error: None,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(step = %step.name, attempt, error = %last_error, "step failed");
                    if attempt < max_attempts && !ctx.is_cancelled() {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }

        StepOutcome {
            name: step.name.clone(),
            status: StepStatus::Failed,
            error: Some(last_error),
            attempts: max_attempts,
        }
    }

    async fn execute_action(
        &self,
        step: &PlaybookStep,
        browser: &dyn BrowserDriver,
        ctx: &RunContext,
    ) -> Result<()> {
        match &step.action {
            StepAction::Navigate { url, wait_until } => {
                browser.navigate(url, *wait_until).await?;
            }
            StepAction::Click { selector } => {
                browser.click(selector, self.step_timeout).await?;
            }
            StepAction::Fill { selector, text } => {
                browser.fill(selector, text, self.step_timeout).await?;
            }
            StepAction::Wait {
                selector,
                duration_ms,
            } => {
                if let Some(selector) = selector {
                    browser
                        .wait_for_selector(selector, self.step_timeout, SelectorState::Visible)
                        .await?;
                } else if let Some(ms) = duration_ms {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                } else {
                    return Err(NervaError::Internal {
                        reason: format!("wait step '{}' has neither selector nor duration", step.name),
                    });
                }
            }
            StepAction::Evaluate { script } => {
                let value = browser.evaluate(script).await?;
                ctx.set_artifact(step.name.clone(), value);
            }
            StepAction::Screenshot { full_page } => {
                let bytes = browser.screenshot(*full_page).await?;
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                ctx.set_artifact(step.name.clone(), Value::String(encoded));
            }
            StepAction::PressKey { key } => {
                browser.press_key(key).await?;
            }
            StepAction::Select { selector, value } => {
                browser.select(selector, value).await?;
            }
        }

        if let Some(selector) = &step.wait_for {
            browser
                .wait_for_selector(selector, self.step_timeout, SelectorState::Visible)
                .await?;
        }

        Ok(())
    }

    fn eval_guard<'a>(
        &'a self,
        guard: &'a Guard,
        browser: &'a dyn BrowserDriver,
        ctx: &'a RunContext,
    ) -> futures::future::BoxFuture<'a, bool> {
        Box::pin(async move {
            if let Some(selector) = &guard.selector_visible {
                let visible = browser
                    .wait_for_selector(selector, GUARD_PROBE_TIMEOUT, SelectorState::Visible)
                    .await
                    .is_ok();
                if !visible {
                    return false;
                }
            }
            if let Some(key) = &guard.artifact_present {
                if ctx.artifact(key).is_none() {
                    return false;
                }
            }
            if let Some(inner) = &guard.not {
                if self.eval_guard(inner, browser, ctx).await {
                    return false;
                }
            }
            true
        })
    }
}
