//! Vision-action agent
//!
//! Completes loosely-specified browser tasks when no deterministic playbook
//! exists: screenshot → vision LLM → one action, repeated until the model
//! reports completion or the step budget runs out.
//!
//! Responses used as control signals go through the strict → lenient →
//! retry-with-clarifier ladder; a second parse failure is a recorded step
//! failure, not an abort. Browser exceptions are likewise recorded and the
//! loop continues — the next screenshot shows the model the real page state,
//! so the loop self-corrects. Only a blocked navigation reported by the
//! driver ends the run as failed.
//!
//! The agent never executes shell commands and only navigates to http/https
//! URLs; anything else is refused and recorded.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::browser::{BrowserDriver, WaitUntil};
use crate::context::RunContext;
use crate::error::NervaError;
use crate::llm::{extract_json, LlmOptions, VisionLlm, STRICT_JSON_CLARIFIER};

/// Default step budget
pub const DEFAULT_MAX_STEPS: u32 = 20;
/// Default pause for `wait` actions
const DEFAULT_WAIT: Duration = Duration::from_millis(1000);

/// One action chosen by the vision model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionAction {
    pub kind: VisionActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisionActionKind {
    Click,
    Type,
    Scroll,
    Navigate,
    Wait,
    Complete,
}

/// How one loop iteration ended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionStep {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<VisionAction>,
    pub outcome: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisionStatus {
    Ok,
    Incomplete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionOutcome {
    pub status: VisionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub history: Vec<VisionStep>,
    pub browser_actions: u32,
}

#[derive(Debug, Clone)]
pub struct VisionAgentConfig {
    pub max_steps: u32,
    /// Re-screenshot after each action and ask the model whether it took
    /// effect. A failed verification is informational only.
    pub verify_actions: bool,
    pub starting_url: Option<String>,
}

impl Default for VisionAgentConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            verify_actions: false,
            starting_url: None,
        }
    }
}

pub struct VisionAgent {
    vision: Arc<dyn VisionLlm>,
    config: VisionAgentConfig,
}

impl VisionAgent {
    pub fn new(vision: Arc<dyn VisionLlm>, config: VisionAgentConfig) -> Self {
        Self { vision, config }
    }

    /// Run the perception-action loop for `task`. Screenshots are stored as
    /// base64 artifacts (`screenshot_1`, `screenshot_2`, …) on the context.
    #[instrument(skip(self, browser, ctx), fields(max_steps = self.config.max_steps))]
    pub async fn run(
        &self,
        task: &str,
        browser: &dyn BrowserDriver,
        ctx: &RunContext,
    ) -> VisionOutcome {
        let mut history: Vec<VisionStep> = Vec::new();
        let mut browser_actions = 0u32;
        let mut last_screenshot: Option<Vec<u8>> = None;

        if self.config.max_steps == 0 {
            return VisionOutcome {
                status: VisionStatus::Incomplete,
                answer: None,
                reason: Some("step budget is zero".to_string()),
                history,
                browser_actions,
            };
        }

        if let Some(url) = &self.config.starting_url {
            match self.navigate_checked(browser, url).await {
                Ok(()) => browser_actions += 1,
                Err(e @ NervaError::NavigationBlocked { .. }) => {
                    return self.failed(e.to_string(), history, browser_actions);
                }
                Err(e) => {
                    history.push(VisionStep {
                        index: 0,
                        action: None,
                        outcome: format!("initial navigation failed: {}", e),
                    });
                }
            }
        }

        for step in 1..=self.config.max_steps {
            if ctx.is_cancelled() {
                return self.failed("cancelled".to_string(), history, browser_actions);
            }

            // 1. Perceive
            let screenshot = match browser.screenshot(false).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    history.push(VisionStep {
                        index: step,
                        action: None,
                        outcome: format!("screenshot failed: {}", e),
                    });
                    continue;
                }
            };
            ctx.set_artifact(
                format!("screenshot_{}", step),
                Value::String(base64::engine::general_purpose::STANDARD.encode(&screenshot)),
            );
            last_screenshot = Some(screenshot.clone());

            // 2. Reason
            let action = match self.decide(task, &history, &screenshot).await {
                Ok(action) => action,
                Err(e) => {
                    history.push(VisionStep {
                        index: step,
                        action: None,
                        outcome: format!("unparseable model response: {}", e),
                    });
                    continue;
                }
            };

            debug!(step, kind = ?action.kind, "vision action");

            // 3. Act (or finish)
            if action.kind == VisionActionKind::Complete {
                let answer = self.final_qa(task, last_screenshot.as_deref()).await;
                history.push(VisionStep {
                    index: step,
                    action: Some(action),
                    outcome: "complete".to_string(),
                });
                ctx.set_artifact("vision_history", json!(history));
                return VisionOutcome {
                    status: VisionStatus::Ok,
                    answer,
                    reason: None,
                    history,
                    browser_actions,
                };
            }

            match self.execute(browser, &action).await {
                Ok(()) => {
                    browser_actions += 1;
                    history.push(VisionStep {
                        index: step,
                        action: Some(action.clone()),
                        outcome: "ok".to_string(),
                    });
                }
                Err(e @ NervaError::NavigationBlocked { .. }) => {
                    // Scheme refusals are recorded and the loop continues;
                    // only the driver reporting a blocked page is fatal.
                    if action.kind == VisionActionKind::Navigate
                        && action.url.as_deref().is_some_and(|u| !allowed_url(u))
                    {
                        history.push(VisionStep {
                            index: step,
                            action: Some(action.clone()),
                            outcome: format!("refused: {}", e),
                        });
                    } else {
                        history.push(VisionStep {
                            index: step,
                            action: Some(action.clone()),
                            outcome: format!("failed: {}", e),
                        });
                        ctx.set_artifact("vision_history", json!(history));
                        return self.failed(e.to_string(), history, browser_actions);
                    }
                }
                Err(e) => {
                    warn!(step, error = %e, "browser action failed");
                    history.push(VisionStep {
                        index: step,
                        action: Some(action.clone()),
                        outcome: format!("failed: {}", e),
                    });
                }
            }

            // 4. Optionally verify
            if self.config.verify_actions {
                if let Some(note) = self.verify(task, &action, browser).await {
                    history.push(VisionStep {
                        index: step,
                        action: None,
                        outcome: note,
                    });
                }
            }
        }

        ctx.set_artifact("vision_history", json!(history));
        VisionOutcome {
            status: VisionStatus::Incomplete,
            answer: None,
            reason: Some(format!(
                "step budget of {} exhausted",
                self.config.max_steps
            )),
            history,
            browser_actions,
        }
    }

    fn failed(
        &self,
        reason: String,
        history: Vec<VisionStep>,
        browser_actions: u32,
    ) -> VisionOutcome {
        VisionOutcome {
            status: VisionStatus::Failed,
            answer: None,
            reason: Some(reason),
            history,
            browser_actions,
        }
    }

    /// Ask the model for the next action; one strict-JSON retry before
    /// giving up.
    async fn decide(
        &self,
        task: &str,
        history: &[VisionStep],
        screenshot: &[u8],
    ) -> crate::error::Result<VisionAction> {
        let prompt = action_prompt(task, history);
        let options = LlmOptions::default();

        let first = self.vision.analyze(screenshot, &prompt, &options).await?;
        if let Some(action) = parse_action(&first) {
            return Ok(action);
        }

        let retry_prompt = format!("{}\n\n{}", prompt, STRICT_JSON_CLARIFIER);
        let second = self
            .vision
            .analyze(screenshot, &retry_prompt, &options)
            .await?;
        parse_action(&second).ok_or_else(|| NervaError::BadResponse {
            snippet: crate::llm::snippet(&second),
        })
    }

    async fn execute(
        &self,
        browser: &dyn BrowserDriver,
        action: &VisionAction,
    ) -> crate::error::Result<()> {
        match action.kind {
            VisionActionKind::Click => {
                let target = action.target_description.as_deref().unwrap_or("body");
                browser.click(target, Duration::from_secs(10)).await
            }
            VisionActionKind::Type => {
                let text = action.text.as_deref().unwrap_or_default();
                let target = action.target_description.as_deref().unwrap_or("input:focus");
                browser.fill(target, text, Duration::from_secs(10)).await
            }
            VisionActionKind::Scroll => {
                browser
                    .evaluate("window.scrollBy(0, Math.round(window.innerHeight * 0.8))")
                    .await
                    .map(|_| ())
            }
            VisionActionKind::Navigate => {
                let url = action.url.as_deref().unwrap_or_default();
                self.navigate_checked(browser, url).await
            }
            VisionActionKind::Wait => {
                let ms = action.duration_ms.map(Duration::from_millis);
                tokio::time::sleep(ms.unwrap_or(DEFAULT_WAIT)).await;
                Ok(())
            }
            VisionActionKind::Complete => Ok(()),
        }
    }

    async fn navigate_checked(
        &self,
        browser: &dyn BrowserDriver,
        url: &str,
    ) -> crate::error::Result<()> {
        if !allowed_url(url) {
            return Err(NervaError::NavigationBlocked {
                url: url.to_string(),
                reason: "scheme not allowed".to_string(),
            });
        }
        browser.navigate(url, WaitUntil::DomContentLoaded).await
    }

    /// Post-action check; returns a note only when verification fails.
    async fn verify(
        &self,
        task: &str,
        action: &VisionAction,
        browser: &dyn BrowserDriver,
    ) -> Option<String> {
        let screenshot = browser.screenshot(false).await.ok()?;
        let prompt = format!(
            "Task: {}\nThe previous action was: {:?} ({}). \
             Did it visibly take effect? Answer only YES or NO.",
            task, action.kind, action.rationale
        );
        let reply = self
            .vision
            .analyze(&screenshot, &prompt, &LlmOptions::default())
            .await
            .ok()?;
        if reply.trim().to_uppercase().starts_with("NO") {
            Some("verification_failed".to_string())
        } else {
            None
        }
    }

    /// Final QA over the last screenshot.
    async fn final_qa(&self, task: &str, screenshot: Option<&[u8]>) -> Option<String> {
        let screenshot = screenshot?;
        let prompt = format!(
            "Task: {}\nAnswer the user's question in one sentence based on this \
             screenshot, or respond NO_ANSWER.",
            task
        );
        let reply = self
            .vision
            .analyze(screenshot, &prompt, &LlmOptions::default())
            .await
            .ok()?;
        let trimmed = reply.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("NO_ANSWER") {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Only http/https navigation is permitted.
pub fn allowed_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(url) => matches!(url.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

fn parse_action(text: &str) -> Option<VisionAction> {
    let value = extract_json(text)?;
    serde_json::from_value(value).ok()
}

fn action_prompt(task: &str, history: &[VisionStep]) -> String {
    let mut prompt = format!(
        "You are operating a web browser to complete this task:\n{}\n\n",
        task
    );

    let rationales: Vec<String> = history
        .iter()
        .filter_map(|s| s.action.as_ref())
        .filter(|a| !a.rationale.is_empty())
        .map(|a| format!("- {:?}: {}", a.kind, a.rationale))
        .collect();
    if !rationales.is_empty() {
        prompt.push_str("Previous actions:\n");
        prompt.push_str(&rationales.join("\n"));
        prompt.push_str("\n\n");
    }

    prompt.push_str(
        "Look at the screenshot and choose exactly one next action. Respond with \
         a single JSON object:\n\
         {\"kind\": \"click|type|scroll|navigate|wait|complete\", \
         \"target_description\": \"CSS selector or visible label\", \
         \"text\": \"text to type\", \"url\": \"https://…\", \
         \"duration_ms\": 1000, \"rationale\": \"why\"}\n\
         Omit fields that do not apply. Use \"complete\" once the task is done.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserAction, MockBrowser};
    use crate::llm::mock::MockVisionLlm;

    fn agent(vision: MockVisionLlm, config: VisionAgentConfig) -> VisionAgent {
        VisionAgent::new(Arc::new(vision), config)
    }

    #[tokio::test]
    async fn zero_budget_never_calls_the_model() {
        let vision = MockVisionLlm::new();
        let agent = agent(
            vision.clone(),
            VisionAgentConfig {
                max_steps: 0,
                ..Default::default()
            },
        );

        let browser = MockBrowser::new();
        let outcome = agent.run("anything", &browser, &RunContext::new()).await;

        assert_eq!(outcome.status, VisionStatus::Incomplete);
        assert_eq!(vision.prompt_count(), 0);
        assert!(browser.actions().is_empty());
    }

    #[tokio::test]
    async fn completes_with_answer() {
        let vision = MockVisionLlm::with_responses([
            r#"{"kind": "navigate", "url": "https://target.example", "rationale": "open store page"}"#,
            r##"{"kind": "click", "target_description": "#store-info", "rationale": "open info"}"##,
            r#"{"kind": "complete", "rationale": "phone number visible"}"#,
            "555-1212",
        ]);

        let agent = agent(vision, VisionAgentConfig::default());
        let browser = MockBrowser::new();
        let ctx = RunContext::new();
        let outcome = agent.run("find phone for X", &browser, &ctx).await;

        assert_eq!(outcome.status, VisionStatus::Ok);
        assert_eq!(outcome.answer.as_deref(), Some("555-1212"));
        assert_eq!(outcome.browser_actions, 2);
        assert!(ctx.artifact("screenshot_1").is_some());
    }

    #[tokio::test]
    async fn no_answer_sentinel_maps_to_none() {
        let vision = MockVisionLlm::with_responses([
            r#"{"kind": "complete", "rationale": "done"}"#,
            "NO_ANSWER",
        ]);
        let agent = agent(vision, VisionAgentConfig::default());
        let outcome = agent
            .run("do a thing", &MockBrowser::new(), &RunContext::new())
            .await;
        assert_eq!(outcome.status, VisionStatus::Ok);
        assert_eq!(outcome.answer, None);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_incomplete() {
        let vision = MockVisionLlm::with_responses([
            r#"{"kind": "scroll", "rationale": "look"}"#,
            r#"{"kind": "scroll", "rationale": "look more"}"#,
        ]);
        let agent = agent(
            vision,
            VisionAgentConfig {
                max_steps: 2,
                ..Default::default()
            },
        );
        let outcome = agent
            .run("endless", &MockBrowser::new(), &RunContext::new())
            .await;
        assert_eq!(outcome.status, VisionStatus::Incomplete);
        assert_eq!(outcome.history.len(), 2);
    }

    #[tokio::test]
    async fn unparseable_response_retries_then_records_failure() {
        let vision = MockVisionLlm::with_responses([
            "I would click the button", // strict fail
            "still prose",              // clarified retry fails
            r#"{"kind": "complete", "rationale": "ok"}"#,
            "done",
        ]);
        let agent = agent(
            vision.clone(),
            VisionAgentConfig {
                max_steps: 3,
                ..Default::default()
            },
        );
        let outcome = agent
            .run("task", &MockBrowser::new(), &RunContext::new())
            .await;

        assert_eq!(outcome.status, VisionStatus::Ok);
        assert!(outcome.history[0].outcome.contains("unparseable"));
        // Clarifier reached the model on the retry.
        assert!(vision.prompts()[1].contains("strict JSON"));
    }

    #[tokio::test]
    async fn browser_errors_do_not_abort_loop() {
        let vision = MockVisionLlm::with_responses([
            r##"{"kind": "click", "target_description": "#gone", "rationale": "try"}"##,
            r#"{"kind": "complete", "rationale": "give up"}"#,
            "NO_ANSWER",
        ]);
        let agent = agent(vision, VisionAgentConfig::default());
        let browser = MockBrowser::new();
        browser.fail_selector("#gone");

        let outcome = agent.run("task", &browser, &RunContext::new()).await;
        assert_eq!(outcome.status, VisionStatus::Ok);
        assert!(outcome.history[0].outcome.starts_with("failed:"));
    }

    #[tokio::test]
    async fn file_url_is_refused_but_loop_continues() {
        let vision = MockVisionLlm::with_responses([
            r#"{"kind": "navigate", "url": "file:///etc/passwd", "rationale": "peek"}"#,
            r#"{"kind": "complete", "rationale": "stop"}"#,
            "NO_ANSWER",
        ]);
        let agent = agent(vision, VisionAgentConfig::default());
        let browser = MockBrowser::new();

        let outcome = agent.run("task", &browser, &RunContext::new()).await;
        assert_eq!(outcome.status, VisionStatus::Ok);
        assert!(outcome.history[0].outcome.starts_with("refused:"));
        // The browser never saw the navigation.
        assert!(!browser
            .actions()
            .iter()
            .any(|a| matches!(a, BrowserAction::Navigate(_))));
    }

    #[tokio::test]
    async fn blocked_navigation_from_driver_is_fatal() {
        let vision = MockVisionLlm::with_responses([
            r#"{"kind": "navigate", "url": "https://blocked.example", "rationale": "go"}"#,
        ]);
        let agent = agent(vision, VisionAgentConfig::default());
        let browser = MockBrowser::new();
        browser.block_navigation();

        let outcome = agent.run("task", &browser, &RunContext::new()).await;
        assert_eq!(outcome.status, VisionStatus::Failed);
    }

    #[tokio::test]
    async fn verification_note_recorded_on_no() {
        let vision = MockVisionLlm::with_responses([
            r##"{"kind": "click", "target_description": "#btn", "rationale": "press"}"##,
            "NO", // verification
            r#"{"kind": "complete", "rationale": "done"}"#,
            "answer",
        ]);
        let agent = agent(
            vision,
            VisionAgentConfig {
                verify_actions: true,
                ..Default::default()
            },
        );
        let outcome = agent
            .run("task", &MockBrowser::new(), &RunContext::new())
            .await;

        assert_eq!(outcome.status, VisionStatus::Ok);
        assert!(outcome
            .history
            .iter()
            .any(|s| s.outcome == "verification_failed"));
    }

    #[tokio::test]
    async fn cancellation_fails_with_reason() {
        let ctx = RunContext::new();
        ctx.cancel_token().cancel();

        let agent = agent(MockVisionLlm::new(), VisionAgentConfig::default());
        let outcome = agent.run("task", &MockBrowser::new(), &ctx).await;
        assert_eq!(outcome.status, VisionStatus::Failed);
        assert_eq!(outcome.reason.as_deref(), Some("cancelled"));
    }

    #[test]
    fn url_allow_list() {
        assert!(allowed_url("https://example.com"));
        assert!(allowed_url("http://localhost:8080/x"));
        assert!(!allowed_url("file:///etc/passwd"));
        assert!(!allowed_url("about:blank"));
        assert!(!allowed_url("javascript:alert(1)"));
        assert!(!allowed_url("not a url"));
    }

    #[test]
    fn action_json_round_trip() {
        let action = VisionAction {
            kind: VisionActionKind::Navigate,
            target_description: None,
            text: None,
            url: Some("https://example.com".into()),
            duration_ms: None,
            rationale: "open".into(),
        };
        let text = serde_json::to_string(&action).unwrap();
        let back: VisionAction = serde_json::from_str(&text).unwrap();
        assert_eq!(action, back);
    }
}
