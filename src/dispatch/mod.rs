//! Task dispatcher
//!
//! The single entry point for every trigger: text CLI, voice loop, hotkeys,
//! and ambient timers all synthesize a [`TaskContext`] and call
//! [`Dispatcher::dispatch_with`].
//!
//! Per-request pipeline: safety gate → ambiguity check (at most one
//! clarification turn, through the same channel the request arrived on) →
//! intent routing (keyword rules, then LLM tag) → skill DAG execution under
//! the global concurrency limit and deadline → write-back. Write-back runs on
//! every path: exactly one `TaskResult` memory item, one thread entry
//! referencing it, and one knowledge-graph ingest per call.

pub mod route;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::NervaConfig;
use crate::context::{NodeEvent, NodeStatus, RunContext};
use crate::graph::KnowledgeGraph;
use crate::memory::{MemoryItem, MemoryKind, MemoryStore};
use crate::safety::{SafetyGate, SafetyVerdict, CONFIRM_TOKEN, REFUSAL_MESSAGE};
use crate::skills::{Skill as _, SkillDeps, SkillRegistry, FREE_FORM};
use crate::threads::ThreadStore;

/// Fallback project for requests that name none
const DEFAULT_PROJECT: &str = "general";

// ============================================================================
// REQUEST / RESULT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Text,
    Voice,
    Hotkey,
    Ambient,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Hotkey => "hotkey",
            Self::Ambient => "ambient",
        }
    }
}

/// One incoming request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub utterance: String,
    pub source: Source,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl TaskContext {
    pub fn new(utterance: impl Into<String>, source: Source) -> Self {
        Self {
            utterance: utterance.into(),
            source,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn text(utterance: impl Into<String>) -> Self {
        Self::new(utterance, Source::Text)
    }

    pub fn voice(utterance: impl Into<String>) -> Self {
        Self::new(utterance, Source::Voice)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn project(&self) -> &str {
        self.metadata
            .get("project")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_PROJECT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ok,
    ClarificationNeeded,
    Refused,
    Failed,
}

/// Final outcome handed back to the trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Value>,
    #[serde(default)]
    pub steps: Vec<NodeEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TaskResult {
    /// CLI exit code contract: 0 ok, 2 clarification, 3 refused, 1 failed,
    /// 130 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            TaskStatus::Ok => 0,
            TaskStatus::ClarificationNeeded => 2,
            TaskStatus::Refused => 3,
            TaskStatus::Failed => {
                if self.reason.as_deref() == Some("cancelled") {
                    130
                } else {
                    1
                }
            }
        }
    }
}

// ============================================================================
// CLARIFICATION CHANNEL
// ============================================================================

/// How a clarification question travels back to the requester. Each frontend
/// passes its own implementation, so clarifications always use the channel
/// the request arrived on.
#[async_trait]
pub trait Clarifier: Send + Sync {
    /// Ask and await a single follow-up turn. `None` means the channel
    /// cannot ask (or the user stayed silent).
    async fn ask(&self, question: &str) -> Option<String>;
}

/// Channel that never answers (ambient triggers, plain API calls)
pub struct NoClarifier;

#[async_trait]
impl Clarifier for NoClarifier {
    async fn ask(&self, _question: &str) -> Option<String> {
        None
    }
}

/// Scripted channel for tests: queued replies, recorded questions.
#[derive(Default)]
pub struct ScriptedClarifier {
    replies: parking_lot::Mutex<Vec<Option<String>>>,
    questions: parking_lot::Mutex<Vec<String>>,
}

impl ScriptedClarifier {
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        Self {
            replies: parking_lot::Mutex::new(
                replies.into_iter().map(|r| r.map(Into::into)).collect(),
            ),
            questions: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().clone()
    }
}

#[async_trait]
impl Clarifier for ScriptedClarifier {
    async fn ask(&self, question: &str) -> Option<String> {
        self.questions.lock().push(question.to_string());
        let mut replies = self.replies.lock();
        if replies.is_empty() {
            None
        } else {
            replies.remove(0)
        }
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

pub struct Dispatcher {
    registry: SkillRegistry,
    memory: MemoryStore,
    threads: ThreadStore,
    graph: KnowledgeGraph,
    text_llm: Arc<dyn crate::llm::TextLlm>,
    safety: SafetyGate,
    limiter: Arc<Semaphore>,
    config: NervaConfig,
}

impl Dispatcher {
    pub fn new(deps: &SkillDeps, registry: SkillRegistry) -> Self {
        Self {
            registry,
            memory: deps.memory.clone(),
            threads: deps.threads.clone(),
            graph: deps.graph.clone(),
            text_llm: deps.text_llm.clone(),
            safety: SafetyGate::new(),
            limiter: Arc::new(Semaphore::new(deps.config.max_concurrent_skills.max(1))),
            config: deps.config.clone(),
        }
    }

    pub fn with_safety(mut self, safety: SafetyGate) -> Self {
        self.safety = safety;
        self
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn threads(&self) -> &ThreadStore {
        &self.threads
    }

    pub fn graph(&self) -> &KnowledgeGraph {
        &self.graph
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    /// Dispatch without a clarification channel or external cancellation.
    pub async fn dispatch(&self, task: TaskContext) -> TaskResult {
        self.dispatch_with(task, &NoClarifier, CancellationToken::new())
            .await
    }

    /// Full pipeline. `clarifier` is the requester's own channel; `cancel`
    /// carries the caller's deadline/interrupt.
    #[instrument(skip(self, task, clarifier, cancel), fields(source = task.source.as_str()))]
    pub async fn dispatch_with(
        &self,
        task: TaskContext,
        clarifier: &dyn Clarifier,
        cancel: CancellationToken,
    ) -> TaskResult {
        let mut utterance = task.utterance.trim().to_string();
        info!(utterance = %utterance, "dispatching");

        // ── Safety gate (wins over clarification) ───────────────────────
        if let SafetyVerdict::NeedsConfirmation { matched } = self.safety.assess(&utterance) {
            let pre_confirmed = task
                .metadata
                .get("confirmed")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
                || self.safety.is_confirmation(&utterance);

            if !pre_confirmed {
                let question = format!(
                    "That request looks risky (matched '{}'). Say '{}' to proceed.",
                    matched, CONFIRM_TOKEN
                );
                let confirmed = match clarifier.ask(&question).await {
                    Some(reply) => self.safety.is_confirmation(&reply),
                    None => false,
                };
                if !confirmed {
                    warn!(matched = %matched, "refused unconfirmed risky request");
                    let thread_id =
                        self.write_back(&task, "safety", "refused", REFUSAL_MESSAGE);
                    return TaskResult {
                        status: TaskStatus::Refused,
                        summary: REFUSAL_MESSAGE.to_string(),
                        answer: None,
                        artifacts: BTreeMap::new(),
                        steps: Vec::new(),
                        thread_id: Some(thread_id),
                        reason: Some(format!("matched risky pattern '{}'", matched)),
                    };
                }
            }
        }

        // ── Routing with at most one clarification turn ─────────────────
        // Triggers that already know their skill (CLI subcommands, hotkey
        // bindings) can pin it via metadata and skip the router.
        let forced_skill = task
            .metadata
            .get("skill")
            .and_then(|v| v.as_str())
            .filter(|name| self.registry.get(name).is_some())
            .map(|s| s.to_string());

        let skill_name = match forced_skill {
            Some(name) => name,
            None => match self.resolve_route(&mut utterance, &task, clarifier).await {
                Ok(name) => name,
                Err(result) => return result,
            },
        };

        debug!(skill = %skill_name, "routed");

        // ── Skill invocation under the global limit and deadline ────────
        let permit = tokio::select! {
            permit = self.limiter.clone().acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        };
        if permit.is_none() {
            let thread_id = self.write_back(&task, &skill_name, "failed", "cancelled while queued");
            return TaskResult {
                status: TaskStatus::Failed,
                summary: "cancelled while waiting for a free slot".to_string(),
                answer: None,
                artifacts: BTreeMap::new(),
                steps: Vec::new(),
                thread_id: Some(thread_id),
                reason: Some("cancelled".to_string()),
            };
        }

        let skill = self
            .registry
            .get(&skill_name)
            .or_else(|| self.registry.get(FREE_FORM))
            .expect("free_form skill is always registered");

        let routed_task = TaskContext {
            utterance: utterance.clone(),
            source: task.source,
            metadata: task.metadata.clone(),
        };

        let dag = match skill.build_dag(&routed_task) {
            Ok(dag) => dag,
            Err(e) => {
                let reason = e.to_string();
                let thread_id = self.write_back(&task, &skill_name, "failed", &reason);
                return TaskResult {
                    status: TaskStatus::Failed,
                    summary: reason.clone(),
                    answer: None,
                    artifacts: BTreeMap::new(),
                    steps: Vec::new(),
                    thread_id: Some(thread_id),
                    reason: Some(reason),
                };
            }
        };

        let mut inputs = BTreeMap::new();
        inputs.insert("utterance".to_string(), json!(utterance));
        inputs.insert("source".to_string(), json!(task.source.as_str()));
        inputs.insert(
            "metadata".to_string(),
            Value::Object(task.metadata.clone()),
        );

        let child = cancel.child_token();
        let ctx = Arc::new(RunContext::with_inputs(inputs).with_cancel(child.clone()));

        // Deadline watchdog: cancels the skill, never the caller.
        let deadline = self.config.dispatch_deadline();
        let watchdog = tokio::spawn({
            let child = child.clone();
            async move {
                tokio::time::sleep(deadline).await;
                child.cancel();
            }
        });

        let ctx = dag.execute(ctx).await;
        watchdog.abort();
        drop(permit);

        // ── Outcome mapping ─────────────────────────────────────────────
        let steps = ctx.node_outcomes();
        let any_failed = steps.iter().any(|e| e.status == NodeStatus::Failed);
        let first_error = steps
            .iter()
            .find(|e| e.status == NodeStatus::Failed)
            .and_then(|e| e.error.clone());

        let (status, reason) = if cancel.is_cancelled() {
            (TaskStatus::Failed, Some("cancelled".to_string()))
        } else if child.is_cancelled() {
            (TaskStatus::Failed, Some("deadline exceeded".to_string()))
        } else if any_failed {
            (TaskStatus::Failed, first_error)
        } else {
            (TaskStatus::Ok, None)
        };

        let summary = ctx
            .output("summary")
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| match status {
                TaskStatus::Ok => format!("completed '{}'", skill_name),
                _ => reason.clone().unwrap_or_else(|| "failed".to_string()),
            });
        let answer = ctx
            .output("answer")
            .and_then(|v| v.as_str().map(|s| s.to_string()));

        let status_str = match status {
            TaskStatus::Ok => "ok",
            TaskStatus::Failed => "failed",
            TaskStatus::Refused => "refused",
            TaskStatus::ClarificationNeeded => "clarification_needed",
        };
        let thread_id = self.write_back(&task, &skill_name, status_str, &summary);

        TaskResult {
            status,
            summary,
            answer,
            artifacts: ctx.artifacts_snapshot(),
            steps,
            thread_id: Some(thread_id),
            reason,
        }
    }

    /// Keyword + LLM routing with at most one clarification turn. `utterance`
    /// absorbs the clarifying reply so the skill sees the combined request.
    /// Unresolved ambiguity yields the finished `TaskResult` as the error.
    async fn resolve_route(
        &self,
        utterance: &mut String,
        task: &TaskContext,
        clarifier: &dyn Clarifier,
    ) -> std::result::Result<String, TaskResult> {
        let min_words = self.config.clarify_min_words;

        let candidates =
            match route::route(&self.registry, &self.text_llm, utterance, min_words).await {
                route::Route::Skill(name) => return Ok(name),
                route::Route::Ambiguous { candidates } => candidates,
            };

        let question = if candidates.is_empty() {
            "I'm not sure what you want me to do. Could you say that again with a \
             bit more detail?"
                .to_string()
        } else {
            format!("Did you mean {}?", candidates.join(" or "))
        };

        let Some(reply) = clarifier.ask(&question).await else {
            // No channel or no reply: don't block, answer free-form.
            return Ok(FREE_FORM.to_string());
        };

        // A reply that singles out one of the collided skills resolves the
        // request directly; the original keyword collision would otherwise
        // re-fire on any combined text.
        if !candidates.is_empty() {
            let reply_lower = reply.to_lowercase();
            let named: Vec<&String> = candidates
                .iter()
                .filter(|c| {
                    reply_lower.contains(c.as_str())
                        || route::keyword_matches(&self.registry, &reply).contains(*c)
                })
                .collect();
            if let [chosen] = named.as_slice() {
                return Ok((*chosen).clone());
            }
        }

        let combined = format!("{} {}", utterance, reply.trim());
        match route::route(&self.registry, &self.text_llm, &combined, min_words).await {
            route::Route::Skill(name) => {
                *utterance = combined;
                Ok(name)
            }
            route::Route::Ambiguous { .. } => {
                // One loop through `clarifying` is the budget.
                let thread_id = self.write_back(task, "router", "clarification_needed", &question);
                Err(TaskResult {
                    status: TaskStatus::ClarificationNeeded,
                    summary: question,
                    answer: None,
                    artifacts: BTreeMap::new(),
                    steps: Vec::new(),
                    thread_id: Some(thread_id),
                    reason: None,
                })
            }
        }
    }

    /// Record the call into memory, the project thread, and the knowledge
    /// graph. Runs on every outcome. Returns the thread id.
    fn write_back(
        &self,
        task: &TaskContext,
        skill_name: &str,
        status: &str,
        summary: &str,
    ) -> String {
        let item = MemoryItem::new(
            MemoryKind::TaskResult,
            format!("{} → {}", task.utterance.trim(), summary),
        )
        .with_tags([skill_name, task.source.as_str()])
        .with_metadata("skill", json!(skill_name))
        .with_metadata("status", json!(status))
        .with_metadata("source", json!(task.source.as_str()));
        let mem_id = self.memory.add(item);

        let project = task.project().to_string();
        let thread = self.threads.attach(&project, &project);

        let skill_entity = format!("skill:{}", skill_name);
        self.graph
            .upsert_entity(&skill_entity, "skill", serde_json::Map::new());

        let entry = self.threads.add_entry(
            &thread.thread_id,
            format!("[{}] {}", status, summary),
            vec![mem_id, skill_entity],
        );

        if let Some(entry) = entry {
            self.graph
                .ingest_thread(&thread.thread_id, &thread.title, std::slice::from_ref(&entry));
        }

        thread.thread_id
    }
}
