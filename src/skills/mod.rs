//! Skill registry
//!
//! A skill is a named capability with keyword rules for routing and a
//! `build_dag` factory producing the workflow the dispatcher executes. All
//! collaborators a skill might need (LLMs, browser launcher, stores, config)
//! come in one [`SkillDeps`] bundle so skills stay thin.

mod calendar;
mod daily_ops;
mod drive;
mod free_form;
mod generic;
mod lookup;
mod mail;
mod repo_query;
mod research;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::json;

use crate::browser::{BrowserConfig, BrowserLauncher, MockBrowser, MockLauncher};
use crate::config::NervaConfig;
use crate::context::RunContext;
use crate::dag::Dag;
use crate::dispatch::TaskContext;
use crate::error::{NervaError, Result};
use crate::graph::KnowledgeGraph;
use crate::llm::mock::{MockTextLlm, MockVisionLlm};
use crate::llm::{TextLlm, VisionLlm};
use crate::memory::MemoryStore;
use crate::playbook::{Playbook, PlaybookReport, PlaybookRunner, StepStatus};
use crate::threads::ThreadStore;
use crate::vision::{VisionAgent, VisionAgentConfig, VisionOutcome, VisionStatus};

/// Name of the fallback skill every unroutable request lands on
pub const FREE_FORM: &str = "free_form";

/// Collaborators shared by all skills
#[derive(Clone)]
pub struct SkillDeps {
    pub config: NervaConfig,
    pub text_llm: Arc<dyn TextLlm>,
    pub vision_llm: Arc<dyn VisionLlm>,
    pub browser: Arc<dyn BrowserLauncher>,
    pub memory: MemoryStore,
    pub threads: ThreadStore,
    pub graph: KnowledgeGraph,
}

impl SkillDeps {
    /// Fully mocked bundle: scripted LLMs and browser, fresh stores.
    /// Used by tests and `--offline` runs.
    pub fn offline(config: NervaConfig) -> Self {
        Self {
            config,
            text_llm: Arc::new(MockTextLlm::new()),
            vision_llm: Arc::new(MockVisionLlm::new()),
            browser: Arc::new(MockLauncher::new(MockBrowser::new())),
            memory: MemoryStore::new(),
            threads: ThreadStore::new(),
            graph: KnowledgeGraph::new(),
        }
    }

    /// Production bundle: router-backed LLMs, the given launcher, fresh stores.
    pub fn production(config: NervaConfig, browser: Arc<dyn BrowserLauncher>) -> Self {
        let text_llm = crate::llm::create_text_llm(&config);
        let vision_llm = crate::llm::create_vision_llm(&config);
        Self {
            config,
            text_llm,
            vision_llm,
            browser,
            memory: MemoryStore::new(),
            threads: ThreadStore::new(),
            graph: KnowledgeGraph::new(),
        }
    }
}

/// A named capability with routing rules and a DAG factory
pub trait Skill: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-liner shown to the router LLM
    fn description(&self) -> &'static str;

    /// Case-insensitive regex rules; any match routes here deterministically
    fn keywords(&self) -> &'static [&'static str];

    fn build_dag(&self, task: &TaskContext) -> Result<Dag>;
}

/// Name-keyed skill collection
#[derive(Clone, Default)]
pub struct SkillRegistry {
    skills: Vec<Arc<dyn Skill>>,
    by_name: FxHashMap<&'static str, usize>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        self.by_name.insert(skill.name(), self.skills.len());
        self.skills.push(skill);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Skill>> {
        self.by_name.get(name).map(|&i| &self.skills[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Skill>> {
        self.skills.iter()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

/// The nine built-in skills wired to one dependency bundle.
pub fn default_registry(deps: &SkillDeps) -> SkillRegistry {
    let mut registry = SkillRegistry::new();
    registry.register(Arc::new(calendar::CalendarSkill::new(deps.clone())));
    registry.register(Arc::new(mail::MailSkill::new(deps.clone())));
    registry.register(Arc::new(drive::DriveSkill::new(deps.clone())));
    registry.register(Arc::new(lookup::LookupSkill::new(deps.clone())));
    registry.register(Arc::new(research::ResearchSkill::new(deps.clone())));
    registry.register(Arc::new(generic::GenericBrowserSkill::new(deps.clone())));
    registry.register(Arc::new(free_form::FreeFormSkill::new(deps.clone())));
    registry.register(Arc::new(daily_ops::DailyOpsSkill::new(deps.clone())));
    registry.register(Arc::new(repo_query::RepoQuerySkill::new(deps.clone())));
    registry
}

#[cfg(test)]
pub fn test_registry() -> SkillRegistry {
    default_registry(&SkillDeps::offline(NervaConfig::default()))
}

// ============================================================================
// SHARED SKILL PLUMBING
// ============================================================================

/// Launch a browser, run an embedded playbook document, close the browser.
/// The report always lands in `ctx.artifacts["<name>_report"]`; a failed
/// playbook surfaces as an error so the node is marked failed.
pub(crate) async fn run_playbook_yaml(
    deps: &SkillDeps,
    yaml: &str,
    ctx: &RunContext,
) -> Result<PlaybookReport> {
    let playbook = Playbook::from_yaml(yaml)?;
    let browser = deps.browser.launch(&BrowserConfig {
        headless: true,
        user_data_dir: None,
    })?;

    let runner = PlaybookRunner::new(deps.config.playbook_step_timeout());
    let report = runner.run(&playbook, browser.as_ref(), ctx).await;
    let _ = browser.close().await;

    ctx.set_artifact(format!("{}_report", playbook.name), json!(report));

    if ctx.is_cancelled() {
        return Err(NervaError::Cancelled);
    }
    if !report.ok {
        let step = report
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Failed)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "-".to_string());
        return Err(NervaError::PlaybookFailed {
            playbook: playbook.name.clone(),
            step,
            reason: report.failure.clone().unwrap_or_else(|| "failed".to_string()),
        });
    }
    Ok(report)
}

/// Launch a browser, run the vision-action loop, close the browser.
/// `Incomplete` is not an error (the budget simply ran out); a failed loop is.
pub(crate) async fn run_vision(
    deps: &SkillDeps,
    config: VisionAgentConfig,
    objective: &str,
    ctx: &RunContext,
) -> Result<VisionOutcome> {
    let browser = deps.browser.launch(&BrowserConfig {
        headless: true,
        user_data_dir: None,
    })?;

    let agent = VisionAgent::new(deps.vision_llm.clone(), config);
    let outcome = agent.run(objective, browser.as_ref(), ctx).await;
    let _ = browser.close().await;

    match outcome.status {
        VisionStatus::Failed if outcome.reason.as_deref() == Some("cancelled") => {
            Err(NervaError::Cancelled)
        }
        VisionStatus::Failed => Err(NervaError::Browser {
            reason: outcome
                .reason
                .clone()
                .unwrap_or_else(|| "vision loop failed".to_string()),
        }),
        _ => Ok(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_all_nine_skills() {
        let registry = test_registry();
        assert_eq!(registry.len(), 9);
        for name in [
            "calendar",
            "mail",
            "drive",
            "lookup",
            "research",
            "generic_browser",
            FREE_FORM,
            "daily_ops",
            "repo_query",
        ] {
            assert!(registry.get(name).is_some(), "missing skill {}", name);
        }
    }

    #[test]
    fn lookup_by_unknown_name_is_none() {
        assert!(test_registry().get("nope").is_none());
    }
}
