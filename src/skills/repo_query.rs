//! Repo-query skill - answer questions from remembered repository insights
//!
//! Pulls prior `RepoInsight` memory items and knowledge-graph neighbors of
//! any repo entities they mention, then asks the text LLM to answer from
//! that context only. The exchange itself is remembered as `QAndA`.

use serde_json::json;

use super::{Skill, SkillDeps};
use crate::dag::Dag;
use crate::dispatch::TaskContext;
use crate::error::Result;
use crate::llm::{ChatMessage, LlmOptions};
use crate::memory::{MemoryItem, MemoryKind};

/// How many memory hits feed the answer
const RECALL_LIMIT: usize = 8;

pub struct RepoQuerySkill {
    deps: SkillDeps,
}

impl RepoQuerySkill {
    pub fn new(deps: SkillDeps) -> Self {
        Self { deps }
    }
}

impl Skill for RepoQuerySkill {
    fn name(&self) -> &'static str {
        "repo_query"
    }

    fn description(&self) -> &'static str {
        "Answer questions about known repositories from remembered insights"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &[r"\brepo\b", r"\brepository\b", r"\bcodebase\b"]
    }

    fn build_dag(&self, _task: &TaskContext) -> Result<Dag> {
        let recall_deps = self.deps.clone();
        let answer_deps = self.deps.clone();
        let record_deps = self.deps.clone();

        Dag::builder("repo_query")
            .node("recall", &[], move |ctx| {
                let deps = recall_deps.clone();
                async move {
                    let question = ctx.input_str("utterance").unwrap_or_default();
                    let hits =
                        deps.memory
                            .search(&question, Some(MemoryKind::RepoInsight), None, RECALL_LIMIT);

                    let mut context_lines: Vec<String> =
                        hits.iter().map(|i| format!("- {}", i.text)).collect();

                    // Pull in graph neighborhood of any repo entity the hits
                    // reference in their tags.
                    for item in &hits {
                        for tag in &item.tags {
                            if let Some(repo) = tag.strip_prefix("repo:") {
                                for entity in deps.graph.related(&format!("repo:{}", repo), 1) {
                                    context_lines.push(format!(
                                        "- related entity {} ({})",
                                        entity.id, entity.kind
                                    ));
                                }
                            }
                        }
                    }

                    ctx.set_artifact("recall", json!(context_lines.join("\n")));
                    Ok(())
                }
            })
            .node("answer", &["recall"], move |ctx| {
                let deps = answer_deps.clone();
                async move {
                    let question = ctx.input_str("utterance").unwrap_or_default();
                    let recalled = ctx
                        .artifact("recall")
                        .and_then(|v| v.as_str().map(|s| s.to_string()))
                        .unwrap_or_default();

                    let prompt = if recalled.trim().is_empty() {
                        format!(
                            "Question about a repository: {}\n\nNo stored insights match. \
                             Say so and suggest what to look at first.",
                            question
                        )
                    } else {
                        format!(
                            "Answer from these stored repository insights only:\n{}\n\n\
                             Question: {}",
                            recalled, question
                        )
                    };

                    let reply = deps
                        .text_llm
                        .chat(&[ChatMessage::user(prompt)], &LlmOptions::default())
                        .await?;
                    let text = reply.trim().to_string();
                    ctx.set_output("answer", json!(text));
                    ctx.set_output("summary", json!(text));
                    Ok(())
                }
            })
            .node("record", &["answer"], move |ctx| {
                let deps = record_deps.clone();
                async move {
                    let question = ctx.input_str("utterance").unwrap_or_default();
                    let answer = ctx
                        .output("answer")
                        .and_then(|v| v.as_str().map(|s| s.to_string()))
                        .unwrap_or_default();
                    deps.memory.add(
                        MemoryItem::new(MemoryKind::QAndA, format!("Q: {} A: {}", question, answer))
                            .with_tags(["repo_query"]),
                    );
                    Ok(())
                }
            })
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NervaConfig;
    use crate::context::{NodeStatus, RunContext};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn ctx_for(question: &str) -> Arc<RunContext> {
        let mut inputs = BTreeMap::new();
        inputs.insert("utterance".to_string(), json!(question));
        Arc::new(RunContext::with_inputs(inputs))
    }

    #[tokio::test]
    async fn recall_feeds_answer_and_records_qanda() {
        let deps = SkillDeps::offline(NervaConfig::default());
        deps.memory.add(
            MemoryItem::new(
                MemoryKind::RepoInsight,
                "the ingest repo uses a worker pool sized by cpu count",
            )
            .with_tags(["repo:ingest"]),
        );
        let memory = deps.memory.clone();

        let skill = RepoQuerySkill::new(deps);
        let dag = skill
            .build_dag(&TaskContext::text("how does the ingest repo scale workers"))
            .unwrap();
        let ctx = dag
            .execute(ctx_for("how does the ingest repo scale workers"))
            .await;

        assert_eq!(ctx.node_status("record"), NodeStatus::Ok);
        let recalled = ctx.artifact("recall").unwrap();
        assert!(recalled.as_str().unwrap().contains("worker pool"));
        assert_eq!(memory.list_by_kind(MemoryKind::QAndA, 10).len(), 1);
    }

    #[tokio::test]
    async fn empty_recall_still_answers() {
        let deps = SkillDeps::offline(NervaConfig::default());
        let skill = RepoQuerySkill::new(deps);
        let dag = skill
            .build_dag(&TaskContext::text("what does the foo repo do"))
            .unwrap();
        let ctx = dag.execute(ctx_for("what does the foo repo do")).await;

        assert_eq!(ctx.node_status("answer"), NodeStatus::Ok);
        assert!(ctx.output("summary").is_some());
    }
}
