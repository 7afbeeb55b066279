//! Free-form skill - direct LLM answer, the routing fallback

use serde_json::json;

use super::{Skill, SkillDeps};
use crate::dag::Dag;
use crate::dispatch::TaskContext;
use crate::error::Result;
use crate::llm::{ChatMessage, LlmOptions};

const SYSTEM_PROMPT: &str =
    "You are a concise local assistant. Answer in at most three sentences.";

pub struct FreeFormSkill {
    deps: SkillDeps,
}

impl FreeFormSkill {
    pub fn new(deps: SkillDeps) -> Self {
        Self { deps }
    }
}

impl Skill for FreeFormSkill {
    fn name(&self) -> &'static str {
        super::FREE_FORM
    }

    fn description(&self) -> &'static str {
        "Answer directly from the language model, no tools"
    }

    fn keywords(&self) -> &'static [&'static str] {
        // Fallback skill: reached through the router, never by keyword.
        &[]
    }

    fn build_dag(&self, _task: &TaskContext) -> Result<Dag> {
        let deps = self.deps.clone();

        Dag::builder("free_form")
            .node("answer", &[], move |ctx| {
                let deps = deps.clone();
                async move {
                    let utterance = ctx.input_str("utterance").unwrap_or_default();
                    let reply = deps
                        .text_llm
                        .chat(
                            &[
                                ChatMessage::system(SYSTEM_PROMPT),
                                ChatMessage::user(utterance),
                            ],
                            &LlmOptions::default(),
                        )
                        .await?;
                    let text = reply.trim().to_string();
                    ctx.set_output("summary", json!(text));
                    ctx.set_output("answer", json!(text));
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

    #[tokio::test]
    async fn answers_with_summary_and_answer() {
        let deps = SkillDeps::offline(NervaConfig::default());
        let skill = FreeFormSkill::new(deps);
        let dag = skill.build_dag(&TaskContext::text("hello")).unwrap();

        let mut inputs = BTreeMap::new();
        inputs.insert("utterance".to_string(), json!("hello"));
        let ctx = dag.execute(Arc::new(RunContext::with_inputs(inputs))).await;

        assert_eq!(ctx.node_status("answer"), NodeStatus::Ok);
        assert_eq!(ctx.output("summary"), ctx.output("answer"));
    }
}
