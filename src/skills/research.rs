//! Research skill - plan, browse, synthesize
//!
//! Multi-step variant of lookup for open-ended questions: the text LLM first
//! narrows the question into a browsing objective, the vision agent gathers
//! material, and a final LLM pass writes the synthesis. Verification is off;
//! the synthesis step reads the whole action history instead.

use serde_json::json;

use super::{run_vision, Skill, SkillDeps};
use crate::dag::Dag;
use crate::dispatch::TaskContext;
use crate::error::Result;
use crate::llm::{ChatMessage, LlmOptions};
use crate::vision::VisionAgentConfig;

pub struct ResearchSkill {
    deps: SkillDeps,
}

impl ResearchSkill {
    pub fn new(deps: SkillDeps) -> Self {
        Self { deps }
    }
}

impl Skill for ResearchSkill {
    fn name(&self) -> &'static str {
        "research"
    }

    fn description(&self) -> &'static str {
        "Investigate an open-ended question across several pages and synthesize findings"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &[r"\bresearch\b", r"\binvestigate\b", r"\bdeep dive\b", r"\bcompare\b"]
    }

    fn build_dag(&self, _task: &TaskContext) -> Result<Dag> {
        let plan_deps = self.deps.clone();
        let browse_deps = self.deps.clone();
        let synth_deps = self.deps.clone();

        Dag::builder("research")
            .node("plan", &[], move |ctx| {
                let deps = plan_deps.clone();
                async move {
                    let question = ctx.input_str("utterance").unwrap_or_default();
                    let prompt = format!(
                        "Turn this research question into one concrete browsing \
                         objective (a single sentence starting with a verb):\n{}",
                        question
                    );
                    let objective = deps
                        .text_llm
                        .chat(&[ChatMessage::user(prompt)], &LlmOptions::default())
                        .await?;
                    ctx.set_artifact("objective", json!(objective.trim()));
                    Ok(())
                }
            })
            .node("browse", &["plan"], move |ctx| {
                let deps = browse_deps.clone();
                async move {
                    let objective = ctx
                        .artifact("objective")
                        .and_then(|v| v.as_str().map(|s| s.to_string()))
                        .unwrap_or_else(|| ctx.input_str("utterance").unwrap_or_default());
                    let config = VisionAgentConfig {
                        max_steps: deps.config.vision_max_steps,
                        verify_actions: false,
                        starting_url: None,
                    };
                    let outcome = run_vision(&deps, config, &objective, &ctx).await?;
                    if let Some(answer) = &outcome.answer {
                        ctx.set_artifact("findings", json!(answer));
                    }
                    Ok(())
                }
            })
            .node("synthesize", &["browse"], move |ctx| {
                let deps = synth_deps.clone();
                async move {
                    let question = ctx.input_str("utterance").unwrap_or_default();
                    let findings = ctx
                        .artifact("findings")
                        .and_then(|v| v.as_str().map(|s| s.to_string()))
                        .unwrap_or_default();
                    let history = ctx
                        .artifact("vision_history")
                        .map(|v| v.to_string())
                        .unwrap_or_default();

                    let prompt = format!(
                        "Question: {}\n\nBrowsing findings: {}\n\nAction log: {}\n\n\
                         Write a short synthesis answering the question. State what \
                         remains unknown.",
                        question, findings, history
                    );
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
            .build()
    }
}
