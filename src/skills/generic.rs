//! Generic browser skill - arbitrary web actions via the vision-action loop
//!
//! The catch-all for "go do this on some website" requests that have neither
//! a stable playbook nor a lookup shape. Per-action verification is on here:
//! unknown UIs drift, and the extra screenshot check catches silent misses.

use serde_json::json;

use super::{run_vision, Skill, SkillDeps};
use crate::dag::Dag;
use crate::dispatch::TaskContext;
use crate::error::Result;
use crate::vision::{VisionAgentConfig, VisionStatus};

pub struct GenericBrowserSkill {
    deps: SkillDeps,
}

impl GenericBrowserSkill {
    pub fn new(deps: SkillDeps) -> Self {
        Self { deps }
    }
}

impl Skill for GenericBrowserSkill {
    fn name(&self) -> &'static str {
        "generic_browser"
    }

    fn description(&self) -> &'static str {
        "Perform an arbitrary action on a website by looking at the page"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &[
            r"\bbrowser\b",
            r"\bwebsite\b",
            r"\bgo to\b",
            r"\bopen the (site|page)\b",
            r"\bfill (in|out)\b",
        ]
    }

    fn build_dag(&self, _task: &TaskContext) -> Result<Dag> {
        let deps = self.deps.clone();

        Dag::builder("generic_browser")
            .node("drive", &[], move |ctx| {
                let deps = deps.clone();
                async move {
                    let objective = ctx.input_str("utterance").unwrap_or_default();
                    let config = VisionAgentConfig {
                        max_steps: deps.config.vision_max_steps,
                        verify_actions: true,
                        starting_url: None,
                    };
                    let outcome = run_vision(&deps, config, &objective, &ctx).await?;

                    let summary = match outcome.status {
                        VisionStatus::Ok => outcome
                            .answer
                            .clone()
                            .unwrap_or_else(|| "task completed in the browser".to_string()),
                        VisionStatus::Incomplete => format!(
                            "stopped after {} actions without finishing",
                            outcome.browser_actions
                        ),
                        VisionStatus::Failed => "browser task failed".to_string(),
                    };
                    if let Some(answer) = &outcome.answer {
                        ctx.set_output("answer", json!(answer));
                    }
                    ctx.set_output("summary", json!(summary));
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
    async fn completes_against_mock_browser() {
        let deps = SkillDeps::offline(NervaConfig::default());
        let skill = GenericBrowserSkill::new(deps);
        let dag = skill
            .build_dag(&TaskContext::text("go to example.com and click around"))
            .unwrap();

        let mut inputs = BTreeMap::new();
        inputs.insert("utterance".to_string(), json!("go to example.com"));
        let ctx = dag.execute(Arc::new(RunContext::with_inputs(inputs))).await;

        assert_eq!(ctx.node_status("drive"), NodeStatus::Ok);
        assert!(ctx.output("summary").is_some());
    }
}
