//! Lookup skill - quick fact finding via the vision-action loop
//!
//! Starts from a search-engine results page for the utterance and lets the
//! vision agent drive from there. Verification is off: lookups are short and
//! the final QA pass is the accuracy check.

use serde_json::json;

use super::{run_vision, Skill, SkillDeps};
use crate::dag::Dag;
use crate::dispatch::TaskContext;
use crate::error::Result;
use crate::vision::{VisionAgentConfig, VisionStatus};

fn search_url(query: &str) -> String {
    url::Url::parse_with_params("https://duckduckgo.com/", &[("q", query)])
        .map(|u| u.to_string())
        .unwrap_or_else(|_| "https://duckduckgo.com/".to_string())
}

pub struct LookupSkill {
    deps: SkillDeps,
}

impl LookupSkill {
    pub fn new(deps: SkillDeps) -> Self {
        Self { deps }
    }
}

impl Skill for LookupSkill {
    fn name(&self) -> &'static str {
        "lookup"
    }

    fn description(&self) -> &'static str {
        "Find a specific fact on the web (phone number, address, opening hours)"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &[
            r"\blook\s?up\b",
            r"\bphone number\b",
            r"\bopening hours\b",
            r"\baddress of\b",
        ]
    }

    fn build_dag(&self, _task: &TaskContext) -> Result<Dag> {
        let deps = self.deps.clone();

        Dag::builder("lookup")
            .node("browse", &[], move |ctx| {
                let deps = deps.clone();
                async move {
                    let objective = ctx.input_str("utterance").unwrap_or_default();
                    let config = VisionAgentConfig {
                        max_steps: deps.config.vision_max_steps,
                        verify_actions: false,
                        starting_url: Some(search_url(&objective)),
                    };
                    let outcome = run_vision(&deps, config, &objective, &ctx).await?;

                    match (&outcome.status, &outcome.answer) {
                        (VisionStatus::Ok, Some(answer)) => {
                            ctx.set_output("answer", json!(answer));
                            ctx.set_output("summary", json!(answer));
                        }
                        (VisionStatus::Ok, None) => {
                            ctx.set_output(
                                "summary",
                                json!("finished browsing but found no direct answer"),
                            );
                        }
                        _ => {
                            ctx.set_output(
                                "summary",
                                json!(format!(
                                    "ran out of steps after {} browser actions",
                                    outcome.browser_actions
                                )),
                            );
                        }
                    }
                    Ok(())
                }
            })
            .build()
    }
}
