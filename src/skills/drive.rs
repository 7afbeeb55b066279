//! Drive skill - recent files listing via playbook

use serde_json::json;

use super::{run_playbook_yaml, Skill, SkillDeps};
use crate::dag::Dag;
use crate::dispatch::TaskContext;
use crate::error::Result;
use crate::llm::{ChatMessage, LlmOptions};

const RECENT_PLAYBOOK: &str = r#"
name: drive.recent
steps:
  - name: open_recent
    navigate:
      url: https://drive.google.com/drive/recent
  - name: listing_ready
    wait:
      selector: "[role=grid]"
  - name: recent_files
    evaluate:
      script: "Array.from(document.querySelectorAll('[role=row] [data-name]')).slice(0, 20).map(e => e.innerText).join('; ')"
    on_failure: continue
  - name: screenshot
    screenshot: {}
"#;

pub struct DriveSkill {
    deps: SkillDeps,
}

impl DriveSkill {
    pub fn new(deps: SkillDeps) -> Self {
        Self { deps }
    }
}

impl Skill for DriveSkill {
    fn name(&self) -> &'static str {
        "drive"
    }

    fn description(&self) -> &'static str {
        "List recently changed files in the cloud drive"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &[r"\bdrive\b", r"\bmy files\b", r"\bdocs?\b", r"\bspreadsheet\b"]
    }

    fn build_dag(&self, _task: &TaskContext) -> Result<Dag> {
        let fetch_deps = self.deps.clone();
        let sum_deps = self.deps.clone();

        Dag::builder("drive.recent")
            .node("fetch_recent", &[], move |ctx| {
                let deps = fetch_deps.clone();
                async move {
                    run_playbook_yaml(&deps, RECENT_PLAYBOOK, &ctx).await?;
                    Ok(())
                }
            })
            .node("describe", &["fetch_recent"], move |ctx| {
                let deps = sum_deps.clone();
                async move {
                    let files = ctx
                        .artifact("recent_files")
                        .and_then(|v| v.as_str().map(|s| s.to_string()))
                        .unwrap_or_default();
                    let prompt = format!(
                        "These are recently modified drive files, semicolon separated. \
                         Report the most recent few in one sentence. If empty, say \
                         nothing changed recently.\n\n{}",
                        files
                    );
                    let reply = deps
                        .text_llm
                        .chat(&[ChatMessage::user(prompt)], &LlmOptions::default())
                        .await?;
                    ctx.set_output("summary", json!(reply.trim()));
                    Ok(())
                }
            })
            .build()
    }
}
