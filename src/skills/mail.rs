//! Mail skill - inbox snapshot via playbook, unread digest via text LLM

use serde_json::json;

use super::{run_playbook_yaml, Skill, SkillDeps};
use crate::dag::Dag;
use crate::dispatch::TaskContext;
use crate::error::Result;
use crate::llm::{ChatMessage, LlmOptions};

const INBOX_PLAYBOOK: &str = r##"
name: mail.inbox
steps:
  - name: open_inbox
    navigate:
      url: https://mail.google.com
  - name: inbox_ready
    wait:
      selector: "#inbox"
  - name: unread_rows
    evaluate:
      script: "Array.from(document.querySelectorAll('tr.unread .subject')).map(e => e.innerText).join('; ')"
    on_failure: continue
  - name: screenshot
    screenshot: {}
"##;

pub struct MailSkill {
    deps: SkillDeps,
}

impl MailSkill {
    pub fn new(deps: SkillDeps) -> Self {
        Self { deps }
    }
}

impl Skill for MailSkill {
    fn name(&self) -> &'static str {
        "mail"
    }

    fn description(&self) -> &'static str {
        "Open the mail inbox and digest unread messages"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &[
            r"\bmail\b",
            r"\bemail\b",
            r"\binbox\b",
            r"\bunread\b",
            r"\bsend\b",
        ]
    }

    fn build_dag(&self, _task: &TaskContext) -> Result<Dag> {
        let fetch_deps = self.deps.clone();
        let sum_deps = self.deps.clone();

        Dag::builder("mail.inbox")
            .node("fetch_inbox", &[], move |ctx| {
                let deps = fetch_deps.clone();
                async move {
                    run_playbook_yaml(&deps, INBOX_PLAYBOOK, &ctx).await?;
                    Ok(())
                }
            })
            .node("digest", &["fetch_inbox"], move |ctx| {
                let deps = sum_deps.clone();
                async move {
                    let subjects = ctx
                        .artifact("unread_rows")
                        .and_then(|v| v.as_str().map(|s| s.to_string()))
                        .unwrap_or_default();
                    let prompt = format!(
                        "These are unread mail subjects, semicolon separated. Give a \
                         two-sentence digest, most urgent first. If empty, say the inbox \
                         is clear.\n\n{}",
                        subjects
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NervaConfig;
    use crate::context::{NodeStatus, RunContext};
    use std::sync::Arc;

    #[tokio::test]
    async fn inbox_digest_produces_summary_and_screenshot() {
        let deps = SkillDeps::offline(NervaConfig::default());
        let skill = MailSkill::new(deps);
        let dag = skill.build_dag(&TaskContext::text("check my inbox")).unwrap();

        let ctx = dag.execute(Arc::new(RunContext::new())).await;

        assert_eq!(ctx.node_status("fetch_inbox"), NodeStatus::Ok);
        assert!(ctx.output("summary").is_some());
        assert!(ctx.artifact("screenshot").is_some());
    }

    #[test]
    fn playbook_document_is_valid() {
        let playbook = crate::playbook::Playbook::from_yaml(INBOX_PLAYBOOK).unwrap();
        assert_eq!(playbook.name, "mail.inbox");
        assert_eq!(playbook.steps.len(), 4);
    }
}
