//! Calendar skill - day view via playbook, summary via text LLM

use serde_json::json;

use super::{run_playbook_yaml, Skill, SkillDeps};
use crate::dag::Dag;
use crate::dispatch::TaskContext;
use crate::error::Result;
use crate::llm::{ChatMessage, LlmOptions};

/// Stable-selector flow for the calendar day view.
const DAY_PLAYBOOK: &str = r#"
name: calendar.day
steps:
  - name: open_calendar
    navigate:
      url: https://calendar.google.com/calendar/r/day
  - name: agenda_visible
    wait:
      selector: "[role=main]"
  - name: agenda_text
    evaluate:
      script: "document.querySelector('[role=main]').innerText"
    on_failure: continue
  - name: day_shot
    screenshot: {}
postconditions:
  - name: agenda_still_there
    wait:
      selector: "[role=main]"
"#;

pub struct CalendarSkill {
    deps: SkillDeps,
}

impl CalendarSkill {
    pub fn new(deps: SkillDeps) -> Self {
        Self { deps }
    }
}

impl Skill for CalendarSkill {
    fn name(&self) -> &'static str {
        "calendar"
    }

    fn description(&self) -> &'static str {
        "Read the calendar day view and summarize upcoming events"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &[
            r"\bcalendar\b",
            r"\bschedule\b",
            r"\bagenda\b",
            r"\bmeetings?\b",
            r"\bappointments?\b",
        ]
    }

    fn build_dag(&self, _task: &TaskContext) -> Result<Dag> {
        let fetch_deps = self.deps.clone();
        let sum_deps = self.deps.clone();

        Dag::builder("calendar.day")
            .node("fetch_day", &[], move |ctx| {
                let deps = fetch_deps.clone();
                async move {
                    run_playbook_yaml(&deps, DAY_PLAYBOOK, &ctx).await?;
                    Ok(())
                }
            })
            .node("summarize", &["fetch_day"], move |ctx| {
                let deps = sum_deps.clone();
                async move {
                    let agenda = ctx
                        .artifact("agenda_text")
                        .and_then(|v| v.as_str().map(|s| s.to_string()))
                        .unwrap_or_default();
                    let prompt = format!(
                        "Summarize this calendar day view in two sentences. Mention the \
                         next upcoming event first. If it is empty, say the day is free.\n\n{}",
                        agenda
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
