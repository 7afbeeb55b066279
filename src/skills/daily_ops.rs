//! Daily-ops skill - collect, summarize, remember
//!
//! Four sub-collectors run in parallel; each one is tolerant, reporting an
//! empty section with a note instead of failing the DAG. The concatenated
//! sections go to the text LLM with a fixed prioritized-task-list prompt and
//! the result is stored as a `DailyOp` memory item.

use std::path::Path;
use std::time::Duration;

use serde_json::json;
use tracing::debug;
use walkdir::WalkDir;

use super::{Skill, SkillDeps};
use crate::dag::Dag;
use crate::dispatch::TaskContext;
use crate::error::Result;
use crate::llm::{ChatMessage, LlmOptions};
use crate::memory::{MemoryItem, MemoryKind};

/// Cap on TODO lines collected per scan
const MAX_TODO_LINES: usize = 40;
/// Lines kept from the tail of the ops log
const LOG_TAIL_LINES: usize = 50;
/// Probe timeout per cluster node
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const SUMMARY_PROMPT: &str = "You are an operations assistant. From the sections below, \
produce a prioritized task list for today: most urgent first, one line per item, at most \
eight items. Note any section that is empty.";

pub struct DailyOpsSkill {
    deps: SkillDeps,
}

impl DailyOpsSkill {
    pub fn new(deps: SkillDeps) -> Self {
        Self { deps }
    }
}

impl Skill for DailyOpsSkill {
    fn name(&self) -> &'static str {
        "daily_ops"
    }

    fn description(&self) -> &'static str {
        "Collect TODOs, logs, and system status into a prioritized daily summary"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &[r"\bdaily (ops|summary|report)\b", r"\bstatus report\b", r"\bstand-?up\b"]
    }

    fn build_dag(&self, _task: &TaskContext) -> Result<Dag> {
        let todo_deps = self.deps.clone();
        let log_deps = self.deps.clone();
        let cluster_deps = self.deps.clone();
        let sum_deps = self.deps.clone();
        let mem_deps = self.deps.clone();

        Dag::builder("daily_ops")
            .node("todo_scan", &[], move |ctx| {
                let deps = todo_deps.clone();
                async move {
                    let section = match &deps.config.notes_dir {
                        Some(dir) => scan_todos(dir),
                        None => String::new(),
                    };
                    ctx.set_artifact("todo_scan", json!(section));
                    Ok(())
                }
            })
            .node("log_tail", &[], move |ctx| {
                let deps = log_deps.clone();
                async move {
                    let section = match &deps.config.ops_log_file {
                        Some(path) => tail_file(path, LOG_TAIL_LINES).await,
                        None => String::new(),
                    };
                    ctx.set_artifact("log_tail", json!(section));
                    Ok(())
                }
            })
            .node("system_events", &[], |ctx| async move {
                // No OS event source is wired yet; the contract holds with an
                // empty section.
                ctx.set_artifact("system_events", json!(""));
                Ok(())
            })
            .node("cluster_status", &[], move |ctx| {
                let deps = cluster_deps.clone();
                async move {
                    let section = probe_nodes(&deps.config.llm_nodes).await;
                    ctx.set_artifact("cluster_status", json!(section));
                    Ok(())
                }
            })
            .node(
                "summarize",
                &["todo_scan", "log_tail", "system_events", "cluster_status"],
                move |ctx| {
                    let deps = sum_deps.clone();
                    async move {
                        let mut sections = String::new();
                        for key in ["todo_scan", "log_tail", "system_events", "cluster_status"] {
                            let body = ctx
                                .artifact(key)
                                .and_then(|v| v.as_str().map(|s| s.to_string()))
                                .unwrap_or_default();
                            let body = if body.trim().is_empty() {
                                "(empty)".to_string()
                            } else {
                                body
                            };
                            sections.push_str(&format!("## {}\n{}\n\n", key, body));
                        }

                        let reply = deps
                            .text_llm
                            .chat(
                                &[
                                    ChatMessage::system(SUMMARY_PROMPT),
                                    ChatMessage::user(sections),
                                ],
                                &LlmOptions::default(),
                            )
                            .await?;
                        ctx.set_output("summary", json!(reply.trim()));
                        Ok(())
                    }
                },
            )
            .node("write_memory", &["summarize"], move |ctx| {
                let deps = mem_deps.clone();
                async move {
                    let summary = ctx
                        .output("summary")
                        .and_then(|v| v.as_str().map(|s| s.to_string()))
                        .unwrap_or_default();
                    let id = deps.memory.add(
                        MemoryItem::new(MemoryKind::DailyOp, summary).with_tags(["daily_ops"]),
                    );
                    ctx.set_artifact("memory_id", json!(id));
                    Ok(())
                }
            })
            .build()
    }
}

/// TODO/FIXME lines from markdown and text notes under `dir`.
fn scan_todos(dir: &Path) -> String {
    let mut lines = Vec::new();
    for entry in WalkDir::new(dir)
        .max_depth(4)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let is_note = entry
            .path()
            .extension()
            .and_then(|x| x.to_str())
            .is_some_and(|x| matches!(x, "md" | "txt"));
        if !is_note {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for line in content.lines() {
            if line.contains("TODO") || line.contains("FIXME") {
                lines.push(format!(
                    "{}: {}",
                    entry.path().file_name().and_then(|n| n.to_str()).unwrap_or("?"),
                    line.trim()
                ));
                if lines.len() >= MAX_TODO_LINES {
                    return lines.join("\n");
                }
            }
        }
    }
    lines.join("\n")
}

/// Last `count` lines of a log file; empty on any error.
async fn tail_file(path: &Path, count: usize) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(count);
            lines[start..].join("\n")
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "log tail unavailable");
            String::new()
        }
    }
}

/// One line per configured node: reachable or not.
async fn probe_nodes(nodes: &[String]) -> String {
    if nodes.is_empty() {
        return String::new();
    }
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return String::new(),
    };

    let mut lines = Vec::with_capacity(nodes.len());
    for node in nodes {
        let status = match client.get(format!("{}/health", node.trim_end_matches('/'))).send().await
        {
            Ok(r) if r.status().is_success() => "up",
            Ok(_) => "degraded",
            Err(_) => "unreachable",
        };
        lines.push(format!("{}: {}", node, status));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NervaConfig;
    use crate::context::{NodeStatus, RunContext};
    use std::sync::Arc;

    #[tokio::test]
    async fn full_pipeline_with_empty_collectors() {
        let deps = SkillDeps::offline(NervaConfig::default());
        let memory = deps.memory.clone();
        let skill = DailyOpsSkill::new(deps);
        let dag = skill.build_dag(&TaskContext::text("daily summary")).unwrap();

        let ctx = dag.execute(Arc::new(RunContext::new())).await;

        for node in [
            "todo_scan",
            "log_tail",
            "system_events",
            "cluster_status",
            "summarize",
            "write_memory",
        ] {
            assert_eq!(ctx.node_status(node), NodeStatus::Ok, "node {}", node);
        }
        assert_eq!(memory.list_by_kind(MemoryKind::DailyOp, 10).len(), 1);
    }

    #[tokio::test]
    async fn todo_scan_finds_markers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("notes.md"),
            "# Notes\n- TODO water the plants\nplain line\n- FIXME leaky faucet\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("ignore.rs"), "// TODO not a note file\n").unwrap();

        let section = scan_todos(dir.path());
        assert!(section.contains("water the plants"));
        assert!(section.contains("leaky faucet"));
        assert!(!section.contains("not a note file"));
    }

    #[tokio::test]
    async fn tail_missing_file_is_empty_not_error() {
        let section = tail_file(Path::new("/definitely/not/here.log"), 10).await;
        assert!(section.is_empty());
    }

    #[tokio::test]
    async fn tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.log");
        let content: Vec<String> = (0..100).map(|i| format!("line {}", i)).collect();
        std::fs::write(&path, content.join("\n")).unwrap();

        let tail = tail_file(&path, 10).await;
        assert!(tail.starts_with("line 90"));
        assert!(tail.ends_with("line 99"));
    }
}
