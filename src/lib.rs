//! # Nerva
//!
//! Workflow and task-dispatch core of a local-first multi-modal assistant.
//!
//! A request arrives by text, voice, hotkey, or ambient timer; the
//! [`dispatch::Dispatcher`] routes it to a skill, executes the skill as a
//! [`dag::Dag`] of async nodes over a shared [`context::RunContext`], and
//! records the interaction into the [`memory::MemoryStore`],
//! [`threads::ThreadStore`], and [`graph::KnowledgeGraph`]. Browser-bound
//! skills either interpret a declarative [`playbook::Playbook`] or run the
//! [`vision::VisionAgent`] perception-action loop.
//!
//! External collaborators (LLM gateway, browser driver, speech engines) are
//! consumed through traits; every one of them has a scripted mock, so the
//! whole core runs and tests offline.

pub mod browser;
pub mod config;
pub mod context;
pub mod dag;
pub mod dispatch;
pub mod error;
pub mod frontend;
pub mod graph;
pub mod llm;
pub mod memory;
pub mod persist;
pub mod playbook;
pub mod safety;
pub mod skills;
pub mod threads;
pub mod vision;

pub use config::NervaConfig;
pub use context::{NodeEvent, NodeStatus, RunContext};
pub use dag::{Dag, DagBuilder, NodeOpts, RetryPolicy};
pub use dispatch::{Dispatcher, Source, TaskContext, TaskResult, TaskStatus};
pub use error::{NervaError, Result};
pub use memory::{MemoryItem, MemoryKind, MemoryStore};
pub use skills::{default_registry, SkillDeps, SkillRegistry};
