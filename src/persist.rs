//! Optional JSON persistence for the process-wide stores
//!
//! Layout under the state home:
//! - `memory/<kind>.jsonl` - one line per memory item
//! - `threads/<thread_id>.json` - one file per thread
//! - `graph.json` - entities and edges
//!
//! Everything here is best-effort at the call sites: a purely in-memory run
//! is fully supported and the CLI only persists when configured to.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::NervaConfig;
use crate::error::Result;
use crate::graph::{Edge, Entity, KnowledgeGraph};
use crate::memory::{MemoryItem, MemoryKind, MemoryStore};
use crate::threads::{TaskThread, ThreadStore};

const MEMORY_KINDS: [MemoryKind; 6] = [
    MemoryKind::QAndA,
    MemoryKind::Todo,
    MemoryKind::RepoInsight,
    MemoryKind::DailyOp,
    MemoryKind::System,
    MemoryKind::TaskResult,
];

#[derive(Serialize, Deserialize, Default)]
struct GraphFile {
    entities: Vec<Entity>,
    edges: Vec<Edge>,
}

pub struct Persistence {
    home: PathBuf,
}

impl Persistence {
    pub fn from_config(config: &NervaConfig) -> Self {
        Self {
            home: config.state_home(),
        }
    }

    fn memory_dir(&self) -> PathBuf {
        self.home.join("memory")
    }

    fn threads_dir(&self) -> PathBuf {
        self.home.join("threads")
    }

    fn graph_path(&self) -> PathBuf {
        self.home.join("graph.json")
    }

    /// Write all three stores. Overwrites previous files.
    pub fn save(
        &self,
        memory: &MemoryStore,
        threads: &ThreadStore,
        graph: &KnowledgeGraph,
    ) -> Result<()> {
        fs::create_dir_all(self.memory_dir())?;
        fs::create_dir_all(self.threads_dir())?;

        let items = memory.export();
        for kind in MEMORY_KINDS {
            let lines: Vec<String> = items
                .iter()
                .filter(|i| i.kind == kind)
                .filter_map(|i| serde_json::to_string(i).ok())
                .collect();
            let path = self.memory_dir().join(format!("{}.jsonl", kind.as_str()));
            if lines.is_empty() {
                // Keep the directory clean of empty files.
                let _ = fs::remove_file(&path);
            } else {
                fs::write(path, lines.join("\n") + "\n")?;
            }
        }

        for thread in threads.export() {
            let path = self.threads_dir().join(format!("{}.json", thread.thread_id));
            fs::write(path, serde_json::to_string_pretty(&thread)?)?;
        }

        let (entities, edges) = graph.export();
        fs::write(
            self.graph_path(),
            serde_json::to_string_pretty(&GraphFile { entities, edges })?,
        )?;

        debug!(home = %self.home.display(), "state saved");
        Ok(())
    }

    /// Load persisted state into the stores. Missing files are fine;
    /// unreadable ones are skipped with a warning.
    pub fn load(
        &self,
        memory: &MemoryStore,
        threads: &ThreadStore,
        graph: &KnowledgeGraph,
    ) -> Result<()> {
        if self.memory_dir().is_dir() {
            let mut items: Vec<MemoryItem> = Vec::new();
            for kind in MEMORY_KINDS {
                let path = self.memory_dir().join(format!("{}.jsonl", kind.as_str()));
                let Ok(content) = fs::read_to_string(&path) else {
                    continue;
                };
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<MemoryItem>(line) {
                        Ok(item) => items.push(item),
                        Err(e) => warn!(path = %path.display(), error = %e, "bad memory line"),
                    }
                }
            }
            items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            memory.import(items);
        }

        if self.threads_dir().is_dir() {
            let mut loaded: Vec<TaskThread> = Vec::new();
            for entry in fs::read_dir(self.threads_dir())? {
                let path = entry?.path();
                if path.extension().and_then(|x| x.to_str()) != Some("json") {
                    continue;
                }
                match fs::read_to_string(&path)
                    .map_err(crate::error::NervaError::from)
                    .and_then(|s| serde_json::from_str(&s).map_err(Into::into))
                {
                    Ok(thread) => loaded.push(thread),
                    Err(e) => warn!(path = %path.display(), error = %e, "bad thread file"),
                }
            }
            threads.import(loaded);
        }

        if self.graph_path().is_file() {
            let content = fs::read_to_string(self.graph_path())?;
            match serde_json::from_str::<GraphFile>(&content) {
                Ok(file) => graph.import(file.entities, file.edges),
                Err(e) => warn!(error = %e, "bad graph file"),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &tempfile::TempDir) -> NervaConfig {
        NervaConfig {
            home: Some(dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn save_then_load_round_trips_all_stores() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        let memory = MemoryStore::new();
        memory.add(MemoryItem::new(MemoryKind::TaskResult, "did a thing"));
        memory.add(MemoryItem::new(MemoryKind::DailyOp, "ops summary"));

        let threads = ThreadStore::new();
        let thread = threads.create("trip", "Trip planning");
        threads
            .add_entry(&thread.thread_id, "booked", vec!["mem-1".into()])
            .unwrap();

        let graph = KnowledgeGraph::new();
        graph.add_edge("a", "b", "knows", serde_json::Map::new());

        let persistence = Persistence::from_config(&config);
        persistence.save(&memory, &threads, &graph).unwrap();

        let memory2 = MemoryStore::new();
        let threads2 = ThreadStore::new();
        let graph2 = KnowledgeGraph::new();
        persistence.load(&memory2, &threads2, &graph2).unwrap();

        assert_eq!(memory2.len(), 2);
        assert_eq!(threads2.list(10).len(), 1);
        assert_eq!(threads2.list(10)[0].entries.len(), 1);
        assert_eq!(graph2.related("a", 1).len(), 2);
    }

    #[test]
    fn load_from_empty_home_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::from_config(&config_in(&dir));

        let memory = MemoryStore::new();
        persistence
            .load(&memory, &ThreadStore::new(), &KnowledgeGraph::new())
            .unwrap();
        assert!(memory.is_empty());
    }

    #[test]
    fn corrupt_lines_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let memory_dir = config.memory_dir();
        fs::create_dir_all(&memory_dir).unwrap();
        fs::write(memory_dir.join("task_result.jsonl"), "{not json}\n").unwrap();

        let memory = MemoryStore::new();
        Persistence::from_config(&config)
            .load(&memory, &ThreadStore::new(), &KnowledgeGraph::new())
            .unwrap();
        assert!(memory.is_empty());
    }
}
