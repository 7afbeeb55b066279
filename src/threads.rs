//! Task threads - append-only logs of long-running user projects
//!
//! One thread per project. The dispatcher attaches every request to a thread
//! (matching by project name, creating on demand) and appends exactly one
//! entry per call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One append-only record in a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadEntry {
    pub timestamp: DateTime<Utc>,
    pub text: String,
    /// References to related records (memory item ids, entity ids, urls)
    #[serde(default)]
    pub references: Vec<String>,
}

/// A project thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskThread {
    pub thread_id: String,
    pub project: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub entries: Vec<ThreadEntry>,
}

/// Process-wide thread store (cheap to clone, shared state)
#[derive(Clone, Default)]
pub struct ThreadStore {
    threads: Arc<RwLock<Vec<TaskThread>>>,
}

impl ThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, project: impl Into<String>, title: impl Into<String>) -> TaskThread {
        let now = Utc::now();
        let thread = TaskThread {
            thread_id: uuid::Uuid::new_v4().to_string(),
            project: project.into(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            entries: Vec::new(),
        };
        self.threads.write().push(thread.clone());
        thread
    }

    pub fn get(&self, thread_id: &str) -> Option<TaskThread> {
        self.threads
            .read()
            .iter()
            .find(|t| t.thread_id == thread_id)
            .cloned()
    }

    /// Append an entry; advances `updated_at`. Returns the entry, or `None`
    /// when the thread does not exist.
    pub fn add_entry(
        &self,
        thread_id: &str,
        text: impl Into<String>,
        references: Vec<String>,
    ) -> Option<ThreadEntry> {
        let mut threads = self.threads.write();
        let thread = threads.iter_mut().find(|t| t.thread_id == thread_id)?;
        let entry = ThreadEntry {
            timestamp: Utc::now(),
            text: text.into(),
            references,
        };
        thread.entries.push(entry.clone());
        thread.updated_at = entry.timestamp;
        Some(entry)
    }

    pub fn find_by_project(&self, project: &str) -> Option<TaskThread> {
        self.threads
            .read()
            .iter()
            .find(|t| t.project == project)
            .cloned()
    }

    /// Find the project's thread or create it.
    pub fn attach(&self, project: &str, title: &str) -> TaskThread {
        if let Some(thread) = self.find_by_project(project) {
            return thread;
        }
        self.create(project, title)
    }

    /// Most recently updated threads first.
    pub fn list(&self, limit: usize) -> Vec<TaskThread> {
        let threads = self.threads.read();
        let mut all: Vec<&TaskThread> = threads.iter().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        all.into_iter().take(limit).cloned().collect()
    }

    pub fn export(&self) -> Vec<TaskThread> {
        self.threads.read().clone()
    }

    pub fn import(&self, threads: Vec<TaskThread>) {
        self.threads.write().extend(threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get() {
        let store = ThreadStore::new();
        let thread = store.create("home-lab", "Home lab upkeep");

        let fetched = store.get(&thread.thread_id).unwrap();
        assert_eq!(fetched.project, "home-lab");
        assert!(fetched.entries.is_empty());
    }

    #[test]
    fn add_entry_advances_updated_at() {
        let store = ThreadStore::new();
        let thread = store.create("trip", "Trip planning");
        let before = store.get(&thread.thread_id).unwrap().updated_at;

        store
            .add_entry(&thread.thread_id, "booked flights", vec!["mem-1".into()])
            .unwrap();

        let after = store.get(&thread.thread_id).unwrap();
        assert_eq!(after.entries.len(), 1);
        assert!(after.updated_at >= before);
        assert_eq!(after.entries[0].references, vec!["mem-1"]);
    }

    #[test]
    fn add_entry_to_missing_thread_is_none() {
        let store = ThreadStore::new();
        assert!(store.add_entry("nope", "text", vec![]).is_none());
    }

    #[test]
    fn attach_reuses_project_thread() {
        let store = ThreadStore::new();
        let first = store.attach("inbox", "Inbox");
        let second = store.attach("inbox", "Inbox");
        assert_eq!(first.thread_id, second.thread_id);

        let other = store.attach("garden", "Garden");
        assert_ne!(first.thread_id, other.thread_id);
    }

    #[test]
    fn list_orders_by_recency() {
        let store = ThreadStore::new();
        let a = store.create("a", "A");
        let b = store.create("b", "B");

        store.add_entry(&a.thread_id, "touch", vec![]).unwrap();

        let listed = store.list(10);
        assert_eq!(listed[0].thread_id, a.thread_id);
        assert_eq!(listed[1].thread_id, b.thread_id);

        assert_eq!(store.list(1).len(), 1);
    }
}
