//! Shared memory store
//!
//! Append-only, thread-safe log of typed records. Every dispatcher call and
//! several skills write here; nothing is ever mutated or evicted. Search is
//! token containment ranked by recency, upgraded to cosine similarity when an
//! [`Embedder`] is configured — absence of an embedder degrades silently.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    QAndA,
    Todo,
    RepoInsight,
    DailyOp,
    System,
    TaskResult,
}

impl MemoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QAndA => "q_and_a",
            Self::Todo => "todo",
            Self::RepoInsight => "repo_insight",
            Self::DailyOp => "daily_op",
            Self::System => "system",
            Self::TaskResult => "task_result",
        }
    }
}

/// One immutable memory record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub kind: MemoryKind,
    pub text: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryItem {
    pub fn new(kind: MemoryKind, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            text: text.into(),
            tags: BTreeSet::new(),
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
            embedding: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Optional text-embedding collaborator for vector search
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Append-only memory store (cheap to clone, shared state)
#[derive(Clone, Default)]
pub struct MemoryStore {
    items: Arc<RwLock<Vec<MemoryItem>>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Append an item; embeds the text when an embedder is configured.
    /// Returns the item id.
    pub fn add(&self, mut item: MemoryItem) -> String {
        if item.embedding.is_none() {
            if let Some(embedder) = &self.embedder {
                item.embedding = Some(embedder.embed(&item.text));
            }
        }
        let id = item.id.clone();
        self.items.write().push(item);
        id
    }

    pub fn get(&self, id: &str) -> Option<MemoryItem> {
        self.items.read().iter().find(|i| i.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Search by whitespace-token containment (case-insensitive), optionally
    /// narrowed by kind and tags, most recent first. With an embedder the
    /// candidate set is re-ranked by cosine similarity to the query.
    pub fn search(
        &self,
        query: &str,
        kind: Option<MemoryKind>,
        tags: Option<&BTreeSet<String>>,
        limit: usize,
    ) -> Vec<MemoryItem> {
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();

        let items = self.items.read();
        let mut matched: Vec<&MemoryItem> = items
            .iter()
            .filter(|i| kind.is_none_or(|k| i.kind == k))
            .filter(|i| tags.is_none_or(|t| t.iter().all(|tag| i.tags.contains(tag))))
            .filter(|i| {
                let text = i.text.to_lowercase();
                tokens.iter().all(|t| text.contains(t))
            })
            .collect();

        match &self.embedder {
            Some(embedder) => {
                let query_vec = embedder.embed(query);
                matched.sort_by(|a, b| {
                    let sa = a
                        .embedding
                        .as_deref()
                        .map(|e| cosine(e, &query_vec))
                        .unwrap_or(0.0);
                    let sb = b
                        .embedding
                        .as_deref()
                        .map(|e| cosine(e, &query_vec))
                        .unwrap_or(0.0);
                    sb.partial_cmp(&sa)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(b.created_at.cmp(&a.created_at))
                });
            }
            None => {
                matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
        }

        matched.into_iter().take(limit).cloned().collect()
    }

    pub fn list_by_kind(&self, kind: MemoryKind, limit: usize) -> Vec<MemoryItem> {
        let items = self.items.read();
        let mut found: Vec<&MemoryItem> = items.iter().filter(|i| i.kind == kind).collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.into_iter().take(limit).cloned().collect()
    }

    pub fn list_by_tags(&self, tags: &BTreeSet<String>) -> Vec<MemoryItem> {
        let items = self.items.read();
        let mut found: Vec<&MemoryItem> = items
            .iter()
            .filter(|i| tags.iter().all(|t| i.tags.contains(t)))
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.into_iter().cloned().collect()
    }

    /// Full snapshot for persistence.
    pub fn export(&self) -> Vec<MemoryItem> {
        self.items.read().clone()
    }

    /// Bulk-load persisted items (used at startup).
    pub fn import(&self, items: Vec<MemoryItem>) {
        self.items.write().extend(items);
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_and_get() {
        let store = MemoryStore::new();
        let id = store.add(MemoryItem::new(MemoryKind::System, "boot complete"));

        let item = store.get(&id).unwrap();
        assert_eq!(item.kind, MemoryKind::System);
        assert_eq!(item.text, "boot complete");
    }

    #[test]
    fn append_only_identical_content_gets_distinct_ids() {
        let store = MemoryStore::new();
        let a = store.add(MemoryItem::new(MemoryKind::Todo, "water plants"));
        let b = store.add(MemoryItem::new(MemoryKind::Todo, "water plants"));

        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn search_requires_all_tokens() {
        let store = MemoryStore::new();
        store.add(MemoryItem::new(
            MemoryKind::QAndA,
            "The meeting is on Tuesday at noon",
        ));
        store.add(MemoryItem::new(MemoryKind::QAndA, "Tuesday is garbage day"));

        let hits = store.search("tuesday meeting", None, None, 10);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("noon"));
    }

    #[test]
    fn search_is_case_insensitive_and_recency_ranked() {
        let store = MemoryStore::new();
        let old = store.add(MemoryItem::new(MemoryKind::QAndA, "deploy notes v1"));
        let new = store.add(MemoryItem::new(MemoryKind::QAndA, "deploy notes v2"));

        let hits = store.search("DEPLOY", None, None, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, new);
        assert_eq!(hits[1].id, old);
    }

    #[test]
    fn search_filters_by_kind_and_tags() {
        let store = MemoryStore::new();
        store.add(
            MemoryItem::new(MemoryKind::Todo, "review budget").with_tags(["finance"]),
        );
        store.add(
            MemoryItem::new(MemoryKind::DailyOp, "review backups").with_tags(["infra"]),
        );

        let hits = store.search("review", Some(MemoryKind::Todo), None, 10);
        assert_eq!(hits.len(), 1);

        let tags: BTreeSet<String> = ["infra".to_string()].into();
        let hits = store.search("review", None, Some(&tags), 10);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("backups"));
    }

    #[test]
    fn list_by_kind_respects_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.add(MemoryItem::new(MemoryKind::DailyOp, format!("op {}", i)));
        }
        assert_eq!(store.list_by_kind(MemoryKind::DailyOp, 3).len(), 3);
        assert!(store.list_by_kind(MemoryKind::Todo, 3).is_empty());
    }

    struct StubEmbedder;
    impl Embedder for StubEmbedder {
        fn embed(&self, text: &str) -> Vec<f32> {
            // Toy projection: length and vowel count.
            let vowels = text.chars().filter(|c| "aeiou".contains(*c)).count();
            vec![text.len() as f32, vowels as f32]
        }
    }

    #[test]
    fn embedder_reorders_matches() {
        let store = MemoryStore::new().with_embedder(Arc::new(StubEmbedder));
        store.add(MemoryItem::new(MemoryKind::QAndA, "cat"));
        store.add(MemoryItem::new(
            MemoryKind::QAndA,
            "cataclysmically long entry about cats",
        ));

        // Query vector close to the short item wins despite being older.
        let hits = store.search("cat", None, None, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "cat");
    }

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn metadata_round_trips() {
        let store = MemoryStore::new();
        let id = store.add(
            MemoryItem::new(MemoryKind::TaskResult, "done")
                .with_metadata("skill", json!("calendar")),
        );
        let item = store.get(&id).unwrap();
        assert_eq!(item.metadata["skill"], json!("calendar"));
    }
}
