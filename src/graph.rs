//! Knowledge graph - directed labelled multigraph of entities
//!
//! Each dispatcher invocation ingests its thread entry as an entity with
//! `mentions` edges to referenced entities. Cycles are allowed; traversal
//! uses a visited set and a hard node cap so no query returns an unbounded
//! result.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::threads::ThreadEntry;

/// BFS result cap for `related`
const RELATED_NODE_CAP: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub src: String,
    pub dst: String,
    pub label: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,
}

#[derive(Debug, Default)]
struct GraphInner {
    entities: FxHashMap<String, Entity>,
    edges: Vec<Edge>,
    /// src -> neighbor ids (both directions merged for traversal)
    adjacency: FxHashMap<String, Vec<String>>,
}

impl GraphInner {
    fn link(&mut self, src: &str, dst: &str) {
        self.adjacency
            .entry(src.to_string())
            .or_default()
            .push(dst.to_string());
        self.adjacency
            .entry(dst.to_string())
            .or_default()
            .push(src.to_string());
    }

    fn rebuild_adjacency(&mut self) {
        self.adjacency.clear();
        let edges: Vec<(String, String)> = self
            .edges
            .iter()
            .map(|e| (e.src.clone(), e.dst.clone()))
            .collect();
        for (src, dst) in edges {
            self.link(&src, &dst);
        }
    }
}

/// Process-wide knowledge graph (cheap to clone, shared state)
#[derive(Clone, Default)]
pub struct KnowledgeGraph {
    inner: Arc<RwLock<GraphInner>>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge an entity; merging unions attribute maps with the new
    /// values winning.
    pub fn upsert_entity(
        &self,
        id: impl Into<String>,
        kind: impl Into<String>,
        attributes: serde_json::Map<String, Value>,
    ) {
        let id = id.into();
        let kind = kind.into();
        let mut inner = self.inner.write();
        match inner.entities.get_mut(&id) {
            Some(existing) => {
                existing.kind = kind;
                for (k, v) in attributes {
                    existing.attributes.insert(k, v);
                }
            }
            None => {
                inner.entities.insert(
                    id.clone(),
                    Entity {
                        id,
                        kind,
                        attributes,
                    },
                );
            }
        }
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.inner.read().entities.get(id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.inner.read().entities.len()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.read().edges.len()
    }

    /// Add a directed labelled edge. Endpoints that do not exist yet are
    /// created as `unknown` entities so the graph never dangles.
    pub fn add_edge(
        &self,
        src: impl Into<String>,
        dst: impl Into<String>,
        label: impl Into<String>,
        attributes: serde_json::Map<String, Value>,
    ) {
        let src = src.into();
        let dst = dst.into();
        let mut inner = self.inner.write();
        for endpoint in [&src, &dst] {
            if !inner.entities.contains_key(endpoint.as_str()) {
                inner.entities.insert(
                    endpoint.clone(),
                    Entity {
                        id: endpoint.clone(),
                        kind: "unknown".to_string(),
                        attributes: serde_json::Map::new(),
                    },
                );
            }
        }
        inner.link(&src, &dst);
        inner.edges.push(Edge {
            src,
            dst,
            label: label.into(),
            attributes,
        });
    }

    /// Ingest a thread's entries: a `thread` entity plus one `mentions` edge
    /// per distinct reference.
    pub fn ingest_thread(&self, thread_id: &str, title: &str, entries: &[ThreadEntry]) {
        let mut attrs = serde_json::Map::new();
        attrs.insert("title".to_string(), Value::String(title.to_string()));
        attrs.insert(
            "entries".to_string(),
            Value::Number(entries.len().into()),
        );
        self.upsert_entity(thread_id, "thread", attrs);

        let mut seen: FxHashSet<&str> = FxHashSet::default();
        for entry in entries {
            for reference in &entry.references {
                if seen.insert(reference.as_str()) {
                    self.add_edge(
                        thread_id,
                        reference.clone(),
                        "mentions",
                        serde_json::Map::new(),
                    );
                }
            }
        }
    }

    /// Entities reachable within `depth` hops of `id`, including `id` itself,
    /// capped at 64 nodes. `related(id, 0)` is exactly `{id}` when present.
    pub fn related(&self, id: &str, depth: usize) -> Vec<Entity> {
        let inner = self.inner.read();
        let Some(start) = inner.entities.get(id) else {
            return Vec::new();
        };

        let mut visited: FxHashSet<&str> = FxHashSet::default();
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
        let mut result = vec![start.clone()];

        visited.insert(id);
        queue.push_back((id, 0));

        while let Some((current, dist)) = queue.pop_front() {
            if dist >= depth || result.len() >= RELATED_NODE_CAP {
                continue;
            }
            if let Some(neighbors) = inner.adjacency.get(current) {
                for neighbor in neighbors {
                    if result.len() >= RELATED_NODE_CAP {
                        break;
                    }
                    if visited.insert(neighbor.as_str()) {
                        if let Some(entity) = inner.entities.get(neighbor.as_str()) {
                            result.push(entity.clone());
                        }
                        queue.push_back((neighbor.as_str(), dist + 1));
                    }
                }
            }
        }

        result
    }

    /// Serializable dump: (entities, edges).
    pub fn export(&self) -> (Vec<Entity>, Vec<Edge>) {
        let inner = self.inner.read();
        let mut entities: Vec<Entity> = inner.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        (entities, inner.edges.clone())
    }

    pub fn import(&self, entities: Vec<Entity>, edges: Vec<Edge>) {
        let mut inner = self.inner.write();
        for entity in entities {
            inner.entities.insert(entity.id.clone(), entity);
        }
        inner.edges.extend(edges);
        inner.rebuild_adjacency();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn attrs() -> serde_json::Map<String, Value> {
        serde_json::Map::new()
    }

    #[test]
    fn upsert_merges_attributes() {
        let graph = KnowledgeGraph::new();
        let mut a = attrs();
        a.insert("lang".into(), Value::String("rust".into()));
        graph.upsert_entity("repo:nerva", "repo", a);

        let mut b = attrs();
        b.insert("stars".into(), Value::Number(7.into()));
        graph.upsert_entity("repo:nerva", "repo", b);

        let entity = graph.entity("repo:nerva").unwrap();
        assert_eq!(entity.attributes["lang"], "rust");
        assert_eq!(entity.attributes["stars"], 7);
        assert_eq!(graph.entity_count(), 1);
    }

    #[test]
    fn add_edge_creates_missing_endpoints() {
        let graph = KnowledgeGraph::new();
        graph.add_edge("a", "b", "knows", attrs());

        assert_eq!(graph.entity_count(), 2);
        assert_eq!(graph.entity("b").unwrap().kind, "unknown");
    }

    #[test]
    fn related_depth_zero_is_self() {
        let graph = KnowledgeGraph::new();
        graph.upsert_entity("x", "thing", attrs());
        graph.add_edge("x", "y", "rel", attrs());

        let related = graph.related("x", 0);
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].id, "x");
    }

    #[test]
    fn related_is_monotone_in_depth() {
        let graph = KnowledgeGraph::new();
        graph.add_edge("a", "b", "r", attrs());
        graph.add_edge("b", "c", "r", attrs());
        graph.add_edge("c", "d", "r", attrs());

        let mut previous = 0;
        for depth in 0..5 {
            let count = graph.related("a", depth).len();
            assert!(count >= previous, "depth {} shrank the result", depth);
            previous = count;
        }
        assert_eq!(graph.related("a", 3).len(), 4);
    }

    #[test]
    fn related_survives_cycles() {
        let graph = KnowledgeGraph::new();
        graph.add_edge("a", "b", "r", attrs());
        graph.add_edge("b", "c", "r", attrs());
        graph.add_edge("c", "a", "r", attrs());

        let related = graph.related("a", 10);
        assert_eq!(related.len(), 3);
    }

    #[test]
    fn related_unknown_entity_is_empty() {
        let graph = KnowledgeGraph::new();
        assert!(graph.related("ghost", 3).is_empty());
    }

    #[test]
    fn related_caps_fanout() {
        let graph = KnowledgeGraph::new();
        for i in 0..100 {
            graph.add_edge("hub", format!("spoke{}", i), "r", attrs());
        }
        assert!(graph.related("hub", 1).len() <= 64);
    }

    #[test]
    fn ingest_thread_builds_mentions() {
        let graph = KnowledgeGraph::new();
        let entries = vec![
            ThreadEntry {
                timestamp: Utc::now(),
                text: "looked at repo".into(),
                references: vec!["repo:nerva".into(), "mem-1".into()],
            },
            ThreadEntry {
                timestamp: Utc::now(),
                text: "again".into(),
                references: vec!["repo:nerva".into()],
            },
        ];

        graph.ingest_thread("thread-1", "Repo work", &entries);

        let entity = graph.entity("thread-1").unwrap();
        assert_eq!(entity.kind, "thread");
        assert_eq!(entity.attributes["entries"], 2);
        // Duplicate reference de-duplicated
        assert_eq!(graph.edge_count(), 2);

        let related = graph.related("thread-1", 1);
        assert_eq!(related.len(), 3);
    }

    #[test]
    fn export_import_round_trip() {
        let graph = KnowledgeGraph::new();
        graph.add_edge("a", "b", "r", attrs());
        let (entities, edges) = graph.export();

        let restored = KnowledgeGraph::new();
        restored.import(entities, edges);
        assert_eq!(restored.related("a", 1).len(), 2);
    }
}
