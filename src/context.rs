//! RunContext - shared state carried through one workflow execution
//!
//! A `RunContext` travels through every node of a DAG run. Inputs are fixed
//! before execution; artifacts and outputs are written by nodes as they run
//! and become visible to all downstream nodes. Sibling nodes must write
//! disjoint key sets.
//!
//! The context is also the execution log: every node status transition is
//! appended to `events` in real time, and callers inspect those events to
//! learn per-node outcomes (the engine itself never propagates node errors).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Terminal and transient states of a DAG node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Ok,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Failed | Self::Skipped)
    }
}

/// One status transition of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node: Arc<str>,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempt number that produced this transition (1-based)
    pub attempt: u32,
}

impl NodeEvent {
    pub fn running(node: Arc<str>, attempt: u32) -> Self {
        Self {
            node,
            status: NodeStatus::Running,
            started_at: Some(Utc::now()),
            finished_at: None,
            error: None,
            attempt,
        }
    }

    pub fn finished(
        node: Arc<str>,
        status: NodeStatus,
        started_at: Option<DateTime<Utc>>,
        error: Option<String>,
        attempt: u32,
    ) -> Self {
        Self {
            node,
            status,
            started_at,
            finished_at: Some(Utc::now()),
            error,
            attempt,
        }
    }
}

/// Shared mutable state for one DAG execution
///
/// Cheap to share: value maps are `DashMap` (concurrent writers on disjoint
/// keys), the event list is an append-only `RwLock<Vec<_>>`.
pub struct RunContext {
    pub run_id: String,
    inputs: BTreeMap<String, Value>,
    artifacts: DashMap<String, Value>,
    outputs: DashMap<String, Value>,
    extra: DashMap<String, Value>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    finished_at: RwLock<Option<DateTime<Utc>>>,
    events: RwLock<Vec<NodeEvent>>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new() -> Self {
        Self::with_inputs(BTreeMap::new())
    }

    pub fn with_inputs(inputs: BTreeMap<String, Value>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            inputs,
            artifacts: DashMap::new(),
            outputs: DashMap::new(),
            extra: DashMap::new(),
            started_at: RwLock::new(None),
            finished_at: RwLock::new(None),
            events: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach an externally owned cancellation token (child of the caller's).
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ── inputs ──────────────────────────────────────────────────────────

    pub fn input(&self, key: &str) -> Option<Value> {
        self.inputs.get(key).cloned()
    }

    pub fn input_str(&self, key: &str) -> Option<String> {
        self.inputs.get(key).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
    }

    pub fn inputs(&self) -> &BTreeMap<String, Value> {
        &self.inputs
    }

    // ── artifacts / outputs / extra ─────────────────────────────────────

    pub fn set_artifact(&self, key: impl Into<String>, value: Value) {
        self.artifacts.insert(key.into(), value);
    }

    pub fn artifact(&self, key: &str) -> Option<Value> {
        self.artifacts.get(key).map(|v| v.clone())
    }

    pub fn artifacts_snapshot(&self) -> BTreeMap<String, Value> {
        self.artifacts
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn set_output(&self, key: impl Into<String>, value: Value) {
        self.outputs.insert(key.into(), value);
    }

    pub fn output(&self, key: &str) -> Option<Value> {
        self.outputs.get(key).map(|v| v.clone())
    }

    pub fn outputs_snapshot(&self) -> BTreeMap<String, Value> {
        self.outputs
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn set_extra(&self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }

    pub fn extra(&self, key: &str) -> Option<Value> {
        self.extra.get(key).map(|v| v.clone())
    }

    // ── lifecycle & events ──────────────────────────────────────────────

    pub fn mark_started(&self) {
        *self.started_at.write() = Some(Utc::now());
    }

    pub fn mark_finished(&self) {
        *self.finished_at.write() = Some(Utc::now());
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.read()
    }

    pub fn push_event(&self, event: NodeEvent) {
        self.events.write().push(event);
    }

    /// All transitions in real-time order.
    pub fn events(&self) -> Vec<NodeEvent> {
        self.events.read().clone()
    }

    /// Latest status of a node (`Pending` if it never transitioned).
    pub fn node_status(&self, node: &str) -> NodeStatus {
        self.events
            .read()
            .iter()
            .rev()
            .find(|e| e.node.as_ref() == node)
            .map(|e| e.status)
            .unwrap_or(NodeStatus::Pending)
    }

    /// Final (terminal) events, one per node, in completion order.
    pub fn node_outcomes(&self) -> Vec<NodeEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Deterministic serializable view (sorted keys).
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            inputs: self.inputs.clone(),
            artifacts: self.artifacts_snapshot(),
            outputs: self.outputs_snapshot(),
            extra: self
                .extra
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            started_at: self.started_at(),
            finished_at: self.finished_at(),
            events: self.events(),
        }
    }

    pub fn from_snapshot(snap: RunSnapshot) -> Self {
        Self {
            run_id: snap.run_id,
            inputs: snap.inputs,
            artifacts: snap.artifacts.into_iter().collect(),
            outputs: snap.outputs.into_iter().collect(),
            extra: snap.extra.into_iter().collect(),
            started_at: RwLock::new(snap.started_at),
            finished_at: RwLock::new(snap.finished_at),
            events: RwLock::new(snap.events),
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("inputs", &self.inputs.len())
            .field("artifacts", &self.artifacts.len())
            .field("outputs", &self.outputs.len())
            .field("events", &self.events.read().len())
            .finish()
    }
}

impl Serialize for RunContext {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RunContext {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_snapshot(RunSnapshot::deserialize(deserializer)?))
    }
}

/// Owned, order-stable view of a `RunContext` used for serialization and
/// structural comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub inputs: BTreeMap<String, Value>,
    pub artifacts: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    pub extra: BTreeMap<String, Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub events: Vec<NodeEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inputs_are_readable() {
        let mut inputs = BTreeMap::new();
        inputs.insert("utterance".to_string(), json!("hello"));
        let ctx = RunContext::with_inputs(inputs);

        assert_eq!(ctx.input_str("utterance"), Some("hello".to_string()));
        assert_eq!(ctx.input("missing"), None);
    }

    #[test]
    fn artifacts_visible_after_write() {
        let ctx = RunContext::new();
        ctx.set_artifact("page_text", json!("content"));
        assert_eq!(ctx.artifact("page_text"), Some(json!("content")));
    }

    #[test]
    fn node_status_follows_transitions() {
        let ctx = RunContext::new();
        let node: Arc<str> = Arc::from("fetch");

        assert_eq!(ctx.node_status("fetch"), NodeStatus::Pending);

        ctx.push_event(NodeEvent::running(Arc::clone(&node), 1));
        assert_eq!(ctx.node_status("fetch"), NodeStatus::Running);

        ctx.push_event(NodeEvent::finished(node, NodeStatus::Ok, None, None, 1));
        assert_eq!(ctx.node_status("fetch"), NodeStatus::Ok);
        assert_eq!(ctx.node_outcomes().len(), 1);
    }

    #[test]
    fn serde_round_trip_preserves_structure() {
        let mut inputs = BTreeMap::new();
        inputs.insert("q".to_string(), json!("find flights"));
        let ctx = RunContext::with_inputs(inputs);
        ctx.mark_started();
        ctx.set_artifact("screenshot", json!("aGVsbG8="));
        ctx.set_output("answer", json!("555-1212"));
        ctx.push_event(NodeEvent::finished(
            Arc::from("qa"),
            NodeStatus::Ok,
            Some(Utc::now()),
            None,
            1,
        ));
        ctx.mark_finished();

        let text = serde_json::to_string(&ctx).unwrap();
        let back: RunContext = serde_json::from_str(&text).unwrap();

        assert_eq!(ctx.snapshot(), back.snapshot());
    }

    #[test]
    fn cancellation_token_is_observable() {
        let ctx = RunContext::new();
        assert!(!ctx.is_cancelled());
        ctx.cancel_token().cancel();
        assert!(ctx.is_cancelled());
    }
}
