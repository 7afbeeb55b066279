//! DAG of named async nodes with dependency edges
//!
//! A [`Dag`] is built once through [`DagBuilder`], validated at construction
//! (unique names, known dependencies, acyclic), and executed by the engine in
//! [`engine`]. Node functions receive the shared [`RunContext`] and report
//! failure through their `Result`; the engine records outcomes as events and
//! never propagates node errors to the caller.

mod engine;
mod validate;

pub use validate::validate;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::context::RunContext;
use crate::error::Result;

/// Stack-allocated deps: most nodes have 0-4 dependencies
pub type DepVec = SmallVec<[Arc<str>; 4]>;

/// Boxed future returned by a node function
pub type NodeFuture = BoxFuture<'static, Result<()>>;

/// A node's async body. Takes the shared context; writes results into
/// `ctx.artifacts` / `ctx.outputs` under keys this node owns exclusively.
pub type NodeFn = Arc<dyn Fn(Arc<RunContext>) -> NodeFuture + Send + Sync>;

/// Retry configuration for a single node
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1)
    pub max_attempts: u32,
    /// Base delay; doubled after every failed attempt
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

/// Immutable node descriptor
pub struct DagNode {
    pub name: Arc<str>,
    pub deps: DepVec,
    pub func: NodeFn,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl std::fmt::Debug for DagNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagNode")
            .field("name", &self.name)
            .field("deps", &self.deps)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Validated DAG, ready for execution
#[derive(Debug)]
pub struct Dag {
    pub name: String,
    nodes: FxHashMap<Arc<str>, Arc<DagNode>>,
    /// Insertion order, kept for deterministic iteration
    order: Vec<Arc<str>>,
    /// Upper bound on concurrently running nodes (None = all ready nodes)
    max_parallel: Option<usize>,
}

impl Dag {
    pub fn builder(name: impl Into<String>) -> DagBuilder {
        DagBuilder {
            name: name.into(),
            nodes: Vec::new(),
            max_parallel: None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<DagNode>> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn node_names(&self) -> &[Arc<str>] {
        &self.order
    }

    pub(crate) fn nodes(&self) -> &FxHashMap<Arc<str>, Arc<DagNode>> {
        &self.nodes
    }
}

/// Options applied to a node beyond name/deps/body
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeOpts {
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

/// Builder that validates on `build()`
pub struct DagBuilder {
    name: String,
    nodes: Vec<DagNode>,
    max_parallel: Option<usize>,
}

impl DagBuilder {
    /// Register a node with default options.
    pub fn node<F, Fut>(self, name: &str, deps: &[&str], func: F) -> Self
    where
        F: Fn(Arc<RunContext>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.node_opts(name, deps, NodeOpts::default(), func)
    }

    /// Register a node with timeout/retry options.
    pub fn node_opts<F, Fut>(mut self, name: &str, deps: &[&str], opts: NodeOpts, func: F) -> Self
    where
        F: Fn(Arc<RunContext>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let func: NodeFn = Arc::new(move |ctx| Box::pin(func(ctx)));
        self.nodes.push(DagNode {
            name: Arc::from(name),
            deps: deps.iter().map(|d| Arc::from(*d)).collect(),
            func,
            timeout: opts.timeout,
            retry: opts.retry,
        });
        self
    }

    /// Cap the number of concurrently running nodes.
    pub fn max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = Some(n.max(1));
        self
    }

    /// Validate structure and produce the executable DAG.
    ///
    /// Fails on duplicate names, unknown dependencies, and cycles.
    pub fn build(self) -> Result<Dag> {
        let mut nodes: FxHashMap<Arc<str>, Arc<DagNode>> =
            FxHashMap::with_capacity_and_hasher(self.nodes.len(), Default::default());
        let mut order = Vec::with_capacity(self.nodes.len());

        for node in self.nodes {
            let name = Arc::clone(&node.name);
            if nodes.insert(Arc::clone(&name), Arc::new(node)).is_some() {
                return Err(crate::error::NervaError::DuplicateNode {
                    dag: self.name,
                    node: name.to_string(),
                });
            }
            order.push(name);
        }

        let dag = Dag {
            name: self.name,
            nodes,
            order,
            max_parallel: self.max_parallel,
        };
        validate(&dag)?;
        Ok(dag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NervaError;

    fn noop() -> impl Fn(Arc<RunContext>) -> std::future::Ready<Result<()>> + Send + Sync {
        |_ctx| std::future::ready(Ok(()))
    }

    #[test]
    fn build_linear_dag() {
        let dag = Dag::builder("test")
            .node("a", &[], |_| async { Ok(()) })
            .node("b", &["a"], |_| async { Ok(()) })
            .build()
            .unwrap();

        assert_eq!(dag.len(), 2);
        assert_eq!(dag.get("b").unwrap().deps[0].as_ref(), "a");
    }

    #[test]
    fn duplicate_node_rejected() {
        let err = Dag::builder("test")
            .node("a", &[], noop())
            .node("a", &[], noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, NervaError::DuplicateNode { .. }));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = Dag::builder("test")
            .node("a", &["ghost"], noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, NervaError::MissingDependency { .. }));
    }

    #[test]
    fn cycle_rejected_at_construction() {
        let err = Dag::builder("test")
            .node("a", &["c"], noop())
            .node("b", &["a"], noop())
            .node("c", &["b"], noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, NervaError::CycleDetected { .. }));
    }

    #[test]
    fn self_loop_is_cycle() {
        let err = Dag::builder("test")
            .node("a", &["a"], noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, NervaError::CycleDetected { .. }));
    }

    #[test]
    fn empty_dag_builds() {
        let dag = Dag::builder("empty").build().unwrap();
        assert!(dag.is_empty());
    }
}
