//! Structural DAG validation
//!
//! Cycle detection uses the three-colour DFS algorithm:
//! - White: unvisited
//! - Gray: currently on the DFS stack
//! - Black: fully processed
//!
//! Encountering a Gray node while traversing means a cycle.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::{Dag, DepVec};
use crate::error::{NervaError, Result};

/// Check that all dependencies exist and the graph is acyclic.
pub fn validate(dag: &Dag) -> Result<()> {
    // Successor adjacency from declared deps
    let mut adjacency: FxHashMap<Arc<str>, DepVec> =
        FxHashMap::with_capacity_and_hasher(dag.len(), Default::default());

    for name in dag.node_names() {
        adjacency.entry(Arc::clone(name)).or_default();
    }

    for (name, node) in dag.nodes() {
        for dep in &node.deps {
            if !dag.nodes().contains_key(dep.as_ref()) {
                return Err(NervaError::MissingDependency {
                    node: name.to_string(),
                    dep: dep.to_string(),
                });
            }
            adjacency
                .entry(Arc::clone(dep))
                .or_default()
                .push(Arc::clone(name));
        }
    }

    detect_cycles(dag, &adjacency)
}

fn detect_cycles(dag: &Dag, adjacency: &FxHashMap<Arc<str>, DepVec>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors: FxHashMap<Arc<str>, Color> = dag
        .node_names()
        .iter()
        .map(|id| (Arc::clone(id), Color::White))
        .collect();
    let mut stack: Vec<Arc<str>> = Vec::new();

    fn dfs(
        node: Arc<str>,
        adjacency: &FxHashMap<Arc<str>, DepVec>,
        colors: &mut FxHashMap<Arc<str>, Color>,
        stack: &mut Vec<Arc<str>>,
    ) -> std::result::Result<(), String> {
        colors.insert(Arc::clone(&node), Color::Gray);
        stack.push(Arc::clone(&node));

        if let Some(neighbors) = adjacency.get(&node) {
            for neighbor in neighbors {
                match colors.get(neighbor) {
                    Some(Color::Gray) => {
                        let cycle_start = stack
                            .iter()
                            .position(|x| x.as_ref() == neighbor.as_ref())
                            .unwrap_or(0);
                        let cycle: Vec<&str> =
                            stack[cycle_start..].iter().map(|s| s.as_ref()).collect();
                        return Err(format!("{} → {}", cycle.join(" → "), neighbor));
                    }
                    Some(Color::White) | None => {
                        dfs(Arc::clone(neighbor), adjacency, colors, stack)?;
                    }
                    Some(Color::Black) => {}
                }
            }
        }

        stack.pop();
        colors.insert(node, Color::Black);
        Ok(())
    }

    for name in dag.node_names() {
        if colors.get(name) == Some(&Color::White) {
            if let Err(cycle) = dfs(Arc::clone(name), adjacency, &mut colors, &mut stack) {
                return Err(NervaError::CycleDetected {
                    dag: dag.name.clone(),
                    cycle,
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag_of(edges: &[(&str, &[&str])]) -> Result<Dag> {
        let mut builder = Dag::builder("validate_test");
        for (name, deps) in edges {
            builder = builder.node(name, deps, |_| async { Ok(()) });
        }
        builder.build()
    }

    #[test]
    fn diamond_is_acyclic() {
        let dag = dag_of(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ])
        .unwrap();
        assert_eq!(dag.len(), 4);
    }

    #[test]
    fn disconnected_components_are_fine() {
        assert!(dag_of(&[("a", &[]), ("b", &["a"]), ("c", &[]), ("d", &["c"])]).is_ok());
    }

    #[test]
    fn cycle_path_names_the_nodes() {
        let err = dag_of(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("NERVA-001"));
        assert!(msg.contains("→"));
    }
}
