//! DAG execution engine
//!
//! Ready-set scheduling: each round marks nodes with failed or skipped
//! dependencies as skipped, spawns every node whose dependencies are all ok
//! onto a `JoinSet`, and drains it. Rounds repeat until every node reaches a
//! terminal state.
//!
//! The engine is failure-proof by contract: node errors are captured into
//! `ctx.events` and `execute` always returns the context. Cancellation is
//! observed between rounds and inside each running node.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use super::{Dag, DagNode};
use crate::context::{NodeEvent, NodeStatus, RunContext};
use crate::error::NervaError;

impl Dag {
    /// Run all nodes respecting dependencies; returns the completed context.
    ///
    /// A node runs only when every dependency finished `Ok`. Nodes whose
    /// dependencies failed or were skipped become `Skipped`. Independent
    /// branches keep running after a failure. Within a round, ready nodes are
    /// spawned in name order for deterministic interleaving in tests.
    #[instrument(skip(self, ctx), fields(dag = %self.name, nodes = self.len()))]
    pub async fn execute(&self, ctx: Arc<RunContext>) -> Arc<RunContext> {
        ctx.mark_started();

        let mut status: FxHashMap<Arc<str>, NodeStatus> = self
            .node_names()
            .iter()
            .map(|n| (Arc::clone(n), NodeStatus::Pending))
            .collect();

        let permits = self
            .max_parallel
            .map(|n| Arc::new(Semaphore::new(n)));

        loop {
            if ctx.is_cancelled() {
                self.skip_remaining(&ctx, &mut status, "cancelled");
                break;
            }

            // Propagate skips from failed/skipped dependencies.
            let mut propagated = false;
            for name in self.node_names() {
                if status[name] != NodeStatus::Pending {
                    continue;
                }
                let node = &self.nodes()[name];
                let blocked_by = node.deps.iter().find(|d| {
                    matches!(status[d.as_ref()], NodeStatus::Failed | NodeStatus::Skipped)
                });
                if let Some(dep) = blocked_by {
                    status.insert(Arc::clone(name), NodeStatus::Skipped);
                    ctx.push_event(NodeEvent::finished(
                        Arc::clone(name),
                        NodeStatus::Skipped,
                        None,
                        Some(format!("dependency '{}' did not complete", dep)),
                        0,
                    ));
                    propagated = true;
                }
            }

            // Collect ready nodes, name-sorted for determinism.
            let mut ready: Vec<Arc<DagNode>> = self
                .node_names()
                .iter()
                .filter(|n| status[*n] == NodeStatus::Pending)
                .filter(|n| {
                    self.nodes()[*n]
                        .deps
                        .iter()
                        .all(|d| status[d.as_ref()] == NodeStatus::Ok)
                })
                .map(|n| Arc::clone(&self.nodes()[n]))
                .collect();
            ready.sort_by(|a, b| a.name.cmp(&b.name));

            if ready.is_empty() {
                if status.values().all(|s| s.is_terminal()) {
                    break;
                }
                if propagated {
                    continue;
                }
                // Unreachable after build-time validation; don't hang.
                warn!(dag = %self.name, "no ready nodes but DAG not complete");
                self.skip_remaining(&ctx, &mut status, "unreachable");
                break;
            }

            let mut join_set: JoinSet<(Arc<str>, NodeStatus)> = JoinSet::new();
            for node in ready {
                status.insert(Arc::clone(&node.name), NodeStatus::Running);
                let ctx = Arc::clone(&ctx);
                let permits = permits.clone();
                join_set.spawn(async move {
                    let _permit = match permits {
                        Some(sem) => sem.acquire_owned().await.ok(),
                        None => None,
                    };
                    run_node(node, ctx).await
                });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((name, outcome)) => {
                        status.insert(name, outcome);
                    }
                    Err(e) => {
                        // A panicked node is a failed node; find which one by
                        // elimination at the end of the round.
                        warn!(error = %e, "node task panicked");
                        for (name, s) in status.iter_mut() {
                            if *s == NodeStatus::Running {
                                *s = NodeStatus::Failed;
                                ctx.push_event(NodeEvent::finished(
                                    Arc::clone(name),
                                    NodeStatus::Failed,
                                    None,
                                    Some(format!("node panicked: {}", e)),
                                    1,
                                ));
                                break;
                            }
                        }
                    }
                }
            }
        }

        ctx.mark_finished();
        ctx
    }

    fn skip_remaining(
        &self,
        ctx: &RunContext,
        status: &mut FxHashMap<Arc<str>, NodeStatus>,
        reason: &str,
    ) {
        for name in self.node_names() {
            if !status[name].is_terminal() {
                status.insert(Arc::clone(name), NodeStatus::Skipped);
                ctx.push_event(NodeEvent::finished(
                    Arc::clone(name),
                    NodeStatus::Skipped,
                    None,
                    Some(reason.to_string()),
                    0,
                ));
            }
        }
    }
}

/// Execute one node with its retry policy and timeout.
///
/// Only the terminal transition of the final attempt is recorded as
/// `Ok`/`Failed`; intermediate failed attempts stay transparent to
/// dependents, per the retry contract.
async fn run_node(node: Arc<DagNode>, ctx: Arc<RunContext>) -> (Arc<str>, NodeStatus) {
    let name = Arc::clone(&node.name);
    let max_attempts = node.retry.map(|r| r.max_attempts).unwrap_or(1).max(1);
    let backoff = node
        .retry
        .map(|r| r.backoff)
        .unwrap_or(Duration::from_millis(500));

    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let running = NodeEvent::running(Arc::clone(&name), attempt);
        let started_at = running.started_at;
        ctx.push_event(running);

        let result = attempt_node(&node, &ctx).await;

        match result {
            Ok(()) => {
                ctx.push_event(NodeEvent::finished(
                    Arc::clone(&name),
                    NodeStatus::Ok,
                    started_at,
                    None,
                    attempt,
                ));
                return (name, NodeStatus::Ok);
            }
            Err(e) => {
                let cancelled = matches!(e, NervaError::Cancelled);
                last_error = e.to_string();
                debug!(node = %name, attempt, error = %last_error, "node attempt failed");

                if attempt < max_attempts && !cancelled && !ctx.is_cancelled() {
                    // Geometric backoff with ±10% jitter.
                    let base = backoff.as_millis() as f64 * 2f64.powi(attempt as i32 - 1);
                    let jitter = 1.0 + (rand::random::<f64>() - 0.5) * 0.2;
                    tokio::time::sleep(Duration::from_millis((base * jitter) as u64)).await;
                    continue;
                }

                ctx.push_event(NodeEvent::finished(
                    Arc::clone(&name),
                    NodeStatus::Failed,
                    started_at,
                    Some(last_error.clone()),
                    attempt,
                ));
                return (name, NodeStatus::Failed);
            }
        }
    }

    // max_attempts >= 1 makes the loop return; keep the compiler honest.
    ctx.push_event(NodeEvent::finished(
        Arc::clone(&name),
        NodeStatus::Failed,
        None,
        Some(last_error),
        max_attempts,
    ));
    (name, NodeStatus::Failed)
}

async fn attempt_node(node: &DagNode, ctx: &Arc<RunContext>) -> crate::error::Result<()> {
    let fut = (node.func)(Arc::clone(ctx));
    let token = ctx.cancel_token().clone();

    let guarded = async {
        tokio::select! {
            // A node that finishes in the same poll as a cancellation counts
            // as finished.
            biased;
            r = fut => r,
            _ = token.cancelled() => Err(NervaError::Cancelled),
        }
    };

    match node.timeout {
        Some(t) if t.is_zero() => Err(NervaError::NodeTimeout {
            node: node.name.to_string(),
            timeout_ms: 0,
        }),
        Some(t) => match tokio::time::timeout(t, guarded).await {
            Ok(r) => r,
            Err(_) => Err(NervaError::NodeTimeout {
                node: node.name.to_string(),
                timeout_ms: t.as_millis() as u64,
            }),
        },
        None => guarded.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{NodeOpts, RetryPolicy};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn linear_chain_runs_in_order() {
        let dag = Dag::builder("chain")
            .node("first", &[], |ctx| async move {
                ctx.set_artifact("first", json!(1));
                Ok(())
            })
            .node("second", &["first"], |ctx| async move {
                let prior = ctx.artifact("first").unwrap();
                ctx.set_output("second", json!(prior.as_i64().unwrap() + 1));
                Ok(())
            })
            .build()
            .unwrap();

        let ctx = dag.execute(Arc::new(RunContext::new())).await;

        assert_eq!(ctx.output("second"), Some(json!(2)));
        assert_eq!(ctx.node_status("first"), NodeStatus::Ok);
        assert_eq!(ctx.node_status("second"), NodeStatus::Ok);
    }

    #[tokio::test]
    async fn dependency_completion_happens_before_dependent_start() {
        let dag = Dag::builder("hb")
            .node("up", &[], |_| async { Ok(()) })
            .node("down", &["up"], |_| async { Ok(()) })
            .build()
            .unwrap();

        let ctx = dag.execute(Arc::new(RunContext::new())).await;
        let outcomes = ctx.node_outcomes();

        let up_finished = outcomes
            .iter()
            .find(|e| e.node.as_ref() == "up")
            .and_then(|e| e.finished_at)
            .unwrap();
        let down_started = ctx
            .events()
            .iter()
            .find(|e| e.node.as_ref() == "down" && e.status == NodeStatus::Running)
            .and_then(|e| e.started_at)
            .unwrap();

        assert!(up_finished <= down_started);
    }

    #[tokio::test]
    async fn failure_skips_dependents_but_not_siblings() {
        let dag = Dag::builder("partial")
            .node("boom", &[], |_| async {
                Err(NervaError::Internal {
                    reason: "boom".into(),
                })
            })
            .node("after_boom", &["boom"], |ctx| async move {
                ctx.set_output("after_boom", json!("ran"));
                Ok(())
            })
            .node("independent", &[], |ctx| async move {
                ctx.set_output("independent", json!("ran"));
                Ok(())
            })
            .build()
            .unwrap();

        let ctx = dag.execute(Arc::new(RunContext::new())).await;

        assert_eq!(ctx.node_status("boom"), NodeStatus::Failed);
        assert_eq!(ctx.node_status("after_boom"), NodeStatus::Skipped);
        assert_eq!(ctx.node_status("independent"), NodeStatus::Ok);
        assert_eq!(ctx.output("after_boom"), None);
        assert_eq!(ctx.output("independent"), Some(json!("ran")));
    }

    #[tokio::test]
    async fn skip_cascades_transitively() {
        let dag = Dag::builder("cascade")
            .node("a", &[], |_| async {
                Err(NervaError::Internal { reason: "x".into() })
            })
            .node("b", &["a"], |_| async { Ok(()) })
            .node("c", &["b"], |_| async { Ok(()) })
            .build()
            .unwrap();

        let ctx = dag.execute(Arc::new(RunContext::new())).await;
        assert_eq!(ctx.node_status("b"), NodeStatus::Skipped);
        assert_eq!(ctx.node_status("c"), NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn zero_timeout_is_immediate_timeout() {
        let dag = Dag::builder("t0")
            .node_opts(
                "never",
                &[],
                NodeOpts {
                    timeout: Some(Duration::ZERO),
                    retry: None,
                },
                |_| async { Ok(()) },
            )
            .build()
            .unwrap();

        let ctx = dag.execute(Arc::new(RunContext::new())).await;
        assert_eq!(ctx.node_status("never"), NodeStatus::Failed);
        let outcome = &ctx.node_outcomes()[0];
        assert!(outcome.error.as_ref().unwrap().contains("NERVA-011"));
    }

    #[tokio::test]
    async fn timeout_cancels_only_that_node() {
        let dag = Dag::builder("slow")
            .node_opts(
                "slow",
                &[],
                NodeOpts {
                    timeout: Some(Duration::from_millis(20)),
                    retry: None,
                },
                |_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
            )
            .node("fast", &[], |ctx| async move {
                ctx.set_output("fast", json!("done"));
                Ok(())
            })
            .build()
            .unwrap();

        let ctx = dag.execute(Arc::new(RunContext::new())).await;
        assert_eq!(ctx.node_status("slow"), NodeStatus::Failed);
        assert_eq!(ctx.node_status("fast"), NodeStatus::Ok);
    }

    #[tokio::test]
    async fn retry_reruns_failed_node() {
        static CALLS: AtomicU32 = AtomicU32::new(0);

        let dag = Dag::builder("flaky")
            .node_opts(
                "flaky",
                &[],
                NodeOpts {
                    timeout: None,
                    retry: Some(RetryPolicy::new(3, Duration::from_millis(1))),
                },
                |ctx| async move {
                    let n = CALLS.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(NervaError::LlmUnavailable {
                            reason: "transient".into(),
                        })
                    } else {
                        ctx.set_output("flaky", json!(n));
                        Ok(())
                    }
                },
            )
            .build()
            .unwrap();

        let ctx = dag.execute(Arc::new(RunContext::new())).await;
        assert_eq!(ctx.node_status("flaky"), NodeStatus::Ok);
        assert_eq!(ctx.output("flaky"), Some(json!(3)));
        // Three Running transitions, one terminal Ok.
        let events = ctx.events();
        let runs = events
            .iter()
            .filter(|e| e.status == NodeStatus::Running)
            .count();
        assert_eq!(runs, 3);
        assert_eq!(ctx.node_outcomes().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_skips_pending_nodes() {
        let ctx = Arc::new(RunContext::new());
        let token = ctx.cancel_token().clone();

        let dag = Dag::builder("cancel")
            .node("canceller", &[], |ctx| async move {
                ctx.cancel_token().cancel();
                Ok(())
            })
            .node("after", &["canceller"], |_| async { Ok(()) })
            .build()
            .unwrap();

        let ctx = dag.execute(ctx).await;
        assert!(token.is_cancelled());
        assert_eq!(ctx.node_status("canceller"), NodeStatus::Ok);
        assert_eq!(ctx.node_status("after"), NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn running_node_observes_cancellation() {
        let ctx = Arc::new(RunContext::new());
        let token = ctx.cancel_token().clone();

        let dag = Dag::builder("midflight")
            .node("stuck", &[], |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .build()
            .unwrap();

        let handle = tokio::spawn(async move { dag.execute(ctx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let ctx = handle.await.unwrap();
        assert_eq!(ctx.node_status("stuck"), NodeStatus::Failed);
        assert!(ctx.finished_at().is_some());
    }

    #[tokio::test]
    async fn sibling_outputs_are_disjoint() {
        let dag = Dag::builder("siblings")
            .node("left", &[], |ctx| async move {
                ctx.set_output("left", json!("L"));
                Ok(())
            })
            .node("right", &[], |ctx| async move {
                ctx.set_output("right", json!("R"));
                Ok(())
            })
            .build()
            .unwrap();

        let ctx = dag.execute(Arc::new(RunContext::new())).await;
        let outputs = ctx.outputs_snapshot();
        assert_eq!(outputs.len(), 2);
    }

    #[tokio::test]
    async fn max_parallel_bounds_concurrency() {
        static PEAK: AtomicU32 = AtomicU32::new(0);
        static CURRENT: AtomicU32 = AtomicU32::new(0);

        let mut builder = Dag::builder("bounded").max_parallel(2);
        for i in 0..6 {
            builder = builder.node(&format!("n{}", i), &[], |_| async {
                let now = CURRENT.fetch_add(1, Ordering::SeqCst) + 1;
                PEAK.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                CURRENT.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let dag = builder.build().unwrap();

        dag.execute(Arc::new(RunContext::new())).await;
        assert!(PEAK.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn empty_dag_completes() {
        let dag = Dag::builder("empty").build().unwrap();
        let ctx = dag.execute(Arc::new(RunContext::new())).await;
        assert!(ctx.started_at().is_some());
        assert!(ctx.finished_at().is_some());
        assert!(ctx.events().is_empty());
    }
}
