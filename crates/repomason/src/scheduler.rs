//! Ready-set parallel executor over the build graph.
//!
//! A bounded pool of worker threads drains the set of nodes whose
//! dependencies are complete. The first failure cancels the whole fleet:
//! the cancellation token is tripped, in-flight builds observe it at their
//! next check (or when their child process is terminated), and the first
//! error is re-raised once the pool has drained. Cancellations caused by
//! an earlier failure are recorded on the node but not reported as errors
//! in their own right.

use std::collections::BTreeSet;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use repomason_process::CancelToken;

use crate::engine::Reporter;
use crate::errors::{DeadlockedGraph, is_cancelled};
use crate::node::{BuildGraph, NodeId, NodeState};

/// Run `build` over every node of the graph, dependencies first, with at
/// most `jobs` builds in flight.
///
/// `build` must leave its node `Finished` or `Skipped` on success; on
/// error the scheduler records `Failed` (or `Cancelled`) itself.
pub fn execute<F>(
    graph: &BuildGraph,
    jobs: usize,
    token: &CancelToken,
    reporter: &Arc<Mutex<dyn Reporter + Send>>,
    build: F,
) -> Result<()>
where
    F: Fn(NodeId) -> Result<()> + Send + Sync,
{
    let jobs = jobs.max(1);
    token.check()?;

    let build = &build;
    let mut waiting: BTreeSet<NodeId> = graph.nodes().map(|(id, _)| id).collect();
    let mut in_flight = 0usize;
    let mut first_failure: Option<anyhow::Error> = None;

    let (tx, rx) = mpsc::channel::<(NodeId, Result<()>)>();

    std::thread::scope(|scope| {
        loop {
            // Submit every ready node while the pool has room. After a
            // failure nothing new is submitted; the pool only drains.
            if first_failure.is_none() {
                let ready: Vec<NodeId> = waiting
                    .iter()
                    .copied()
                    .filter(|&id| graph.ready(id))
                    .take(jobs - in_flight)
                    .collect();
                for id in ready {
                    waiting.remove(&id);
                    graph.node(id).set_state(NodeState::Building);
                    reporter.lock().unwrap().info(&format!(
                        "{} on {}: building",
                        graph.node(id).name,
                        graph.node(id).release
                    ));
                    let tx = tx.clone();
                    scope.spawn(move || {
                        let result = build(id);
                        let _ = tx.send((id, result));
                    });
                    in_flight += 1;
                }
            }

            if in_flight == 0 {
                if waiting.is_empty() || first_failure.is_some() {
                    break;
                }
                first_failure = Some(
                    DeadlockedGraph {
                        waiting: waiting.len(),
                    }
                    .into(),
                );
                break;
            }

            let (id, result) = rx.recv().expect("worker channel closed");
            in_flight -= 1;
            let node = graph.node(id);
            match result {
                Ok(()) => {
                    reporter
                        .lock()
                        .unwrap()
                        .info(&format!("{} on {}: done", node.name, node.release));
                }
                Err(err) => {
                    let cancelled = is_cancelled(&err);
                    node.set_state(if cancelled {
                        NodeState::Cancelled
                    } else {
                        NodeState::Failed
                    });
                    if first_failure.is_none() {
                        // First failure preempts the rest of the fleet.
                        token.request_cancel();
                        if !cancelled {
                            reporter
                                .lock()
                                .unwrap()
                                .error(&format!("{} on {}: failed", node.name, node.release));
                        }
                        first_failure = Some(err);
                    } else if !cancelled {
                        reporter
                            .lock()
                            .unwrap()
                            .warn(&format!("{} on {}: also failed", node.name, node.release));
                    }
                }
            }
        }
    });

    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
