// src/dag/state_manager.rs

//! Per-run state transitions for nodes in the scheduler.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::context::RunEnvironment;
use crate::dag::graph::{ConditionState, DagGraph, NodeId};
use crate::dag::step_info::{NodeState, StepScope};
use crate::expr::UpstreamStatus;
use crate::types::SkipReason;

/// Nodes whose state changed while settling.
#[derive(Debug, Default)]
pub struct Settled {
    /// Newly `Ready`, in declaration order.
    pub ready: Vec<usize>,
    /// Newly terminal without being dispatched (skipped or cancelled).
    pub terminal: Vec<usize>,
}

/// Aggregate state of the predecessors of node `index`, or `None` while any
/// of them is still non-terminal.
pub fn upstream_status(graph: &DagGraph, states: &[NodeState], index: usize) -> Option<UpstreamStatus> {
    let node = &graph.nodes()[index];
    let mut upstream = UpstreamStatus::succeeded();

    for pred in &node.predecessors {
        let i = graph.index_of(pred)?;
        match states[i] {
            NodeState::Succeeded => {}
            NodeState::Failed => {
                upstream.all_succeeded = false;
                upstream.any_failed = true;
            }
            NodeState::Skipped(_) | NodeState::Cancelled => {
                upstream.all_succeeded = false;
            }
            _ => return None,
        }
    }

    Some(upstream)
}

/// Manages per-run state transitions for nodes.
pub struct StateManager<'a> {
    graph: &'a DagGraph,
    states: &'a mut [NodeState],
}

impl<'a> StateManager<'a> {
    pub fn new(graph: &'a DagGraph, states: &'a mut [NodeState]) -> Self {
        Self { graph, states }
    }

    /// Aggregate predecessor state of node `index`, or `None` while any
    /// predecessor is still non-terminal.
    pub fn upstream_of(&self, index: usize) -> Option<UpstreamStatus> {
        upstream_status(self.graph, self.states, index)
    }

    /// Decide every `Pending` node whose predecessors are all terminal.
    ///
    /// Repeats until nothing changes, so a skip propagates through a whole
    /// chain in one call. With `halted` set, such nodes are cancelled
    /// instead.
    pub fn settle(
        &mut self,
        env: &RunEnvironment,
        outputs: &HashMap<NodeId, BTreeMap<String, String>>,
        halted: bool,
    ) -> Settled {
        let mut settled = Settled::default();

        loop {
            let mut changed = false;

            for index in 0..self.states.len() {
                if self.states[index] != NodeState::Pending {
                    continue;
                }
                let Some(upstream) = self.upstream_of(index) else {
                    continue;
                };

                let node = &self.graph.nodes()[index];
                let next = if halted {
                    NodeState::Cancelled
                } else {
                    match &node.condition {
                        ConditionState::Static(false) => NodeState::Skipped(SkipReason::Condition),
                        ConditionState::Unconditional | ConditionState::Static(true) => {
                            if upstream.all_succeeded {
                                NodeState::Ready
                            } else {
                                NodeState::Skipped(SkipReason::Upstream)
                            }
                        }
                        ConditionState::Deferred(expr) => {
                            if !upstream.all_succeeded && !expr.runs_after_upstream_failure() {
                                NodeState::Skipped(SkipReason::Upstream)
                            } else {
                                let scope = StepScope {
                                    env,
                                    job: &node.job,
                                    outputs,
                                    upstream,
                                };
                                if expr.eval_condition(&scope) {
                                    NodeState::Ready
                                } else {
                                    NodeState::Skipped(SkipReason::Condition)
                                }
                            }
                        }
                    }
                };

                debug!(step = %node.id, state = ?next, "predecessors terminal; node settled");
                self.states[index] = next;
                changed = true;

                if next == NodeState::Ready {
                    settled.ready.push(index);
                } else {
                    settled.terminal.push(index);
                }
            }

            if !changed {
                break;
            }
        }

        settled.ready.sort_unstable();
        settled
    }

    /// Cancel every node that has not been dispatched yet.
    ///
    /// This includes nodes that would run after a failure: once the run is
    /// halted nothing new starts.
    pub fn cancel_undispatched(&mut self) -> Vec<usize> {
        let mut cancelled = Vec::new();
        for (index, state) in self.states.iter_mut().enumerate() {
            if matches!(state, NodeState::Pending | NodeState::Ready) {
                *state = NodeState::Cancelled;
                cancelled.push(index);
            }
        }
        cancelled
    }

    /// Nodes currently holding a concurrency slot.
    pub fn in_flight(&self) -> Vec<usize> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_in_flight())
            .map(|(i, _)| i)
            .collect()
    }
}
