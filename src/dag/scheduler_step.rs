// src/dag/scheduler_step.rs

//! Step-by-step result type for the scheduler.

use crate::dag::graph::NodeId;
use crate::dag::step_info::{NodeState, ScheduledStep};

/// Structured result of a single scheduler "step".
///
/// The runtime turns this into executor calls and events; tests use it to
/// step the DAG by hand and assert on what changed.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStep {
    /// Steps to hand to the executor now.
    pub dispatched: Vec<ScheduledStep>,
    /// Nodes that became terminal without running (skipped or cancelled),
    /// with their final state.
    pub settled: Vec<(NodeId, NodeState)>,
    /// In-flight nodes the executor should stop.
    pub cancel_running: Vec<NodeId>,
    /// Whether this step made every node terminal.
    pub run_just_finished: bool,
}

impl SchedulerStep {
    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty() && self.settled.is_empty() && self.cancel_running.is_empty()
    }
}
