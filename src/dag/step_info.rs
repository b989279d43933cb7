// src/dag/step_info.rs

//! Per-run node state and the dispatch payload handed to executors.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use crate::config::StepKind;
use crate::context::RunEnvironment;
use crate::dag::graph::NodeId;
use crate::expr::{EvalContext, OutputRef, UpstreamStatus};
use crate::types::{SkipReason, StepStatus};

/// Scheduler-side state of one node.
///
/// `Ready` and `Dispatched` are scheduler bookkeeping; outside the
/// scheduler they read as [`StepStatus::Pending`] and
/// [`StepStatus::Running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Waiting on predecessors.
    Pending,
    /// Predecessors terminal and condition true; waiting for a slot.
    Ready,
    /// Handed to the executor, not yet reported as started.
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Skipped(SkipReason),
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped(_) | NodeState::Cancelled
        )
    }

    /// Whether the node currently holds a concurrency slot.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, NodeState::Dispatched | NodeState::Running)
    }

    pub fn status(&self) -> StepStatus {
        match self {
            NodeState::Pending | NodeState::Ready => StepStatus::Pending,
            NodeState::Dispatched | NodeState::Running => StepStatus::Running,
            NodeState::Succeeded => StepStatus::Succeeded,
            NodeState::Failed => StepStatus::Failed,
            NodeState::Skipped(_) => StepStatus::Skipped,
            NodeState::Cancelled => StepStatus::Cancelled,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            NodeState::Skipped(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// A step the scheduler wants executed now, with every placeholder
/// resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledStep {
    pub node: NodeId,
    pub job: String,
    pub step: String,
    /// Command text or action name, after interpolation.
    pub kind: StepKind,
    /// Resolved `with` parameters.
    pub params: BTreeMap<String, String>,
    /// Names of parameters whose template read a secret.
    pub secret_params: BTreeSet<String>,
    /// Resolved step-local environment.
    pub env: BTreeMap<String, String>,
    /// Output keys the step declared.
    pub outputs: Vec<String>,
    pub timeout: Duration,
    pub working_directory: Option<String>,
}

/// Evaluation scope of one node: the run environment, outputs produced so
/// far and the state of its predecessors.
pub struct StepScope<'a> {
    pub env: &'a RunEnvironment,
    pub job: &'a str,
    pub outputs: &'a HashMap<NodeId, BTreeMap<String, String>>,
    pub upstream: UpstreamStatus,
}

impl EvalContext for StepScope<'_> {
    fn lookup(&self, path: &[String]) -> Option<String> {
        match OutputRef::from_path(path, self.job) {
            Some(reference) => self
                .outputs
                .get(&reference.node_id())
                .and_then(|outputs| outputs.get(&reference.key))
                .cloned(),
            None => self.env.lookup(path),
        }
    }

    fn upstream(&self) -> UpstreamStatus {
        self.upstream
    }
}
