use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{EngineConfig, StepKind};
use crate::context::RunEnvironment;
use crate::dag::graph::{DagGraph, NodeId};
use crate::dag::scheduler_step::SchedulerStep;
use crate::dag::state_manager::{upstream_status, StateManager};
use crate::dag::step_info::{NodeState, ScheduledStep, StepScope};
use crate::expr::{interpolate, references_secret, UpstreamStatus};
use crate::types::{RunStatus, SkipPolicy, SkipReason, StepStatus};

/// Scheduling policy for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Maximum number of dispatched or running steps.
    pub concurrency: usize,
    /// Stop dispatching and cancel in-flight steps after the first failure.
    pub fail_fast: bool,
    pub skip_policy: SkipPolicy,
    /// Timeout for steps that do not set their own.
    pub step_timeout: Duration,
}

impl SchedulerOptions {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            concurrency: cfg.concurrency.max(1),
            fail_fast: cfg.fail_fast,
            skip_policy: cfg.skip_policy,
            step_timeout: cfg.step_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    FailFast,
    Cancelled,
}

/// Scheduler holds the immutable DAG plus the mutable state of one run.
///
/// It is a pure state machine: the runtime feeds it executor reports and
/// cancel requests, and it answers with a [`SchedulerStep`] describing
/// which steps to dispatch, which nodes settled without running and which
/// in-flight steps to stop. It never performs IO.
///
/// Invariants:
/// - a node is dispatched only after all its predecessors are terminal;
/// - at most `concurrency` nodes are dispatched or running at once;
/// - every node reaches exactly one terminal state;
/// - once halted (fail-fast or cancel) nothing new is dispatched.
#[derive(Debug)]
pub struct Scheduler {
    graph: Arc<DagGraph>,
    env: Arc<RunEnvironment>,
    options: SchedulerOptions,
    states: Vec<NodeState>,
    outputs: HashMap<NodeId, BTreeMap<String, String>>,
    /// Ready node indices; lowest declared index dispatches first.
    ready: BTreeSet<usize>,
    halt: Option<Halt>,
    started: bool,
    finished: bool,
}

impl Scheduler {
    pub fn new(graph: Arc<DagGraph>, env: Arc<RunEnvironment>, options: SchedulerOptions) -> Self {
        let states = vec![NodeState::Pending; graph.len()];
        Self {
            graph,
            env,
            options,
            states,
            outputs: HashMap::new(),
            ready: BTreeSet::new(),
            halt: None,
            started: false,
            finished: false,
        }
    }

    pub fn graph(&self) -> &DagGraph {
        &self.graph
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Current state of `node`, or `None` if it is unknown.
    pub fn state_of(&self, node: &str) -> Option<NodeState> {
        self.graph.index_of(node).map(|i| self.states[i])
    }

    /// Outputs recorded for a succeeded node.
    pub fn outputs_of(&self, node: &str) -> Option<&BTreeMap<String, String>> {
        self.outputs.get(node)
    }

    /// Number of nodes currently dispatched or running.
    pub fn in_flight_count(&self) -> usize {
        self.states.iter().filter(|s| s.is_in_flight()).count()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_some()
    }

    /// Seed the run: settle roots and dispatch up to the concurrency limit.
    pub fn start(&mut self) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if self.started {
            warn!("scheduler start called twice; ignoring");
            return step;
        }
        self.started = true;
        debug!(nodes = self.graph.len(), concurrency = self.options.concurrency, "scheduler: starting run");
        self.advance(&mut step);
        step
    }

    /// Record that the executor actually started `node`.
    pub fn handle_started(&mut self, node: &str) -> bool {
        match self.graph.index_of(node) {
            Some(i) if self.states[i] == NodeState::Dispatched => {
                self.states[i] = NodeState::Running;
                true
            }
            Some(i) => {
                debug!(step = %node, state = ?self.states[i], "start report for node not awaiting start; ignoring");
                false
            }
            None => {
                warn!(step = %node, "start report for unknown node; ignoring");
                false
            }
        }
    }

    /// Record the terminal status of an in-flight node.
    pub fn handle_completion(
        &mut self,
        node: &str,
        status: StepStatus,
        outputs: BTreeMap<String, String>,
    ) -> SchedulerStep {
        let mut step = SchedulerStep::default();

        let Some(index) = self.graph.index_of(node) else {
            warn!(step = %node, "completion for unknown node; ignoring");
            return step;
        };
        if !self.states[index].is_in_flight() {
            warn!(step = %node, state = ?self.states[index], "completion for node not in flight; ignoring");
            return step;
        }

        let next = match status {
            StepStatus::Succeeded => {
                self.outputs.insert(node.to_string(), outputs);
                NodeState::Succeeded
            }
            StepStatus::Failed => NodeState::Failed,
            StepStatus::Cancelled => NodeState::Cancelled,
            other => {
                warn!(step = %node, status = %other, "non-terminal completion status; treating as failed");
                NodeState::Failed
            }
        };
        self.states[index] = next;
        debug!(step = %node, state = ?next, "node completed");

        if next == NodeState::Failed && self.options.fail_fast && self.halt.is_none() {
            info!(step = %node, "step failed; fail-fast halting run");
            self.halt = Some(Halt::FailFast);
            self.halt_undispatched(&mut step);
        }

        self.advance(&mut step);
        step
    }

    /// External cancellation: cancel everything not yet dispatched and ask
    /// the executor to stop in-flight steps.
    pub fn cancel(&mut self) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if self.finished {
            debug!("cancel requested after run finished; ignoring");
            return step;
        }
        if self.halt == Some(Halt::Cancelled) {
            return step;
        }

        info!("run cancellation requested");
        self.halt = Some(Halt::Cancelled);
        self.halt_undispatched(&mut step);
        self.advance(&mut step);
        step
    }

    /// Final run status once every node is terminal.
    ///
    /// - `Failed` if any node failed;
    /// - `Cancelled` if the run was cancelled externally;
    /// - `Failed` if a node was cancelled for any other reason, or (with
    ///   [`SkipPolicy::Fail`]) skipped because of a skipped upstream;
    /// - `Succeeded` otherwise.
    pub fn outcome(&self) -> RunStatus {
        if !self.finished {
            return RunStatus::Running;
        }
        if self.states.contains(&NodeState::Failed) {
            return RunStatus::Failed;
        }
        if self.halt == Some(Halt::Cancelled) {
            return RunStatus::Cancelled;
        }
        if self.states.contains(&NodeState::Cancelled) {
            return RunStatus::Failed;
        }
        if self.options.skip_policy == SkipPolicy::Fail
            && self.states.contains(&NodeState::Skipped(SkipReason::Upstream))
        {
            return RunStatus::Failed;
        }
        RunStatus::Succeeded
    }

    fn halt_undispatched(&mut self, step: &mut SchedulerStep) {
        let mut manager = StateManager::new(&self.graph, &mut self.states);
        let cancelled = manager.cancel_undispatched();
        let in_flight = manager.in_flight();

        self.ready.clear();
        for i in cancelled {
            step.settled.push((self.graph.nodes()[i].id.clone(), NodeState::Cancelled));
        }
        for i in in_flight {
            step.cancel_running.push(self.graph.nodes()[i].id.clone());
        }
    }

    /// Settle whatever can be settled, then fill free slots.
    fn advance(&mut self, step: &mut SchedulerStep) {
        let halted = self.halt.is_some();
        let mut manager = StateManager::new(&self.graph, &mut self.states);
        let settled = manager.settle(&self.env, &self.outputs, halted);

        for i in settled.terminal {
            step.settled.push((self.graph.nodes()[i].id.clone(), self.states[i]));
        }
        self.ready.extend(settled.ready);

        while !halted && self.in_flight_count() < self.options.concurrency {
            let Some(index) = self.ready.pop_first() else {
                break;
            };
            self.states[index] = NodeState::Dispatched;
            let scheduled = self.scheduled_step(index);
            debug!(step = %scheduled.node, "dependencies satisfied; dispatching");
            step.dispatched.push(scheduled);
        }

        if !self.finished && self.states.iter().all(NodeState::is_terminal) {
            self.finished = true;
            step.run_just_finished = true;
            info!(outcome = ?self.outcome(), "scheduler: all nodes terminal; run finished");
        }
    }

    fn scheduled_step(&self, index: usize) -> ScheduledStep {
        let node = &self.graph.nodes()[index];
        let upstream =
            upstream_status(&self.graph, &self.states, index).unwrap_or_else(UpstreamStatus::succeeded);
        let scope = StepScope {
            env: &self.env,
            job: &node.job,
            outputs: &self.outputs,
            upstream,
        };

        // Templates were checked when the graph was built.
        let resolve = |template: &str| {
            interpolate(template, &scope).unwrap_or_else(|e| {
                warn!(step = %node.id, error = %e, "failed to interpolate template; using it verbatim");
                template.to_string()
            })
        };

        let kind = match &node.spec.kind {
            StepKind::Command { run } => StepKind::Command { run: resolve(run) },
            StepKind::Action { uses } => StepKind::Action { uses: uses.clone() },
        };
        let params = node
            .spec
            .with
            .iter()
            .map(|(k, v)| (k.clone(), resolve(v)))
            .collect();
        let secret_params = node
            .spec
            .with
            .iter()
            .filter(|(_, v)| references_secret(v))
            .map(|(k, _)| k.clone())
            .collect();
        let env = node
            .spec
            .env
            .iter()
            .map(|(k, v)| (k.clone(), resolve(v)))
            .collect();

        ScheduledStep {
            node: node.id.clone(),
            job: node.job.clone(),
            step: node.spec.id.clone(),
            kind,
            params,
            secret_params,
            env,
            outputs: node.spec.outputs.clone(),
            timeout: node.spec.timeout.unwrap_or(self.options.step_timeout),
            working_directory: node.spec.working_directory.clone(),
        }
    }
}
