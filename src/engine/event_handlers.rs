// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.

use chrono::Utc;
use tracing::{debug, warn};

use crate::dag::{NodeState, ScheduledStep, Scheduler, SchedulerStep, NodeId};
use crate::events::Event;
use crate::exec::{Masker, StepResult};
use crate::run::Run;
use crate::types::{RunStatus, StepStatus};

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Publish this event on the run's bus.
    Emit(Event),
    /// Send these steps to the executor.
    DispatchSteps(Vec<ScheduledStep>),
    /// Ask the executor to stop these in-flight steps.
    CancelSteps(Vec<NodeId>),
}

/// Decision returned by the core after handling a single event.
#[derive(Debug, Clone)]
pub struct CoreStep {
    /// Commands the IO shell should execute, in order.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

/// Seed the run.
pub fn start_run(scheduler: &mut Scheduler, run: &mut Run) -> CoreStep {
    run.status = RunStatus::Running;
    let step = scheduler.start();
    let mut commands = Vec::new();
    apply_scheduler_step(scheduler, run, step, &mut commands);
    CoreStep {
        commands,
        keep_running: !scheduler.is_finished(),
    }
}

/// Handle a step start report.
pub fn handle_step_started(scheduler: &mut Scheduler, run: &mut Run, node: &str, attempt: u32) -> CoreStep {
    if scheduler.handle_started(node) {
        if let Some(record) = run.step_mut(node) {
            record.status = StepStatus::Running;
            record.attempts = attempt;
            record.started_at.get_or_insert_with(Utc::now);
        }
    }
    CoreStep {
        commands: Vec::new(),
        keep_running: !scheduler.is_finished(),
    }
}

/// Handle a step completion report.
pub fn handle_step_finished(
    scheduler: &mut Scheduler,
    run: &mut Run,
    masker: &Masker,
    result: StepResult,
) -> CoreStep {
    let mut commands = Vec::new();

    let in_flight = scheduler
        .state_of(&result.node)
        .is_some_and(|s| s.is_in_flight());
    if !in_flight {
        warn!(step = %result.node, "completion for step that is not in flight; ignoring");
        return CoreStep {
            commands,
            keep_running: !scheduler.is_finished(),
        };
    }

    debug!(step = %result.node, status = %result.status, "recording step completion");
    let step = scheduler.handle_completion(&result.node, result.status, result.outputs.clone());

    commands.push(CoreCommand::Emit(completed_event(&result, masker)));
    match run.step_mut(&result.node) {
        Some(record) => *record = result,
        None => run.steps.push(result),
    }

    apply_scheduler_step(scheduler, run, step, &mut commands);

    CoreStep {
        commands,
        keep_running: !scheduler.is_finished(),
    }
}

/// Handle an external cancellation request.
pub fn handle_cancel(scheduler: &mut Scheduler, run: &mut Run) -> CoreStep {
    let step = scheduler.cancel();
    let mut commands = Vec::new();
    apply_scheduler_step(scheduler, run, step, &mut commands);
    CoreStep {
        commands,
        keep_running: !scheduler.is_finished(),
    }
}

/// Mirror a scheduler step into the run record and turn it into commands.
///
/// Completions of settled nodes are emitted before new dispatches, and
/// every `StepDispatched` is emitted before the step reaches the executor.
fn apply_scheduler_step(scheduler: &Scheduler, run: &mut Run, step: SchedulerStep, commands: &mut Vec<CoreCommand>) {
    for (node, state) in step.settled {
        let result = match state {
            NodeState::Skipped(reason) => StepResult::skipped(node.clone(), reason),
            NodeState::Cancelled => StepResult::cancelled(node.clone()),
            other => {
                warn!(step = %node, state = ?other, "unexpected settled state");
                continue;
            }
        };
        commands.push(CoreCommand::Emit(Event::StepCompleted {
            node: node.clone(),
            status: result.status,
            exit_code: None,
            failure: None,
            skip_reason: result.skip_reason,
            outputs: Default::default(),
        }));
        match run.step_mut(&node) {
            Some(record) => *record = result,
            None => run.steps.push(result),
        }
    }

    if !step.cancel_running.is_empty() {
        commands.push(CoreCommand::CancelSteps(step.cancel_running));
    }

    if !step.dispatched.is_empty() {
        for dispatched in &step.dispatched {
            if let Some(record) = run.step_mut(&dispatched.node) {
                record.status = StepStatus::Running;
            }
            commands.push(CoreCommand::Emit(Event::StepDispatched {
                node: dispatched.node.clone(),
            }));
        }
        commands.push(CoreCommand::DispatchSteps(step.dispatched));
    }

    if step.run_just_finished {
        debug!(outcome = ?scheduler.outcome(), "all steps terminal");
    }
}

fn completed_event(result: &StepResult, masker: &Masker) -> Event {
    Event::StepCompleted {
        node: result.node.clone(),
        status: result.status,
        exit_code: result.exit_code,
        failure: result.failure.clone(),
        skip_reason: result.skip_reason,
        outputs: result
            .outputs
            .iter()
            .map(|(k, v)| (k.clone(), masker.mask(v)))
            .collect(),
    }
}
