// src/exec/executor_loop.rs

//! Background loop that owns every running step of a run.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::dag::{NodeId, ScheduledStep};
use crate::engine::RuntimeEvent;
use crate::exec::step_runner::{run_step, ExecContext};

/// Requests the runtime sends to the executor loop.
#[derive(Debug, Clone)]
pub enum ExecutorCommand {
    Run(ScheduledStep),
    Cancel(NodeId),
}

/// Internal handle for a dispatched step.
///
/// - `cancel` flips to `true` to ask the step runner to stop the process.
/// - `handle` is the Tokio task that is actually running the step.
struct ActiveStep {
    cancel: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

/// Spawn the background executor loop for one run.
///
/// Each dispatched step runs in its own Tokio task. The loop ends when the
/// returned sender is dropped; steps still running at that point keep
/// running to completion.
pub fn spawn_executor(
    ctx: Arc<ExecContext>,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
) -> mpsc::Sender<ExecutorCommand> {
    let (tx, mut rx) = mpsc::channel::<ExecutorCommand>(64);

    tokio::spawn(async move {
        info!(run_id = %ctx.env.run_id(), "executor loop started");

        let mut active: HashMap<NodeId, ActiveStep> = HashMap::new();

        while let Some(command) = rx.recv().await {
            active.retain(|_, step| !step.handle.is_finished());

            match command {
                ExecutorCommand::Run(step) => start_step(step, &ctx, &runtime_tx, &mut active),
                ExecutorCommand::Cancel(node) => cancel_step(&node, &active),
            }
        }

        debug!(still_running = active.len(), "executor loop finished (channel closed)");
    });

    tx
}

fn start_step(
    step: ScheduledStep,
    ctx: &Arc<ExecContext>,
    runtime_tx: &mpsc::Sender<RuntimeEvent>,
    active: &mut HashMap<NodeId, ActiveStep>,
) {
    let node = step.node.clone();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let ctx = Arc::clone(ctx);
    let rt_tx = runtime_tx.clone();
    let spawn_node = node.clone();

    let handle = tokio::spawn(async move {
        run_step(step, ctx, rt_tx, cancel_rx).await;
        debug!(step = %spawn_node, "step runner future finished");
    });

    active.insert(
        node,
        ActiveStep {
            cancel: cancel_tx,
            handle,
        },
    );
}

fn cancel_step(node: &str, active: &HashMap<NodeId, ActiveStep>) {
    match active.get(node) {
        Some(step) => {
            info!(step = %node, "cancelling running step");
            if step.cancel.send(true).is_err() {
                debug!(step = %node, "step already finished while cancelling");
            }
        }
        None => {
            debug!(step = %node, "cancel for step that is not running; ignoring");
        }
    }
}
