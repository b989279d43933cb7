// src/engine/runtime.rs

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::errors::Result;
use crate::events::EventBus;
use crate::exec::ExecutorBackend;
use crate::run::Run;
use crate::types::RunStatus;

use super::core::CoreRuntime;
use super::event_handlers::CoreStep;
use super::{CoreCommand, RuntimeEvent};

/// Drives the DAG scheduler in response to `RuntimeEvent`s, and delegates
/// actual step execution to an `ExecutorBackend`.
///
/// This is a pure IO shell around `CoreRuntime`, which contains all the
/// runtime semantics. This struct handles async IO: reading events from
/// the channel, publishing on the bus and dispatching steps to the
/// executor. It is the only writer of the shared [`Run`] record.
pub struct Runtime<E: ExecutorBackend> {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    executor: E,
    bus: Arc<EventBus>,
    run: Arc<Mutex<Run>>,
}

impl<E: ExecutorBackend> fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<E: ExecutorBackend> Runtime<E> {
    pub fn new(
        core: CoreRuntime,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        executor: E,
        bus: Arc<EventBus>,
        run: Arc<Mutex<Run>>,
    ) -> Self {
        Self {
            core,
            event_rx,
            executor,
            bus,
            run,
        }
    }

    /// Main event loop.
    ///
    /// - Seeds the run.
    /// - Consumes `RuntimeEvent`s from `event_rx` until every step is
    ///   terminal.
    /// - Executes commands returned by the core (emit, dispatch, cancel).
    ///
    /// Returns the scheduler's verdict; the caller finalizes the run.
    pub async fn run(mut self) -> Result<RunStatus> {
        info!(run_id = %self.bus.run_id(), "runtime started");

        let step = {
            let mut run = lock_run(&self.run);
            self.core.start(&mut run)
        };
        self.execute(step).await?;

        while !self.core.is_finished() {
            let event = match self.event_rx.recv().await {
                Some(e) => e,
                None => {
                    return Err(anyhow!("runtime event channel closed before the run finished").into());
                }
            };

            debug!(event = event.kind(), step = ?event.node(), "runtime received event");

            let step = {
                let mut run = lock_run(&self.run);
                self.core.step(event, &mut run)
            };
            self.execute(step).await?;
        }

        let outcome = self.core.outcome();
        info!(?outcome, "runtime exiting");
        Ok(outcome)
    }

    /// Execute the commands of one core step, in order.
    async fn execute(&mut self, step: CoreStep) -> Result<()> {
        for command in step.commands {
            match command {
                CoreCommand::Emit(event) => {
                    self.bus.publish(event);
                }
                CoreCommand::DispatchSteps(steps) => {
                    let names: Vec<_> = steps.iter().map(|s| s.node.as_str()).collect();
                    debug!(?names, "dispatching ready steps");
                    self.executor.spawn_ready_steps(steps).await?;
                }
                CoreCommand::CancelSteps(nodes) => {
                    debug!(?nodes, "cancelling in-flight steps");
                    self.executor.cancel_steps(nodes).await?;
                }
            }
        }

        if !step.keep_running {
            debug!("core reports all steps terminal");
        }
        Ok(())
    }
}

fn lock_run(run: &Mutex<Run>) -> MutexGuard<'_, Run> {
    run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
