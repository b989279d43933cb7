// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous, deterministic "core runtime" that
//! consumes [`RuntimeEvent`]s and produces:
//! - an updated scheduler state and run record
//! - a list of "commands" describing what the IO shell should do next
//!
//! The async/IO-heavy shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels
//! - sending `ScheduledStep`s to the executor
//! - publishing events on the bus
//!
//! The core is unit tested without any Tokio, channels, filesystem, or
//! processes.

use std::sync::Arc;

use crate::dag::Scheduler;
use crate::engine::event_handlers::{
    handle_cancel, handle_step_finished, handle_step_started, start_run, CoreStep,
};
use crate::engine::RuntimeEvent;
use crate::exec::Masker;
use crate::run::Run;
use crate::types::RunStatus;

/// Pure core runtime state.
///
/// It has **no** channels, no Tokio types, and does not perform any IO.
#[derive(Debug)]
pub struct CoreRuntime {
    scheduler: Scheduler,
    masker: Arc<Masker>,
}

impl CoreRuntime {
    pub fn new(scheduler: Scheduler, masker: Arc<Masker>) -> Self {
        Self { scheduler, masker }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn is_finished(&self) -> bool {
        self.scheduler.is_finished()
    }

    pub fn outcome(&self) -> RunStatus {
        self.scheduler.outcome()
    }

    /// Seed the run and return the initial commands.
    pub fn start(&mut self, run: &mut Run) -> CoreStep {
        start_run(&mut self.scheduler, run)
    }

    /// Handle a single runtime event, updating `run` and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent, run: &mut Run) -> CoreStep {
        match event {
            RuntimeEvent::StepStarted { node, attempt } => {
                handle_step_started(&mut self.scheduler, run, &node, attempt)
            }
            RuntimeEvent::StepFinished { result } => {
                handle_step_finished(&mut self.scheduler, run, &self.masker, *result)
            }
            RuntimeEvent::CancelRequested => handle_cancel(&mut self.scheduler, run),
        }
    }
}
