// src/engine/mod.rs

//! Orchestration engine for a single run.
//!
//! This module ties together:
//! - the DAG scheduler
//! - the run record observers read
//! - the runtime event loop that reacts to:
//!   - steps starting
//!   - steps finishing
//!   - cancellation requests
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`]. The shell is the only writer of scheduler
//! state and the run record.

use crate::dag::NodeId;
use crate::exec::StepResult;

/// Events flowing into the runtime from executors and the run handle.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A dispatched step is actually running.
    StepStarted { node: NodeId, attempt: u32 },
    /// A dispatched step reached a terminal state.
    StepFinished { result: Box<StepResult> },
    /// Cancel the run.
    CancelRequested,
}

impl RuntimeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeEvent::StepStarted { .. } => "step_started",
            RuntimeEvent::StepFinished { .. } => "step_finished",
            RuntimeEvent::CancelRequested => "cancel_requested",
        }
    }

    pub fn node(&self) -> Option<&str> {
        match self {
            RuntimeEvent::StepStarted { node, .. } => Some(node),
            RuntimeEvent::StepFinished { result } => Some(&result.node),
            RuntimeEvent::CancelRequested => None,
        }
    }
}

pub mod core;
pub mod event_handlers;
pub mod runtime;

pub use core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep};
pub use runtime::Runtime;
