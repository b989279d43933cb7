// src/dag/mod.rs

//! Step DAG and scheduling.
//!
//! - [`graph`] builds the immutable step DAG from a definition.
//! - [`scheduler`] contains the per-run state machine that decides
//!   which steps are ready to run, skipped or cancelled.
//! - [`step_info`] provides node states and the scheduled step type.
//! - [`scheduler_step`] defines the result type for scheduler steps.
//! - [`state_manager`] manages per-run state transitions.

pub mod graph;
pub mod scheduler;
pub mod scheduler_step;
pub mod state_manager;
pub mod step_info;

pub use graph::{ConditionState, DagGraph, DagNode, NodeId};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use scheduler_step::SchedulerStep;
pub use step_info::{NodeState, ScheduledStep, StepScope};
