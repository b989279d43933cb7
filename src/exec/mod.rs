// src/exec/mod.rs

//! Step execution layer.
//!
//! This module actually runs the steps the scheduler dispatches, using
//! `tokio::process::Command` for shell commands and command actions, and
//! reports back to the runtime via `RuntimeEvent`s.
//!
//! - [`executor_loop`] owns the background loop that manages running steps.
//! - [`step_runner`] runs a single step: spawn, stream, timeout, outputs.
//! - [`process`] spawns shells and stops whole process trees.
//! - [`output`] captures, masks and parses step output.
//! - [`action`] resolves `uses` names to commands or in-process actions.
//! - [`result`] holds [`StepResult`] and [`FailureReason`].
//! - [`backend`] provides the `ExecutorBackend` trait and the
//!   `RealExecutorBackend` that the runtime uses in production, and which
//!   tests can replace with a fake implementation.

pub mod action;
pub mod backend;
pub mod executor_loop;
pub mod output;
pub mod process;
pub mod result;
pub mod step_runner;

pub use action::{Action, ActionInvocation, ActionOutcome, ActionRegistry};
pub use backend::{ExecutorBackend, RealExecutorBackend};
pub use output::{Masker, OutputSink};
pub use result::{CapturedOutput, FailureReason, StepResult};
pub use step_runner::ExecContext;
