// src/exec/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The runtime talks to an `ExecutorBackend` instead of a raw mpsc sender.
//! This makes it easy to swap in a fake executor in tests while keeping the
//! production executor in [`executor_loop`](super::executor_loop).
//!
//! - `RealExecutorBackend` is the default implementation. It wraps the
//!   executor loop and forwards run and cancel requests over a channel.
//! - Tests can provide their own `ExecutorBackend` that, for example,
//!   records which steps were dispatched and emits `StepFinished` events
//!   directly.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;

use crate::dag::{NodeId, ScheduledStep};
use crate::engine::RuntimeEvent;
use crate::errors::Result;

use super::executor_loop::{spawn_executor, ExecutorCommand};
use super::step_runner::ExecContext;

/// Trait abstracting how scheduled steps are executed.
pub trait ExecutorBackend: Send {
    /// Start the given steps.
    ///
    /// Every dispatched step must eventually be answered with exactly one
    /// `RuntimeEvent::StepFinished`.
    fn spawn_ready_steps(
        &mut self,
        steps: Vec<ScheduledStep>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Ask the given in-flight steps to stop. They still report
    /// `StepFinished` (normally as cancelled).
    fn cancel_steps(&mut self, nodes: Vec<NodeId>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Real executor backend: runs steps as processes or in-process actions.
pub struct RealExecutorBackend {
    tx: mpsc::Sender<ExecutorCommand>,
}

impl RealExecutorBackend {
    /// Create a backend wired to the given runtime event sender.
    ///
    /// This spawns the background executor loop immediately.
    pub fn new(ctx: Arc<ExecContext>, runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        let tx = spawn_executor(ctx, runtime_tx);
        Self { tx }
    }

    fn send_all(&self, commands: Vec<ExecutorCommand>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        // Clone the sender so the future doesn't borrow `self` across `await`.
        let tx = self.tx.clone();

        Box::pin(async move {
            for command in commands {
                tx.send(command)
                    .await
                    .map_err(|_| anyhow!("executor loop is no longer running"))?;
            }
            Ok(())
        })
    }
}

impl ExecutorBackend for RealExecutorBackend {
    fn spawn_ready_steps(
        &mut self,
        steps: Vec<ScheduledStep>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.send_all(steps.into_iter().map(ExecutorCommand::Run).collect())
    }

    fn cancel_steps(&mut self, nodes: Vec<NodeId>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.send_all(nodes.into_iter().map(ExecutorCommand::Cancel).collect())
    }
}
