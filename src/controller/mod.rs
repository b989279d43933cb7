// src/controller/mod.rs

//! Run controller: the entry point that turns a definition plus a trigger
//! into a running pipeline.
//!
//! `start` freezes the run environment, builds the step DAG, wires the
//! scheduler, runtime and executor together and hands back a
//! [`RunHandle`]. After the last step it publishes artifacts (only if the
//! run succeeded), tears the workspace down and publishes `RunCompleted`.

pub mod cleanup;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{EngineConfig, PipelineDefinition, PublishConfig};
use crate::context::{RunEnvironment, TriggerContext};
use crate::dag::{DagGraph, Scheduler, SchedulerOptions};
use crate::engine::{CoreRuntime, Runtime, RuntimeEvent};
use crate::errors::Result;
use crate::events::{Event, EventBus, Subscription};
use crate::exec::{ActionRegistry, ExecContext, ExecutorBackend, Masker, RealExecutorBackend, StepResult};
use crate::run::Run;
use crate::types::{RunStatus, StepStatus};
use crate::workspace::Workspace;

pub use cleanup::{
    ArtifactPublisher, CommandPublisher, NoTeardown, PublishRequest, RemoveWorkspace, WorkspaceTeardown,
};

/// Capacity of the runtime event channel of one run.
const RUNTIME_CHANNEL: usize = 256;

/// Starts runs and owns what they share: registered actions and the
/// publish/teardown hooks.
#[derive(Clone, Default)]
pub struct RunController {
    actions: Arc<ActionRegistry>,
    publisher: Option<Arc<dyn ArtifactPublisher>>,
    teardown: Option<Arc<dyn WorkspaceTeardown>>,
}

impl std::fmt::Debug for RunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunController")
            .field("actions", &self.actions)
            .field("publisher", &self.publisher.is_some())
            .field("teardown", &self.teardown.is_some())
            .finish()
    }
}

impl RunController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = Arc::new(actions);
        self
    }

    /// Replace the `[publish].cmd` publisher.
    pub fn with_publisher(mut self, publisher: Arc<dyn ArtifactPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Replace the default workspace removal.
    pub fn with_teardown(mut self, teardown: Arc<dyn WorkspaceTeardown>) -> Self {
        self.teardown = Some(teardown);
        self
    }

    /// Start a run using the definition's own `[config]`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, definition: PipelineDefinition, trigger: TriggerContext) -> RunHandle {
        self.start_with_executor(definition, trigger, RealExecutorBackend::new)
    }

    /// Start a run with engine settings overriding the definition's.
    pub fn start_with(
        &self,
        definition: PipelineDefinition,
        trigger: TriggerContext,
        config: EngineConfig,
    ) -> RunHandle {
        self.start(definition.with_config(config), trigger)
    }

    /// Start a run whose steps are executed by the backend `make_executor`
    /// builds.
    pub fn start_with_executor<E, F>(
        &self,
        definition: PipelineDefinition,
        trigger: TriggerContext,
        make_executor: F,
    ) -> RunHandle
    where
        E: ExecutorBackend + 'static,
        F: FnOnce(Arc<ExecContext>, mpsc::Sender<RuntimeEvent>) -> E,
    {
        let run_id = Uuid::new_v4();
        let config = definition.config().clone();
        let span = info_span!("run", run_id = %run_id, pipeline = %definition.name());
        let _enter = span.enter();

        let env = Arc::new(RunEnvironment::freeze(run_id, &definition, &trigger));
        let workspace = Workspace::new(&config.log_dir, run_id);
        let bus = match EventBus::with_log(run_id, workspace.run_dir()) {
            Ok(bus) => bus,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "event log unavailable; keeping events in memory only");
                EventBus::in_memory(run_id)
            }
        };

        let run = Arc::new(Mutex::new(Run::new(run_id, definition.name(), trigger.summary())));
        let (runtime_tx, runtime_rx) = mpsc::channel(RUNTIME_CHANNEL);

        let graph = match DagGraph::build(&definition, &env) {
            Ok(graph) => graph,
            Err(err) => {
                error!(error = %err, "invalid step graph; nothing will run");
                bus.publish(Event::RunStarted {
                    pipeline: definition.name().to_string(),
                    trigger: trigger.summary(),
                    nodes: Vec::new(),
                });
                let message = err.to_string();
                lock_run(&run).finish(RunStatus::Failed, Some(message.clone()));
                bus.publish(Event::RunCompleted {
                    status: RunStatus::Failed,
                    error: Some(message),
                });
                return RunHandle {
                    run,
                    bus,
                    tx: runtime_tx,
                    join: tokio::spawn(async {}),
                };
            }
        };

        bus.publish(Event::RunStarted {
            pipeline: definition.name().to_string(),
            trigger: trigger.summary(),
            nodes: graph.nodes().iter().map(|n| n.id.clone()).collect(),
        });
        lock_run(&run).steps = graph.nodes().iter().map(|n| StepResult::pending(n.id.clone())).collect();
        info!(steps = graph.len(), "run starting");

        let masker = Arc::new(Masker::new(env.masked_values()));
        let ctx = Arc::new(ExecContext {
            env: Arc::clone(&env),
            bus: Arc::clone(&bus),
            actions: Arc::clone(&self.actions),
            declared_actions: definition.actions().clone(),
            workspace: workspace.clone(),
            masker: Arc::clone(&masker),
            kill_grace: config.kill_grace,
            max_output_bytes: config.max_output_bytes,
            dispatch_retries: config.dispatch_retries,
        });
        let executor = make_executor(ctx, runtime_tx.clone());

        let scheduler = Scheduler::new(
            Arc::new(graph),
            Arc::clone(&env),
            SchedulerOptions::from_config(&config),
        );
        let runtime = Runtime::new(
            CoreRuntime::new(scheduler, Arc::clone(&masker)),
            runtime_rx,
            executor,
            Arc::clone(&bus),
            Arc::clone(&run),
        );

        let finalizer = Finalizer {
            definition,
            env,
            workspace,
            masker,
            bus: Arc::clone(&bus),
            run: Arc::clone(&run),
            publisher: self.publisher.clone(),
            teardown: self
                .teardown
                .clone()
                .unwrap_or_else(|| Arc::new(RemoveWorkspace { keep: config.keep_workspace })),
        };

        drop(_enter);
        let join = tokio::spawn(
            async move {
                let verdict = runtime.run().await;
                finalizer.finish(verdict).await;
            }
            .instrument(span),
        );

        RunHandle {
            run,
            bus,
            tx: runtime_tx,
            join,
        }
    }

    /// Request cancellation of `handle`'s run.
    pub async fn cancel(&self, handle: &RunHandle) {
        handle.cancel().await;
    }

    /// Snapshot of `handle`'s run.
    pub fn status(&self, handle: &RunHandle) -> Run {
        handle.status()
    }
}

/// Handle on one started run.
#[derive(Debug)]
pub struct RunHandle {
    run: Arc<Mutex<Run>>,
    bus: Arc<EventBus>,
    tx: mpsc::Sender<RuntimeEvent>,
    join: JoinHandle<()>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.bus.run_id()
    }

    /// Stop dispatching, cancel in-flight steps and finish the run as
    /// `Cancelled`. Has no effect on a finished run.
    pub async fn cancel(&self) {
        if self.tx.send(RuntimeEvent::CancelRequested).await.is_err() {
            info!(run_id = %self.run_id(), "cancel requested after the run finished");
        }
    }

    /// Cloneable cancel trigger, e.g. for a Ctrl-C handler.
    pub fn canceller(&self) -> RunCanceller {
        RunCanceller {
            tx: self.tx.clone(),
        }
    }

    /// Consistent snapshot of the run record.
    pub fn status(&self) -> Run {
        lock_run(&self.run).clone()
    }

    /// Live events from the start of the run.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Live events starting at `offset`.
    pub fn subscribe_from(&self, offset: u64) -> Subscription {
        self.bus.subscribe_from(offset)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Wait for the run to finish and return its final record.
    pub async fn wait(self) -> Run {
        if let Err(err) = self.join.await {
            error!(error = %err, "run task ended abnormally");
            let mut run = lock_run(&self.run);
            if !run.is_finished() {
                run.finish(RunStatus::Failed, Some(format!("internal error: {err}")));
                self.bus.publish(Event::RunCompleted {
                    status: RunStatus::Failed,
                    error: run.error.clone(),
                });
            }
        }
        lock_run(&self.run).clone()
    }
}

/// Cancels one run; detached from its [`RunHandle`].
#[derive(Debug, Clone)]
pub struct RunCanceller {
    tx: mpsc::Sender<RuntimeEvent>,
}

impl RunCanceller {
    pub async fn cancel(&self) {
        let _ = self.tx.send(RuntimeEvent::CancelRequested).await;
    }
}

/// Post-run work: publish, teardown, final status.
struct Finalizer {
    definition: PipelineDefinition,
    env: Arc<RunEnvironment>,
    workspace: Workspace,
    masker: Arc<Masker>,
    bus: Arc<EventBus>,
    run: Arc<Mutex<Run>>,
    publisher: Option<Arc<dyn ArtifactPublisher>>,
    teardown: Arc<dyn WorkspaceTeardown>,
}

impl Finalizer {
    async fn finish(self, verdict: Result<RunStatus>) {
        let (mut status, mut error) = match verdict {
            Ok(status) => (status, None),
            Err(err) => {
                error!(error = %err, "runtime failed");
                (RunStatus::Failed, Some(format!("internal error: {err}")))
            }
        };

        if status == RunStatus::Succeeded {
            if let Some(publish) = self.definition.publish() {
                if let Err(err) = self.publish(publish).await {
                    let message = self.masker.mask(&format!("publish failed: {err:#}"));
                    error!(error = %message, "publish failed");
                    status = RunStatus::Failed;
                    error = Some(message);
                }
            }
        }

        if let Err(err) = self.teardown.teardown(&self.workspace) {
            warn!(error = %format!("{err:#}"), "workspace teardown failed");
        }

        lock_run(&self.run).finish(status, error.clone());
        info!(%status, "run finished");
        self.bus.publish(Event::RunCompleted { status, error });
    }

    async fn publish(&self, publish: &PublishConfig) -> anyhow::Result<()> {
        let jobs: Vec<&str> = if publish.needs.is_empty() {
            self.definition.jobs().iter().map(|j| j.name.as_str()).collect()
        } else {
            publish.needs.iter().map(String::as_str).collect()
        };

        let unfinished: Vec<String> = {
            let run = lock_run(&self.run);
            run.steps
                .iter()
                .filter(|s| jobs.iter().any(|job| node_in_job(&s.node, job)))
                .filter(|s| s.status != StepStatus::Succeeded)
                .map(|s| s.node.clone())
                .collect()
        };
        if !unfinished.is_empty() {
            info!(?unfinished, "not every step of the published jobs succeeded; skipping publish");
            return Ok(());
        }

        let dir = self.publish_dir(publish, &jobs);
        let request = PublishRequest {
            dir: &dir,
            destination: &publish.destination,
            token: self.env.token(),
            env: self.env.vars(),
        };

        match (&self.publisher, &publish.cmd) {
            (Some(publisher), _) => publisher.publish(request).await,
            (None, Some(cmd)) => {
                let config = self.definition.config();
                let publisher = CommandPublisher::new(
                    cmd.clone(),
                    config.step_timeout,
                    config.kill_grace,
                    (*self.masker).clone(),
                );
                publisher.publish(request).await
            }
            (None, None) => Err(anyhow!("[publish] has no cmd and no publisher is registered")),
        }
    }

    /// `[publish].dir` inside the workspace of the first published job.
    fn publish_dir(&self, publish: &PublishConfig, jobs: &[&str]) -> PathBuf {
        let job = jobs.first().copied().unwrap_or_default();
        self.workspace.job_dir(job).join(&publish.dir)
    }
}

fn node_in_job(node: &str, job: &str) -> bool {
    node.strip_prefix(job).is_some_and(|rest| rest.starts_with('.'))
}

fn lock_run(run: &Mutex<Run>) -> MutexGuard<'_, Run> {
    run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_job_membership_requires_separator() {
        assert!(node_in_job("build.compile", "build"));
        assert!(!node_in_job("builder.compile", "build"));
        assert!(!node_in_job("build", "build"));
    }
}
