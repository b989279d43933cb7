use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use pipewright::dag::{NodeId, ScheduledStep};
use pipewright::engine::RuntimeEvent;
use pipewright::errors::Result;
use pipewright::exec::{ExecutorBackend, FailureReason, StepResult};

/// What a fake step does once it has been dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOutcome {
    /// Succeed with these outputs.
    Succeed(BTreeMap<String, String>),
    /// Exit with this non-zero code.
    Fail(i32),
    /// Never finish on its own; only a cancel ends it.
    Hang,
}

/// Per-node behaviour of a [`FakeExecutor`]. Unscripted nodes succeed
/// without outputs.
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    outcomes: HashMap<NodeId, FakeOutcome>,
    delays: HashMap<NodeId, Duration>,
    default_delay: Duration,
}

impl FakeScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed_with(mut self, node: &str, key: &str, value: &str) -> Self {
        let entry = self
            .outcomes
            .entry(node.to_string())
            .or_insert_with(|| FakeOutcome::Succeed(BTreeMap::new()));
        if let FakeOutcome::Succeed(outputs) = entry {
            outputs.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn fail(mut self, node: &str, code: i32) -> Self {
        self.outcomes.insert(node.to_string(), FakeOutcome::Fail(code));
        self
    }

    pub fn hang(mut self, node: &str) -> Self {
        self.outcomes.insert(node.to_string(), FakeOutcome::Hang);
        self
    }

    pub fn delay(mut self, node: &str, delay: Duration) -> Self {
        self.delays.insert(node.to_string(), delay);
        self
    }

    /// Delay for every node without its own.
    pub fn default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    fn outcome_of(&self, node: &str) -> FakeOutcome {
        self.outcomes
            .get(node)
            .cloned()
            .unwrap_or_else(|| FakeOutcome::Succeed(BTreeMap::new()))
    }

    fn delay_of(&self, node: &str) -> Duration {
        self.delays.get(node).copied().unwrap_or(self.default_delay)
    }
}

/// What a [`FakeExecutor`] observed.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    /// Nodes in dispatch order.
    pub dispatched: Vec<NodeId>,
    /// The resolved step each node was dispatched with.
    pub steps: HashMap<NodeId, ScheduledStep>,
    /// Nodes in completion order.
    pub finished: Vec<NodeId>,
    /// Nodes the runtime asked to cancel.
    pub cancel_requests: Vec<NodeId>,
    /// Steps running right now.
    pub running: usize,
    /// Highest value `running` ever reached.
    pub max_running: usize,
}

/// A fake executor that:
/// - records which steps were dispatched and how many ran at once
/// - reports `StepStarted` then, after the scripted delay, `StepFinished`
///   with the scripted outcome
/// - finishes steps as cancelled when the runtime cancels them.
pub struct FakeExecutor {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    script: Arc<FakeScript>,
    log: Arc<Mutex<ExecutionLog>>,
    cancels: Arc<Mutex<HashMap<NodeId, watch::Sender<bool>>>>,
}

impl FakeExecutor {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>, script: FakeScript, log: Arc<Mutex<ExecutionLog>>) -> Self {
        Self {
            runtime_tx,
            script: Arc::new(script),
            log,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn start(&self, step: ScheduledStep) {
        let node = step.node.clone();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.cancels.lock().unwrap().insert(node.clone(), cancel_tx);
        {
            let mut log = self.log.lock().unwrap();
            log.dispatched.push(node.clone());
            log.steps.insert(node.clone(), step);
            log.running += 1;
            log.max_running = log.max_running.max(log.running);
        }

        let tx = self.runtime_tx.clone();
        let log = Arc::clone(&self.log);
        let cancels = Arc::clone(&self.cancels);
        let outcome = self.script.outcome_of(&node);
        let delay = self.script.delay_of(&node);

        tokio::spawn(async move {
            let _ = tx
                .send(RuntimeEvent::StepStarted {
                    node: node.clone(),
                    attempt: 1,
                })
                .await;

            let hang = outcome == FakeOutcome::Hang;
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(delay), if !hang => false,
                _ = wait_cancelled(&mut cancel_rx) => true,
            };

            let result = match (cancelled, outcome) {
                (true, _) | (false, FakeOutcome::Hang) => StepResult::cancelled(node.clone()),
                (false, FakeOutcome::Succeed(outputs)) => StepResult::succeeded(node.clone(), outputs),
                (false, FakeOutcome::Fail(code)) => {
                    StepResult::failed(node.clone(), FailureReason::NonZeroExit { code: Some(code) })
                }
            };

            cancels.lock().unwrap().remove(&node);
            {
                let mut log = log.lock().unwrap();
                log.running -= 1;
                log.finished.push(node.clone());
            }

            let _ = tx
                .send(RuntimeEvent::StepFinished {
                    result: Box::new(result),
                })
                .await;
        });
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl ExecutorBackend for FakeExecutor {
    fn spawn_ready_steps(
        &mut self,
        steps: Vec<ScheduledStep>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        for step in steps {
            self.start(step);
        }
        Box::pin(async { Ok(()) })
    }

    fn cancel_steps(&mut self, nodes: Vec<NodeId>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        {
            let mut log = self.log.lock().unwrap();
            log.cancel_requests.extend(nodes.iter().cloned());
        }
        let cancels = self.cancels.lock().unwrap();
        for node in &nodes {
            if let Some(tx) = cancels.get(node) {
                let _ = tx.send(true);
            }
        }
        Box::pin(async { Ok(()) })
    }
}
