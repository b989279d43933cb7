// src/exec/step_runner.rs

//! Runs one scheduled step to completion.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ActionConfig, StepKind};
use crate::context::RunEnvironment;
use crate::dag::ScheduledStep;
use crate::engine::RuntimeEvent;
use crate::events::EventBus;
use crate::exec::action::{input_var, Action, ActionInvocation, ActionRegistry, ResolvedAction};
use crate::exec::output::{parse_output_file, Masker, OutputSink};
use crate::exec::process::{shell_command, terminate};
use crate::exec::result::{FailureReason, StepResult};
use crate::types::{StepStatus, StreamKind};
use crate::workspace::Workspace;

/// Longest piece of output forwarded as one chunk when a line never ends.
const MAX_CHUNK: u64 = 8 * 1024;

/// Everything a step needs from its run, shared by all steps.
#[derive(Debug)]
pub struct ExecContext {
    pub env: Arc<RunEnvironment>,
    pub bus: Arc<EventBus>,
    pub actions: Arc<ActionRegistry>,
    /// `[action.*]` commands declared by the definition.
    pub declared_actions: BTreeMap<String, ActionConfig>,
    pub workspace: Workspace,
    pub masker: Arc<Masker>,
    pub kill_grace: Duration,
    pub max_output_bytes: usize,
    pub dispatch_retries: u32,
}

/// How the step's body ended, before outputs are collected.
enum Finish {
    Exited {
        code: Option<i32>,
        success: bool,
        outputs: BTreeMap<String, String>,
    },
    TimedOut,
    Cancelled,
    /// The attempt failed before the step could run; may be retried.
    Retryable(String),
    Infrastructure(String),
}

/// What a step runs, once its `uses` name is resolved.
enum Body {
    Script {
        script: String,
        /// Action-level defaults; the step environment wins.
        defaults: BTreeMap<String, String>,
    },
    InProcess(Arc<dyn Action>),
}

/// Run `step` and report `StepFinished` to the runtime.
///
/// `StepStarted` is reported once the process (or in-process action) is
/// actually running.
pub async fn run_step(
    step: ScheduledStep,
    ctx: Arc<ExecContext>,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    cancel: watch::Receiver<bool>,
) {
    let node = step.node.clone();
    let result = execute_step(&step, &ctx, &runtime_tx, cancel).await;

    info!(
        step = %node,
        status = %result.status,
        exit_code = ?result.exit_code,
        failure = ?result.failure,
        "step finished"
    );

    if runtime_tx
        .send(RuntimeEvent::StepFinished {
            result: Box::new(result),
        })
        .await
        .is_err()
    {
        warn!(step = %node, "runtime gone before step completion could be reported");
    }
}

/// Execute `step` and build its [`StepResult`].
pub async fn execute_step(
    step: &ScheduledStep,
    ctx: &ExecContext,
    runtime_tx: &mpsc::Sender<RuntimeEvent>,
    mut cancel: watch::Receiver<bool>,
) -> StepResult {
    let mut result = StepResult::pending(step.node.clone());
    result.started_at = Some(Utc::now());

    let sink = OutputSink::new(
        step.node.clone(),
        Arc::clone(&ctx.bus),
        Arc::clone(&ctx.masker),
        ctx.max_output_bytes,
    );

    let finish = match resolve_body(step, ctx) {
        Err(message) => Finish::Infrastructure(message),
        Ok(body) => run_attempts(step, ctx, &body, &sink, runtime_tx, &mut cancel, &mut result).await,
    };

    let (stdout, stderr) = sink.finish();
    result.stdout = stdout;
    result.stderr = stderr;
    result.ended_at = Some(Utc::now());

    match finish {
        Finish::Exited {
            code,
            success: true,
            outputs,
        } => {
            result.exit_code = code;
            match collect_outputs(step, ctx, outputs).await {
                Ok(outputs) => {
                    result.status = StepStatus::Succeeded;
                    result.outputs = outputs;
                }
                Err(message) => {
                    result.status = StepStatus::Failed;
                    result.failure = Some(FailureReason::OutputParse { message });
                }
            }
        }
        Finish::Exited { code, .. } => {
            result.exit_code = code;
            result.status = StepStatus::Failed;
            result.failure = Some(FailureReason::NonZeroExit { code });
        }
        Finish::TimedOut => {
            result.status = StepStatus::Failed;
            result.failure = Some(FailureReason::TimedOut {
                after_ms: step.timeout.as_millis() as u64,
            });
        }
        Finish::Cancelled => {
            result.status = StepStatus::Cancelled;
        }
        Finish::Retryable(message) | Finish::Infrastructure(message) => {
            result.status = StepStatus::Failed;
            result.failure = Some(FailureReason::Infrastructure { message });
        }
    }

    result
}

fn resolve_body(step: &ScheduledStep, ctx: &ExecContext) -> Result<Body, String> {
    match &step.kind {
        StepKind::Command { run } => Ok(Body::Script {
            script: run.clone(),
            defaults: BTreeMap::new(),
        }),
        StepKind::Action { uses } => match ctx.actions.resolve(uses, &ctx.declared_actions) {
            None => Err(format!("unknown action '{uses}'")),
            Some(ResolvedAction::Command(action)) => Ok(Body::Script {
                script: action.cmd,
                defaults: action.env,
            }),
            Some(ResolvedAction::InProcess(action)) => Ok(Body::InProcess(action)),
        },
    }
}

/// Run `body`, retrying attempts that failed before the step could run up
/// to `dispatch_retries` times.
#[allow(clippy::too_many_arguments)]
async fn run_attempts(
    step: &ScheduledStep,
    ctx: &ExecContext,
    body: &Body,
    sink: &Arc<OutputSink>,
    runtime_tx: &mpsc::Sender<RuntimeEvent>,
    cancel: &mut watch::Receiver<bool>,
    result: &mut StepResult,
) -> Finish {
    let max_attempts = ctx.dispatch_retries + 1;
    let mut attempt = 0;

    loop {
        if *cancel.borrow() {
            return Finish::Cancelled;
        }
        attempt += 1;
        result.attempts = attempt;

        let finish = match prepare(step, ctx) {
            Err(message) => Finish::Retryable(message),
            Ok((workdir, env)) => {
                debug!(
                    step = %step.node,
                    attempt,
                    workdir = %workdir.display(),
                    params = ?redacted_params(step),
                    "executing step"
                );
                match body {
                    Body::Script { script, defaults } => {
                        let mut env = env;
                        for (k, v) in defaults {
                            env.entry(k.clone()).or_insert_with(|| v.clone());
                        }
                        run_process(step, ctx, script, &env, &workdir, sink, runtime_tx, cancel, attempt).await
                    }
                    Body::InProcess(action) => {
                        report_started(runtime_tx, &step.node, attempt).await;
                        let invocation = ActionInvocation {
                            node: &step.node,
                            params: &step.params,
                            env: &env,
                            workdir: &workdir,
                            output: sink,
                        };
                        tokio::select! {
                            res = action.invoke(invocation) => match res {
                                Ok(outcome) => Finish::Exited {
                                    code: Some(outcome.exit_code),
                                    success: outcome.exit_code == 0,
                                    outputs: outcome.outputs,
                                },
                                Err(err) => Finish::Retryable(format!("action failed: {err:#}")),
                            },
                            _ = tokio::time::sleep(step.timeout) => Finish::TimedOut,
                            _ = cancelled(cancel) => Finish::Cancelled,
                        }
                    }
                }
            }
        };

        match finish {
            Finish::Retryable(message) if attempt < max_attempts => {
                warn!(step = %step.node, attempt, max_attempts, error = %message, "step attempt failed; retrying");
            }
            other => return other,
        }
    }
}

/// Create the step's directories and assemble its environment.
fn prepare(step: &ScheduledStep, ctx: &ExecContext) -> Result<(PathBuf, BTreeMap<String, String>), String> {
    let (job_dir, step_dir) = ctx
        .workspace
        .prepare_step(&step.job, &step.node)
        .map_err(|e| format!("preparing workspace: {e}"))?;

    let workdir = match &step.working_directory {
        Some(sub) => {
            let dir = job_dir.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| format!("creating {}: {e}", dir.display()))?;
            dir
        }
        None => job_dir.clone(),
    };

    let mut env = ctx.env.vars().clone();
    env.insert("PIPEWRIGHT_JOB".to_string(), step.job.clone());
    env.insert("PIPEWRIGHT_STEP".to_string(), step.node.clone());
    env.insert("PIPEWRIGHT_WORKSPACE".to_string(), path_string(&job_dir));
    env.insert("PIPEWRIGHT_STEP_DIR".to_string(), path_string(&step_dir));
    env.insert(
        "PIPEWRIGHT_OUTPUT".to_string(),
        path_string(&ctx.workspace.output_file(&step.node)),
    );
    for (k, v) in &step.params {
        env.insert(input_var(k), v.clone());
    }
    // Step-local values win over run-scoped ones.
    for (k, v) in &step.env {
        env.insert(k.clone(), v.clone());
    }

    Ok((workdir, env))
}

#[allow(clippy::too_many_arguments)]
async fn run_process(
    step: &ScheduledStep,
    ctx: &ExecContext,
    script: &str,
    env: &BTreeMap<String, String>,
    workdir: &Path,
    sink: &Arc<OutputSink>,
    runtime_tx: &mpsc::Sender<RuntimeEvent>,
    cancel: &mut watch::Receiver<bool>,
    attempt: u32,
) -> Finish {
    let mut child = match shell_command(script, env, workdir).spawn() {
        Ok(child) => child,
        Err(err) => return Finish::Retryable(format!("spawning process: {err}")),
    };

    info!(step = %step.node, pid = ?child.id(), attempt, "step process started");
    report_started(runtime_tx, &step.node, attempt).await;

    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(stdout, StreamKind::Stdout, Arc::clone(sink))));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(stderr, StreamKind::Stderr, Arc::clone(sink))));
    }

    let finish = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Finish::Exited {
                code: status.code(),
                success: status.success(),
                outputs: BTreeMap::new(),
            },
            Err(err) => Finish::Infrastructure(format!("waiting for process: {err}")),
        },
        _ = tokio::time::sleep(step.timeout) => {
            info!(step = %step.node, timeout_ms = step.timeout.as_millis() as u64, "step timed out; terminating");
            if let Err(err) = terminate(&mut child, ctx.kill_grace).await {
                warn!(step = %step.node, error = %err, "failed to terminate timed out step");
            }
            Finish::TimedOut
        }
        _ = cancelled(cancel) => {
            info!(step = %step.node, "cancellation requested; terminating step");
            if let Err(err) = terminate(&mut child, ctx.kill_grace).await {
                warn!(step = %step.node, error = %err, "failed to terminate cancelled step");
            }
            Finish::Cancelled
        }
    };

    // Background children may keep the pipes open after the main process
    // exits; do not wait on them forever.
    for mut reader in readers {
        if tokio::time::timeout(ctx.kill_grace, &mut reader).await.is_err() {
            debug!(step = %step.node, "output pipe still open after exit; detaching reader");
            reader.abort();
        }
    }

    finish
}

/// Forward one pipe to the sink, line by line.
async fn pump<R: AsyncRead + Unpin>(pipe: R, stream: StreamKind, sink: Arc<OutputSink>) {
    let mut reader = BufReader::new(pipe);
    let mut chunk = Vec::new();

    loop {
        chunk.clear();
        match (&mut reader).take(MAX_CHUNK).read_until(b'\n', &mut chunk).await {
            Ok(0) => break,
            Ok(_) => sink.write(stream, &chunk),
            Err(err) => {
                debug!(?stream, error = %err, "error reading step output");
                break;
            }
        }
    }
}

/// Read the output file and merge it with outputs returned in-process.
///
/// Only declared keys are kept; a declared key that was never written is an
/// error.
async fn collect_outputs(
    step: &ScheduledStep,
    ctx: &ExecContext,
    inline: BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, String> {
    let path = ctx.workspace.output_file(&step.node);
    let mut written = match tokio::fs::read_to_string(&path).await {
        Ok(contents) => parse_output_file(&contents)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
        Err(err) => return Err(format!("reading {}: {err}", path.display())),
    };
    written.extend(inline);

    let mut outputs = BTreeMap::new();
    for key in &step.outputs {
        match written.remove(key) {
            Some(value) => {
                outputs.insert(key.clone(), value);
            }
            None => return Err(format!("declared output '{key}' was not written")),
        }
    }
    if !written.is_empty() {
        debug!(
            step = %step.node,
            keys = ?written.keys().collect::<Vec<_>>(),
            "ignoring undeclared outputs"
        );
    }

    Ok(outputs)
}

async fn report_started(runtime_tx: &mpsc::Sender<RuntimeEvent>, node: &str, attempt: u32) {
    let _ = runtime_tx
        .send(RuntimeEvent::StepStarted {
            node: node.to_string(),
            attempt,
        })
        .await;
}

/// Resolves when cancellation is requested; never if the sender is dropped.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn redacted_params(step: &ScheduledStep) -> BTreeMap<&str, &str> {
    step.params
        .iter()
        .map(|(k, v)| {
            let shown = if step.secret_params.contains(k) { "***" } else { v.as_str() };
            (k.as_str(), shown)
        })
        .collect()
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
