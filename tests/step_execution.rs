// tests/step_execution.rs
//
// Real processes through the production executor.

#![cfg(unix)]

mod common;
use crate::common::builders::{DefinitionBuilder, JobBuilder, StepBuilder};
use crate::common::{init_tracing, push_trigger, with_timeout};

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pipewright::config::PipelineDefinition;
use pipewright::context::TriggerContext;
use pipewright::controller::RunController;
use pipewright::events::{replay, Event, EventBus};
use pipewright::exec::{Action, ActionInvocation, ActionOutcome, ActionRegistry, FailureReason};
use pipewright::run::Run;
use pipewright::types::{RunStatus, StepStatus, StreamKind};
use tempfile::TempDir;

async fn run_to_end(def: PipelineDefinition, trigger: TriggerContext) -> Run {
    with_timeout(RunController::new().start(def, trigger).wait()).await
}

fn one_step(dir: &TempDir, step: StepBuilder) -> DefinitionBuilder {
    DefinitionBuilder::new("single")
        .log_dir(dir.path())
        .job(JobBuilder::new("ci").step(step))
}

#[tokio::test]
async fn timed_out_step_is_terminated() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = one_step(
        &dir,
        StepBuilder::run("slow", "echo $$ > \"$PIPEWRIGHT_STEP_DIR/pid\"; sleep 30").timeout("1s"),
    )
    .kill_grace("1s")
    .keep_workspace(true)
    .build();

    let started = Instant::now();
    let run = run_to_end(def, push_trigger()).await;

    assert!(started.elapsed() < Duration::from_secs(8), "took {:?}", started.elapsed());
    assert_eq!(run.status, RunStatus::Failed);
    let step = run.step("ci.slow").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.failure, Some(FailureReason::TimedOut { after_ms: 1000 }));

    let pid_file = dir.path().join(run.id.to_string()).join("steps/ci.slow/pid");
    let pid: i32 = std::fs::read_to_string(pid_file).unwrap().trim().parse().unwrap();
    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
    assert!(!alive, "step process {pid} survived its timeout");
}

#[tokio::test]
async fn outputs_flow_to_a_dependent_step() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = DefinitionBuilder::new("outputs")
        .log_dir(dir.path())
        .job(
            JobBuilder::new("build")
                .step(StepBuilder::run("a", "echo \"url=https://x\" >> \"$PIPEWRIGHT_OUTPUT\"").output("url"))
                .step(StepBuilder::run("b", "echo \"deploying ${{ steps.a.outputs.url }}\"")),
        )
        .build();

    let run = run_to_end(def, push_trigger()).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.step("build.a").unwrap().outputs["url"], "https://x");
    assert_eq!(run.step("build.b").unwrap().stdout.text(), "deploying https://x\n");
}

#[tokio::test]
async fn multiline_outputs_use_a_delimiter() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let script = "printf 'notes<<EOF\\nline one\\nline two\\nEOF\\n' >> \"$PIPEWRIGHT_OUTPUT\"";
    let def = one_step(&dir, StepBuilder::run("notes", script).output("notes")).build();

    let run = run_to_end(def, push_trigger()).await;

    assert_eq!(run.step("ci.notes").unwrap().outputs["notes"], "line one\nline two");
}

#[tokio::test]
async fn missing_declared_output_fails_the_step() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = one_step(&dir, StepBuilder::run("quiet", "true").output("url")).build();

    let run = run_to_end(def, push_trigger()).await;

    let step = run.step("ci.quiet").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.exit_code, Some(0));
    assert!(matches!(step.failure, Some(FailureReason::OutputParse { .. })));
}

#[tokio::test]
async fn malformed_output_file_fails_the_step() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = one_step(
        &dir,
        StepBuilder::run("garbled", "echo 'not an assignment' > \"$PIPEWRIGHT_OUTPUT\""),
    )
    .build();

    let run = run_to_end(def, push_trigger()).await;

    match &run.step("ci.garbled").unwrap().failure {
        Some(FailureReason::OutputParse { message }) => assert!(message.contains("line 1")),
        other => panic!("expected output parse failure, got {other:?}"),
    }
}

#[tokio::test]
async fn non_zero_exit_is_reported_with_its_code() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = one_step(&dir, StepBuilder::run("boom", "echo oops >&2; exit 3")).build();

    let run = run_to_end(def, push_trigger()).await;

    let step = run.step("ci.boom").unwrap();
    assert_eq!(step.exit_code, Some(3));
    assert_eq!(step.failure, Some(FailureReason::NonZeroExit { code: Some(3) }));
    assert_eq!(step.stderr.text(), "oops\n");
}

fn stdout_chunks(bus: &EventBus) -> Vec<String> {
    bus.history()
        .into_iter()
        .filter_map(|r| match r.event {
            Event::StepOutputChunk {
                stream: StreamKind::Stdout,
                data,
                ..
            } => Some(data),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn output_past_the_capture_limit_is_still_streamed() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = one_step(
        &dir,
        StepBuilder::run("loud", "for i in $(seq 1 200); do echo \"line $i\"; done"),
    )
    .max_output_bytes(64)
    .build();

    let handle = RunController::new().start(def, push_trigger());
    let bus = Arc::clone(handle.events());
    let run = with_timeout(handle.wait()).await;

    let step = run.step("ci.loud").unwrap();
    assert_eq!(step.status, StepStatus::Succeeded);
    assert!(step.stdout.truncated);
    assert_eq!(step.stdout.bytes.len(), 64);

    let chunks = stdout_chunks(&bus);
    let (notices, lines): (Vec<String>, Vec<String>) =
        chunks.into_iter().partition(|c| c.contains("output truncated"));
    assert_eq!(notices.len(), 1);
    let expected: String = (1..=200).map(|i| format!("line {i}\n")).collect();
    assert_eq!(lines.concat(), expected);
}

#[tokio::test]
async fn secret_across_a_read_boundary_is_masked() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    // 8186 + 6 bytes fill the first 8 KiB read, splitting the secret.
    let def = DefinitionBuilder::new("boundary")
        .log_dir(dir.path())
        .secret("TOKEN_X")
        .job(
            JobBuilder::new("ci").step(
                StepBuilder::run("long", "printf '%8186s' | tr ' ' a; echo \"$T\"")
                    .env("T", "${{ secrets.TOKEN_X }}"),
            ),
        )
        .build();
    let trigger = push_trigger().with_secret("TOKEN_X", "hunter2xyz");

    let handle = RunController::new().start(def, trigger);
    let bus = Arc::clone(handle.events());
    let run = with_timeout(handle.wait()).await;

    let expected = format!("{}***\n", "a".repeat(8186));
    let step = run.step("ci.long").unwrap();
    assert_eq!(step.stdout.text(), expected);
    assert_eq!(stdout_chunks(&bus).concat(), expected);

    let log = std::fs::read_to_string(dir.path().join(run.id.to_string()).join("events.jsonl")).unwrap();
    assert!(!log.contains("hunter2xyz"));
    assert!(!log.contains("hunter2"));
}

#[tokio::test]
async fn multibyte_output_across_a_read_boundary_is_kept() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = one_step(
        &dir,
        StepBuilder::run("utf8", "printf '%8191s' | tr ' ' a; printf '\\303\\251\\n'"),
    )
    .build();

    let handle = RunController::new().start(def, push_trigger());
    let bus = Arc::clone(handle.events());
    let run = with_timeout(handle.wait()).await;

    let mut expected = vec![b'a'; 8191];
    expected.extend_from_slice("é\n".as_bytes());
    assert_eq!(run.step("ci.utf8").unwrap().stdout.bytes, expected);
    assert!(stdout_chunks(&bus).iter().all(|c| !c.contains('\u{FFFD}')));
}

#[tokio::test]
async fn secrets_are_masked_everywhere() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = DefinitionBuilder::new("secrets")
        .log_dir(dir.path())
        .secret("DEPLOY_KEY")
        .job(
            JobBuilder::new("ci").step(
                StepBuilder::run("leak", "echo \"key=$KEY\"; echo \"key=$KEY\" >&2; echo \"echoed=$KEY\" >> \"$PIPEWRIGHT_OUTPUT\"")
                    .env("KEY", "${{ secrets.DEPLOY_KEY }}")
                    .output("echoed"),
            ),
        )
        .build();
    let trigger = push_trigger().with_secret("DEPLOY_KEY", "hunter2-value");

    let run = run_to_end(def, trigger).await;

    let step = run.step("ci.leak").unwrap();
    assert_eq!(step.stdout.text(), "key=***\n");
    assert_eq!(step.stderr.text(), "key=***\n");

    let log = std::fs::read_to_string(dir.path().join(run.id.to_string()).join("events.jsonl")).unwrap();
    assert!(!log.contains("hunter2-value"));
    assert!(log.contains("key=***"));
}

#[tokio::test]
async fn command_actions_receive_inputs() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = DefinitionBuilder::new("actions")
        .log_dir(dir.path())
        .action("greet", "echo \"hello $INPUT_WHO from $INPUT_BUILD_DIR\"")
        .job(
            JobBuilder::new("ci").step(
                StepBuilder::uses("hi", "greet")
                    .with("who", "${{ trigger.repository }}")
                    .with("build-dir", "dist"),
            ),
        )
        .build();

    let run = run_to_end(def, push_trigger()).await;

    assert_eq!(run.step("ci.hi").unwrap().stdout.text(), "hello acme/site from dist\n");
}

#[tokio::test]
async fn unknown_action_is_an_infrastructure_failure() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = one_step(&dir, StepBuilder::uses("nope", "does-not-exist")).build();

    let run = run_to_end(def, push_trigger()).await;

    let step = run.step("ci.nope").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(matches!(step.failure, Some(FailureReason::Infrastructure { .. })));
    assert_eq!(step.attempts, 0);
}

struct Checksum;

impl Action for Checksum {
    fn invoke<'a>(
        &'a self,
        invocation: ActionInvocation<'a>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ActionOutcome>> + Send + 'a>> {
        Box::pin(async move {
            let input = invocation.params.get("input").cloned().unwrap_or_default();
            invocation
                .output
                .write_str(StreamKind::Stdout, &format!("checksumming {input}\n"));
            Ok(ActionOutcome::success().with_output("sum", input.len().to_string()))
        })
    }
}

#[tokio::test]
async fn in_process_actions_produce_outputs() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = DefinitionBuilder::new("in-process")
        .log_dir(dir.path())
        .job(
            JobBuilder::new("ci")
                .step(StepBuilder::uses("sum", "checksum").with("input", "abcd").output("sum"))
                .step(StepBuilder::run("show", "echo \"sum=${{ steps.sum.outputs.sum }}\"")),
        )
        .build();
    let controller = RunController::new().with_actions(ActionRegistry::new().with("checksum", Arc::new(Checksum)));

    let run = with_timeout(controller.start(def, push_trigger()).wait()).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.step("ci.sum").unwrap().stdout.text(), "checksumming abcd\n");
    assert_eq!(run.step("ci.show").unwrap().stdout.text(), "sum=4\n");
}

/// Fails its first `failures` invocations with an error, then succeeds.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }
}

impl Action for Flaky {
    fn invoke<'a>(
        &'a self,
        _invocation: ActionInvocation<'a>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ActionOutcome>> + Send + 'a>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                anyhow::bail!("registry unreachable (call {call})");
            }
            Ok(ActionOutcome::success().with_output("call", call.to_string()))
        })
    }
}

fn flaky_definition(dir: &TempDir, retries: u32) -> PipelineDefinition {
    one_step(dir, StepBuilder::uses("fetch", "flaky").output("call"))
        .dispatch_retries(retries)
        .build()
}

#[tokio::test]
async fn infrastructure_failures_are_retried() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let flaky = Flaky::new(1);
    let controller = RunController::new().with_actions(ActionRegistry::new().with("flaky", flaky.clone()));

    let run = with_timeout(controller.start(flaky_definition(&dir, 1), push_trigger()).wait()).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    let step = run.step("ci.fetch").unwrap();
    assert_eq!(step.attempts, 2);
    assert_eq!(step.outputs["call"], "2");
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retries_are_bounded() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let flaky = Flaky::new(10);
    let controller = RunController::new().with_actions(ActionRegistry::new().with("flaky", flaky.clone()));

    let run = with_timeout(controller.start(flaky_definition(&dir, 2), push_trigger()).wait()).await;

    assert_eq!(run.status, RunStatus::Failed);
    let step = run.step("ci.fetch").unwrap();
    assert_eq!(step.attempts, 3);
    assert!(matches!(
        &step.failure,
        Some(FailureReason::Infrastructure { message }) if message.contains("call 3")
    ));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn no_retries_by_default() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let flaky = Flaky::new(1);
    let controller = RunController::new().with_actions(ActionRegistry::new().with("flaky", flaky.clone()));

    let run = with_timeout(controller.start(flaky_definition(&dir, 0), push_trigger()).wait()).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step("ci.fetch").unwrap().attempts, 1);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelling_a_run_stops_the_running_process() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = one_step(&dir, StepBuilder::run("wait", "echo ready; sleep 30"))
        .kill_grace("1s")
        .build();

    let handle = RunController::new().start(def, push_trigger());
    let mut events = handle.subscribe_from(0);
    while let Some(record) = with_timeout(events.next()).await {
        if matches!(record.event, Event::StepOutputChunk { .. }) {
            break;
        }
    }
    handle.cancel().await;
    let run = with_timeout(handle.wait()).await;

    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.step("ci.wait").unwrap().status, StepStatus::Cancelled);

    let records = replay(&dir.path().join(run.id.to_string()).join("events.jsonl")).unwrap();
    assert!(matches!(
        records.last().map(|r| &r.event),
        Some(Event::RunCompleted {
            status: RunStatus::Cancelled,
            ..
        })
    ));
}
