// tests/runtime_fake_executor.rs

mod common;
use crate::common::builders::{DefinitionBuilder, JobBuilder, StepBuilder};
use crate::common::fake_executor::{ExecutionLog, FakeExecutor, FakeScript};
use crate::common::{init_tracing, push_trigger, with_timeout};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipewright::config::PipelineDefinition;
use pipewright::controller::{RunController, RunHandle};
use pipewright::events::Event;
use pipewright::run::Run;
use pipewright::types::{RunStatus, SkipReason, StepStatus};
use tempfile::TempDir;

fn start(def: PipelineDefinition, script: FakeScript) -> (RunHandle, Arc<Mutex<ExecutionLog>>) {
    let log = Arc::new(Mutex::new(ExecutionLog::default()));
    let recorder = Arc::clone(&log);
    let handle = RunController::new().start_with_executor(def, push_trigger(), move |_ctx, tx| {
        FakeExecutor::new(tx, script, recorder)
    });
    (handle, log)
}

/// Linear chain: A -> B -> C
fn chain(dir: &TempDir) -> PipelineDefinition {
    DefinitionBuilder::new("chain")
        .log_dir(dir.path())
        .job(
            JobBuilder::new("ci")
                .step(StepBuilder::run("a", "echo a"))
                .step(StepBuilder::run("b", "echo b"))
                .step(StepBuilder::run("c", "echo c")),
        )
        .build()
}

/// A and B independent; C needs both.
fn fan_in(dir: &TempDir, fail_fast: bool) -> PipelineDefinition {
    DefinitionBuilder::new("fan-in")
        .log_dir(dir.path())
        .fail_fast(fail_fast)
        .concurrency(2)
        .job(JobBuilder::new("a").step(StepBuilder::run("s", "exit 1")))
        .job(JobBuilder::new("b").step(StepBuilder::run("s", "true")))
        .job(
            JobBuilder::new("c")
                .needs("a")
                .needs("b")
                .step(StepBuilder::run("s", "true")),
        )
        .build()
}

fn status_of(run: &Run, node: &str) -> StepStatus {
    run.step(node).unwrap_or_else(|| panic!("no step {node}")).status
}

#[tokio::test]
async fn linear_chain_runs_in_order_and_succeeds() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (handle, log) = start(chain(&dir), FakeScript::new());
    let mut events = handle.subscribe_from(0);

    let run = with_timeout(handle.wait()).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(log.lock().unwrap().dispatched, vec!["ci.a", "ci.b", "ci.c"]);
    for node in ["ci.a", "ci.b", "ci.c"] {
        assert_eq!(status_of(&run, node), StepStatus::Succeeded);
    }

    let mut kinds = Vec::new();
    while let Some(record) = with_timeout(events.next()).await {
        kinds.push(match record.event {
            Event::RunStarted { .. } => "run_started".to_string(),
            Event::StepDispatched { node } => format!("dispatched {node}"),
            Event::StepCompleted { node, .. } => format!("completed {node}"),
            Event::StepOutputChunk { .. } => continue,
            Event::RunCompleted { .. } => "run_completed".to_string(),
        });
    }
    assert_eq!(
        kinds,
        vec![
            "run_started",
            "dispatched ci.a",
            "completed ci.a",
            "dispatched ci.b",
            "completed ci.b",
            "dispatched ci.c",
            "completed ci.c",
            "run_completed",
        ]
    );
}

#[tokio::test]
async fn failure_skips_dependents_but_independent_steps_finish() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let script = FakeScript::new().fail("a.s", 1).delay("b.s", Duration::from_millis(50));
    let (handle, log) = start(fan_in(&dir, false), script);

    let run = with_timeout(handle.wait()).await;

    assert_eq!(status_of(&run, "a.s"), StepStatus::Failed);
    assert_eq!(status_of(&run, "b.s"), StepStatus::Succeeded);
    assert_eq!(status_of(&run, "c.s"), StepStatus::Skipped);
    assert_eq!(run.step("c.s").unwrap().skip_reason, Some(SkipReason::Upstream));
    assert_eq!(run.status, RunStatus::Failed);
    assert!(!log.lock().unwrap().dispatched.contains(&"c.s".to_string()));
}

#[tokio::test]
async fn fail_fast_cancels_in_flight_steps() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let script = FakeScript::new()
        .fail("a.s", 2)
        .delay("a.s", Duration::from_millis(20))
        .hang("b.s");
    let (handle, log) = start(fan_in(&dir, true), script);

    let run = with_timeout(handle.wait()).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(status_of(&run, "a.s"), StepStatus::Failed);
    assert_eq!(status_of(&run, "b.s"), StepStatus::Cancelled);
    assert_eq!(status_of(&run, "c.s"), StepStatus::Cancelled);

    let log = log.lock().unwrap();
    assert_eq!(log.cancel_requests, vec!["b.s"]);
    assert!(!log.dispatched.contains(&"c.s".to_string()));
}

#[tokio::test]
async fn external_cancel_finishes_run_as_cancelled() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (handle, _log) = start(chain(&dir), FakeScript::new().hang("ci.a"));

    // Wait until the first step is running.
    let mut events = handle.subscribe_from(0);
    while let Some(record) = with_timeout(events.next()).await {
        if matches!(record.event, Event::StepDispatched { .. }) {
            break;
        }
    }
    handle.cancel().await;

    let run = with_timeout(handle.wait()).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(status_of(&run, "ci.a"), StepStatus::Cancelled);
    assert_eq!(status_of(&run, "ci.b"), StepStatus::Cancelled);
    assert_eq!(status_of(&run, "ci.c"), StepStatus::Cancelled);
}

#[tokio::test]
async fn concurrency_limit_is_never_exceeded() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut builder = DefinitionBuilder::new("wide").log_dir(dir.path()).concurrency(2);
    for i in 0..5 {
        builder = builder.job(JobBuilder::new(&format!("j{i}")).step(StepBuilder::run("s", "true")));
    }
    let script = FakeScript::new().default_delay(Duration::from_millis(30));
    let (handle, log) = start(builder.build(), script);

    let run = with_timeout(handle.wait()).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    let log = log.lock().unwrap();
    assert_eq!(log.max_running, 2);
    // Ready ties dispatch in declaration order.
    assert_eq!(log.dispatched, vec!["j0.s", "j1.s", "j2.s", "j3.s", "j4.s"]);
}

#[tokio::test]
async fn outputs_are_interpolated_into_dependent_steps() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = DefinitionBuilder::new("outputs")
        .log_dir(dir.path())
        .job(JobBuilder::new("build").step(StepBuilder::run("pack", "true").output("url")))
        .job(
            JobBuilder::new("deploy").step(
                StepBuilder::uses("ship", "upload")
                    .with("target", "${{ jobs.build.steps.pack.outputs.url }}"),
            ),
        )
        .action("upload", "true")
        .build();
    let script = FakeScript::new().succeed_with("build.pack", "url", "https://x");
    let (handle, log) = start(def, script);

    let run = with_timeout(handle.wait()).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.step("build.pack").unwrap().outputs["url"], "https://x");
    let log = log.lock().unwrap();
    assert_eq!(log.dispatched, vec!["build.pack", "deploy.ship"]);
    assert_eq!(log.steps["deploy.ship"].params["target"], "https://x");
}

#[tokio::test]
async fn deferred_conditions_see_upstream_status() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = DefinitionBuilder::new("conditions")
        .log_dir(dir.path())
        .fail_fast(false)
        .concurrency(1)
        .job(
            JobBuilder::new("ci")
                .step(StepBuilder::run("test", "false"))
                .step(StepBuilder::run("publish", "true"))
                .step(StepBuilder::run("cleanup", "true").condition("always()")),
        )
        .job(
            JobBuilder::new("triage")
                .step(StepBuilder::run("inspect", "false"))
                .step(StepBuilder::run("report", "true").condition("${{ failure() }}"))
                .step(StepBuilder::run("celebrate", "true").condition("${{ success() }}")),
        )
        .build();
    let script = FakeScript::new().fail("ci.test", 1).fail("triage.inspect", 1);
    let (handle, log) = start(def, script);

    let run = with_timeout(handle.wait()).await;

    assert_eq!(status_of(&run, "ci.test"), StepStatus::Failed);
    assert_eq!(status_of(&run, "ci.publish"), StepStatus::Skipped);
    assert_eq!(run.step("ci.publish").unwrap().skip_reason, Some(SkipReason::Upstream));
    assert_eq!(status_of(&run, "ci.cleanup"), StepStatus::Succeeded);
    assert_eq!(status_of(&run, "triage.report"), StepStatus::Succeeded);
    assert_eq!(status_of(&run, "triage.celebrate"), StepStatus::Succeeded);
    assert_eq!(run.status, RunStatus::Failed);

    let dispatched = log.lock().unwrap().dispatched.clone();
    assert!(!dispatched.contains(&"ci.publish".to_string()));
    assert_eq!(log.lock().unwrap().max_running, 1);
}
