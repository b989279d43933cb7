// tests/event_log.rs

mod common;
use crate::common::builders::{DefinitionBuilder, JobBuilder, StepBuilder};
use crate::common::fake_executor::{ExecutionLog, FakeExecutor, FakeScript};
use crate::common::{init_tracing, push_trigger, with_timeout};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pipewright::controller::RunController;
use pipewright::events::{replay, Event, EVENTS_FILE};
use tempfile::TempDir;

#[tokio::test]
async fn persisted_log_replays_exactly_what_was_published() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = DefinitionBuilder::new("replay")
        .log_dir(dir.path())
        .fail_fast(false)
        .job(
            JobBuilder::new("ci")
                .step(StepBuilder::run("a", "true").output("v"))
                .step(StepBuilder::run("b", "true")),
        )
        .job(JobBuilder::new("other").step(StepBuilder::run("c", "true")))
        .build();
    let script = FakeScript::new().succeed_with("ci.a", "v", "1").fail("other.c", 4);
    let log = Arc::new(Mutex::new(ExecutionLog::default()));

    let handle = RunController::new().start_with_executor(def, push_trigger(), move |_, tx| {
        FakeExecutor::new(tx, script, log)
    });
    let bus = Arc::clone(handle.events());
    let run = with_timeout(handle.wait()).await;

    let path = dir.path().join(run.id.to_string()).join(EVENTS_FILE);
    let records = replay(&path).unwrap();
    assert_eq!(records, bus.history());

    let offsets: Vec<u64> = records.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, (0..records.len() as u64).collect::<Vec<_>>());
    assert!(records.iter().all(|r| r.run_id == run.id));
    assert!(matches!(records.first().unwrap().event, Event::RunStarted { .. }));
    assert!(records.last().unwrap().event.is_terminal());

    // Per step: dispatched strictly before completed.
    let mut dispatched_at = HashMap::new();
    for record in &records {
        match &record.event {
            Event::StepDispatched { node } => {
                dispatched_at.insert(node.clone(), record.offset);
            }
            Event::StepCompleted { node, .. } => {
                let at = dispatched_at.get(node).copied().unwrap_or_else(|| panic!("{node} never dispatched"));
                assert!(at < record.offset);
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn late_subscribers_see_full_history_then_end() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let def = DefinitionBuilder::new("late")
        .log_dir(dir.path())
        .job(JobBuilder::new("ci").step(StepBuilder::run("a", "true")))
        .build();
    let log = Arc::new(Mutex::new(ExecutionLog::default()));

    let handle = RunController::new().start_with_executor(def, push_trigger(), move |_, tx| {
        FakeExecutor::new(tx, FakeScript::new(), log)
    });
    let bus = Arc::clone(handle.events());
    with_timeout(handle.wait()).await;
    assert!(bus.is_closed());

    let mut from_start = bus.subscribe_from(0);
    let mut seen = Vec::new();
    while let Some(record) = with_timeout(from_start.next()).await {
        seen.push(record);
    }
    assert_eq!(seen, bus.history());

    let mut from_two = bus.subscribe_from(2);
    let rest = from_two.drain_ready();
    assert_eq!(rest.first().map(|r| r.offset), Some(2));
    assert!(with_timeout(from_two.next()).await.is_none());

    // Publishing after completion is refused.
    assert_eq!(bus.publish(Event::StepDispatched { node: "ci.a".to_string() }), None);
}

#[test]
fn replaying_a_missing_log_is_empty() {
    let dir = TempDir::new().unwrap();
    assert!(replay(&dir.path().join(EVENTS_FILE)).unwrap().is_empty());
}

#[test]
fn replay_reports_the_corrupt_line() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(EVENTS_FILE);
    std::fs::write(&path, "\n{not json}\n").unwrap();
    let err = replay(&path).unwrap_err();
    assert!(format!("{err:#}").contains("line 2"));
}
