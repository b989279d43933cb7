pub mod builders;
pub mod fake_executor;

use std::sync::{Arc, Once};
use tracing_subscriber::{fmt, EnvFilter};

use pipewright::config::PipelineDefinition;
use pipewright::context::{RunEnvironment, TriggerContext};
use pipewright::dag::{DagGraph, Scheduler, SchedulerOptions};
use pipewright::types::TriggerKind;

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 10-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(10), f)
        .await
        .expect("Test timed out after 10 seconds")
}

/// A push to `main`.
pub fn push_trigger() -> TriggerContext {
    TriggerContext::new(TriggerKind::Push).with_repository("acme/site")
}

/// Graph and scheduler for `definition` under `trigger`, without starting
/// a run.
pub fn scheduler_for(definition: &PipelineDefinition, trigger: &TriggerContext) -> Scheduler {
    let env = Arc::new(RunEnvironment::preview(definition, trigger));
    let graph = DagGraph::build(definition, &env).expect("graph should build");
    Scheduler::new(
        Arc::new(graph),
        env,
        SchedulerOptions::from_config(definition.config()),
    )
}
