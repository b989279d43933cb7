// src/lib.rs

pub mod cli;
pub mod config;
pub mod context;
pub mod controller;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod events;
pub mod exec;
pub mod expr;
pub mod logging;
pub mod run;
pub mod types;
pub mod workspace;

use std::io::Write;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::cli::{CliArgs, Command, RunArgs};
use crate::config::{load_and_validate, PipelineDefinition};
use crate::context::{RunEnvironment, TriggerContext};
use crate::controller::RunController;
use crate::dag::{ConditionState, DagGraph};
use crate::errors::{PipewrightError, Result};
use crate::events::{replay, Event, EventRecord};
use crate::types::{RunStatus, StreamKind, TriggerKind};

/// Process exit codes of the `pipewright` binary.
pub mod exit_code {
    pub const SUCCEEDED: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const CANCELLED: i32 = 2;
    pub const INVALID: i32 = 3;
    pub const INTERNAL: i32 = 4;
}

/// Environment variable holding the trigger's authentication token.
pub const TOKEN_VAR: &str = "PIPEWRIGHT_TOKEN";

/// High-level entry point used by `main.rs`.
///
/// Returns the process exit code for a command that ran to completion;
/// errors are mapped with [`PipewrightError::exit_code`].
pub async fn run(args: CliArgs) -> Result<i32> {
    match args.command {
        Command::Run(run_args) => run_pipeline(run_args).await,
        Command::Validate { file, trigger } => {
            let definition = load_definition(&file)?;
            let trigger = TriggerContext::new(trigger);
            let graph = DagGraph::build(&definition, &RunEnvironment::preview(&definition, &trigger))?;
            print_dag(&definition, &graph, trigger.event);
            Ok(exit_code::SUCCEEDED)
        }
        Command::Inspect { path } => {
            let records = replay(&path)?;
            for record in &records {
                println!("{}", describe(record));
            }
            Ok(exit_code::SUCCEEDED)
        }
    }
}

async fn run_pipeline(args: RunArgs) -> Result<i32> {
    let definition = load_definition(&args.file)?;
    let definition = apply_overrides(definition, &args);
    let trigger = trigger_from_env(&definition, &args);

    // Reject an invalid graph up front so it maps to its own exit code.
    DagGraph::build(&definition, &RunEnvironment::preview(&definition, &trigger))?;

    let handle = RunController::new().start(definition, trigger);
    info!(run_id = %handle.run_id(), "run started");

    // Ctrl-C → cancel the run; a second Ctrl-C is left to the default handler.
    {
        let canceller = handle.canceller();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            warn!("Ctrl+C received; cancelling run");
            canceller.cancel().await;
        });
    }

    let mut events = handle.subscribe_from(0);
    let quiet = args.quiet;
    let printer = tokio::spawn(async move {
        while let Some(record) = events.next().await {
            print_live(&record, quiet);
        }
    });

    let run = handle.wait().await;
    if let Err(e) = printer.await {
        debug!(error = %e, "event printer ended abnormally");
    }

    println!();
    println!("run {} {}", run.id, run.status);
    for step in &run.steps {
        let detail = match (&step.failure, step.skip_reason) {
            (Some(failure), _) => format!(" ({failure})"),
            (None, Some(reason)) => format!(" ({reason:?})").to_lowercase(),
            _ => String::new(),
        };
        let took = step
            .duration()
            .map(|d| format!(" [{}ms]", d.num_milliseconds()))
            .unwrap_or_default();
        println!("  {:<10} {}{}{}", step.status, step.node, detail, took);
    }
    if let Some(error) = &run.error {
        println!("  error: {error}");
    }

    Ok(match run.status {
        RunStatus::Succeeded => exit_code::SUCCEEDED,
        RunStatus::Cancelled => exit_code::CANCELLED,
        _ => exit_code::FAILED,
    })
}

fn load_definition(path: &Path) -> Result<PipelineDefinition> {
    load_and_validate(path).map_err(|e| match e {
        PipewrightError::Io(io) => {
            PipewrightError::Definition(format!("cannot read {}: {io}", path.display()))
        }
        other => other,
    })
}

/// CLI flags win over `[config]`.
fn apply_overrides(definition: PipelineDefinition, args: &RunArgs) -> PipelineDefinition {
    let mut config = definition.config().clone();
    if let Some(n) = args.concurrency {
        config.concurrency = n.max(1);
    }
    if args.no_fail_fast {
        config.fail_fast = false;
    }
    if let Some(dir) = &args.log_dir {
        config.log_dir = dir.clone();
    }
    if args.keep_workspace {
        config.keep_workspace = true;
    }
    definition.with_config(config)
}

/// Declared secrets are read from environment variables of the same name.
fn trigger_from_env(definition: &PipelineDefinition, args: &RunArgs) -> TriggerContext {
    let mut trigger = TriggerContext::new(args.trigger)
        .with_ref(args.git_ref.clone())
        .with_repository(args.repository.clone());
    if let Ok(token) = std::env::var(TOKEN_VAR) {
        trigger = trigger.with_token(token);
    }
    for name in definition.secrets() {
        if let Ok(value) = std::env::var(name) {
            trigger = trigger.with_secret(name.clone(), value);
        }
    }
    trigger
}

fn print_live(record: &EventRecord, quiet: bool) {
    match &record.event {
        Event::StepOutputChunk { node, stream, data } => {
            if quiet {
                return;
            }
            let mut out: Box<dyn Write> = match stream {
                StreamKind::Stdout => Box::new(std::io::stdout().lock()),
                StreamKind::Stderr => Box::new(std::io::stderr().lock()),
            };
            for line in data.lines() {
                let _ = writeln!(out, "[{node}] {line}");
            }
        }
        Event::StepDispatched { .. } | Event::StepCompleted { .. } => {
            println!("{}", describe(record));
        }
        Event::RunStarted { .. } | Event::RunCompleted { .. } => {}
    }
}

/// One-line rendering of an event, as used by `inspect`.
pub fn describe(record: &EventRecord) -> String {
    let ts = record.timestamp.format("%H:%M:%S%.3f");
    let body = match &record.event {
        Event::RunStarted { pipeline, trigger, nodes } => format!(
            "run started: {pipeline} ({} on {}, {} steps)",
            trigger.event,
            trigger.git_ref,
            nodes.len()
        ),
        Event::StepDispatched { node } => format!("{node}: dispatched"),
        Event::StepOutputChunk { node, stream, data } => {
            let tag = match stream {
                StreamKind::Stdout => "out",
                StreamKind::Stderr => "err",
            };
            format!("{node} [{tag}]: {}", data.trim_end())
        }
        Event::StepCompleted {
            node,
            status,
            failure,
            skip_reason,
            outputs,
            ..
        } => {
            let mut line = format!("{node}: {status}");
            if let Some(failure) = failure {
                line.push_str(&format!(" ({failure})"));
            }
            if let Some(reason) = skip_reason {
                line.push_str(&format!(" ({reason:?})").to_lowercase());
            }
            if !outputs.is_empty() {
                let keys: Vec<_> = outputs.keys().map(String::as_str).collect();
                line.push_str(&format!(" outputs: {}", keys.join(", ")));
            }
            line
        }
        Event::RunCompleted { status, error } => match error {
            Some(error) => format!("run completed: {status} ({error})"),
            None => format!("run completed: {status}"),
        },
    };
    format!("#{:<4} {ts} {body}", record.offset)
}

/// Simple dry-run output: print the step DAG in dispatch order.
fn print_dag(definition: &PipelineDefinition, graph: &DagGraph, event: TriggerKind) {
    println!("pipewright validate: {}", definition.name());
    let config = definition.config();
    println!("  config.concurrency = {}", config.concurrency);
    println!("  config.fail_fast = {}", config.fail_fast);
    println!("  config.timeout = {:?}", config.step_timeout);
    println!("  trigger = {event}");
    println!();

    println!("steps ({}):", graph.len());
    for id in graph.topological_order() {
        let Some(node) = graph.node(id) else { continue };
        println!("  - {id}");
        match &node.spec.kind {
            config::StepKind::Command { run } => println!("      run: {run}"),
            config::StepKind::Action { uses } => println!("      uses: {uses}"),
        }
        if !node.predecessors.is_empty() {
            println!("      after: {:?}", node.predecessors);
        }
        match &node.condition {
            ConditionState::Unconditional => {}
            ConditionState::Static(true) => println!("      if: true"),
            ConditionState::Static(false) => println!("      if: false (will be skipped)"),
            ConditionState::Deferred(_) => {
                if let Some(cond) = &node.spec.condition {
                    println!("      if: {cond} (evaluated at run time)");
                }
            }
        }
        if !node.spec.outputs.is_empty() {
            println!("      outputs: {:?}", node.spec.outputs);
        }
    }

    debug!("dry-run complete (no execution)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn describes_completed_steps() {
        let record = EventRecord {
            offset: 7,
            run_id: Uuid::nil(),
            timestamp: Utc::now(),
            event: Event::StepCompleted {
                node: "build.compile".to_string(),
                status: types::StepStatus::Succeeded,
                exit_code: Some(0),
                failure: None,
                skip_reason: None,
                outputs: [("url".to_string(), "https://x".to_string())].into(),
            },
        };
        let line = describe(&record);
        assert!(line.starts_with("#7"));
        assert!(line.ends_with("build.compile: succeeded outputs: url"));
    }
}
