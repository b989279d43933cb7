// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::types::TriggerKind;

/// Command-line arguments for `pipewright`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pipewright",
    version,
    about = "Run CI pipelines as a DAG of steps.",
    long_about = None
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PIPEWRIGHT_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Execute a pipeline definition.
    Run(RunArgs),

    /// Parse + validate, print the step DAG, but don't execute anything.
    Validate {
        /// Path to the definition file (TOML).
        #[arg(value_name = "FILE", default_value = "Pipewright.toml")]
        file: PathBuf,

        /// Event used to evaluate job filters and static conditions.
        #[arg(long, value_enum, default_value = "push")]
        trigger: TriggerKind,
    },

    /// Print a persisted event log.
    Inspect {
        /// Path to an `events.jsonl` file.
        #[arg(value_name = "EVENTS")]
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Path to the definition file (TOML).
    #[arg(value_name = "FILE", default_value = "Pipewright.toml")]
    pub file: PathBuf,

    /// Event that triggered the run.
    #[arg(long, value_enum, default_value = "push")]
    pub trigger: TriggerKind,

    /// Git ref the run is for.
    #[arg(long = "ref", value_name = "REF", default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Repository identifier (e.g. `owner/name`).
    #[arg(long, value_name = "REPO", default_value = "")]
    pub repository: String,

    /// Override `[config].concurrency`.
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Let independent steps keep running after a failure.
    #[arg(long)]
    pub no_fail_fast: bool,

    /// Override `[config].log_dir`.
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Keep job workspaces and step directories after the run.
    #[arg(long)]
    pub keep_workspace: bool,

    /// Don't echo step output to stdout.
    #[arg(long)]
    pub quiet: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
