// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{SkipPolicy, TriggerKind};

/// Top-level pipeline definition as read from a TOML file.
///
/// ```toml
/// name = "deploy-site"
/// secrets = ["DEPLOY_TOKEN"]
///
/// [config]
/// concurrency = 2
/// fail_fast = true
/// timeout = "30m"
///
/// [env]
/// CARGO_TERM_COLOR = "always"
///
/// [action.checkout]
/// cmd = "git clone --depth 1 --branch \"$INPUT_REF\" \"$PIPEWRIGHT_REPOSITORY\" ."
///
/// [publish]
/// dir = "dist"
/// destination = "gh-pages"
/// needs = ["build"]
///
/// [[job]]
/// name = "build"
/// on = ["push", "workflow_dispatch"]
/// branches = ["main"]
///
/// [[job.step]]
/// id = "checkout"
/// uses = "checkout"
/// with = { ref = "${{ trigger.ref }}" }
///
/// [[job.step]]
/// id = "build"
/// run = "trunk build --release"
/// ```
///
/// This is the raw, unvalidated shape. Use
/// [`PipelineDefinition::try_from`] (or `config::load_and_validate`) to get
/// the immutable, validated form.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawPipelineFile {
    /// Display name of the pipeline. Defaults to the file stem.
    #[serde(default)]
    pub name: Option<String>,

    /// Names of secrets the run needs; values come from the trigger.
    #[serde(default)]
    pub secrets: Vec<String>,

    /// Engine policy from `[config]`.
    #[serde(default)]
    pub config: ConfigSection,

    /// Declared run-scoped variables from `[env]`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Commands implementing external actions, keyed by action name.
    #[serde(default)]
    pub action: BTreeMap<String, ActionConfig>,

    /// Optional artifact publication after a successful run.
    #[serde(default)]
    pub publish: Option<PublishConfig>,

    /// Jobs in declaration order (`[[job]]`).
    #[serde(default)]
    pub job: Vec<JobConfig>,
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// Maximum number of steps running at once. Defaults to host parallelism.
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Cancel remaining work as soon as one step fails.
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,

    /// Default wall-clock timeout per step (e.g. `"30m"`).
    #[serde(default = "default_step_timeout")]
    pub timeout: String,

    /// Time between SIGTERM and SIGKILL when a step is stopped.
    #[serde(default = "default_kill_grace")]
    pub kill_grace: String,

    /// Cap on captured bytes per stream per step.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// How often a step whose process could not even be spawned is retried.
    #[serde(default)]
    pub dispatch_retries: u32,

    /// `"permit"` or `"fail"`; see [`SkipPolicy`].
    #[serde(default)]
    pub skipped_dependents: SkipPolicy,

    /// Root directory for per-run workspaces and event logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Keep step workspaces after the run instead of removing them.
    #[serde(default)]
    pub keep_workspace: bool,
}

fn default_fail_fast() -> bool {
    true
}

fn default_step_timeout() -> String {
    "30m".to_string()
}

fn default_kill_grace() -> String {
    "5s".to_string()
}

fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_log_dir() -> String {
    ".pipewright/runs".to_string()
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            concurrency: None,
            fail_fast: default_fail_fast(),
            timeout: default_step_timeout(),
            kill_grace: default_kill_grace(),
            max_output_bytes: default_max_output_bytes(),
            dispatch_retries: 0,
            skipped_dependents: SkipPolicy::default(),
            log_dir: default_log_dir(),
            keep_workspace: false,
        }
    }
}

/// `[action.<name>]` section: a command implementing an external action.
///
/// The resolved `with` parameters of the step are passed to the command as
/// `INPUT_<KEY>` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActionConfig {
    pub cmd: String,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// `[publish]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PublishConfig {
    /// Directory (relative to the workspace of the first needed job) to publish.
    pub dir: String,

    /// Destination descriptor handed to the publisher (e.g. a branch name).
    pub destination: String,

    /// Command used by the default publisher.
    #[serde(default)]
    pub cmd: Option<String>,

    /// Jobs whose steps must all have succeeded before publishing.
    #[serde(default)]
    pub needs: Vec<String>,
}

/// `[[job]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub name: String,

    /// Trigger kinds this job runs for. Empty means every trigger.
    #[serde(default)]
    pub on: Vec<TriggerKind>,

    /// Branch names this job runs for. Empty means every branch.
    #[serde(default)]
    pub branches: Vec<String>,

    /// Jobs that must finish before this one starts.
    #[serde(default)]
    pub needs: Vec<String>,

    #[serde(default)]
    pub step: Vec<StepConfig>,
}

/// `[[job.step]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    pub id: String,

    /// Shell command; mutually exclusive with `uses`.
    #[serde(default)]
    pub run: Option<String>,

    /// External action name; mutually exclusive with `run`.
    #[serde(default)]
    pub uses: Option<String>,

    /// Input parameters. Values may contain `${{ ... }}` expressions.
    #[serde(default)]
    pub with: BTreeMap<String, String>,

    /// Step-local environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Output keys this step declares.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Condition expression; absent means "run when predecessors succeeded".
    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    /// Per-step timeout overriding `[config].timeout`.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Working directory relative to the job workspace.
    #[serde(default)]
    pub working_directory: Option<String>,
}

/// Validated engine policy.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub fail_fast: bool,
    pub step_timeout: Duration,
    pub kill_grace: Duration,
    pub max_output_bytes: usize,
    pub dispatch_retries: u32,
    pub skip_policy: SkipPolicy,
    pub log_dir: PathBuf,
    pub keep_workspace: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            fail_fast: default_fail_fast(),
            step_timeout: Duration::from_secs(30 * 60),
            kill_grace: Duration::from_secs(5),
            max_output_bytes: default_max_output_bytes(),
            dispatch_retries: 0,
            skip_policy: SkipPolicy::default(),
            log_dir: PathBuf::from(default_log_dir()),
            keep_workspace: false,
        }
    }
}

/// Host parallelism, falling back to 1 when it cannot be determined.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// What a step executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// A shell command run with `sh -c`.
    Command { run: String },
    /// A named external action resolved through the action registry.
    Action { uses: String },
}

/// Validated step specification.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpec {
    pub id: String,
    pub kind: StepKind,
    pub with: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub outputs: Vec<String>,
    pub condition: Option<String>,
    pub timeout: Option<Duration>,
    pub working_directory: Option<String>,
}

/// Validated job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub name: String,
    pub on: Vec<TriggerKind>,
    pub branches: Vec<String>,
    pub needs: Vec<String>,
    pub steps: Vec<StepSpec>,
}

impl Job {
    /// Whether this job participates in a run started by `event` on `git_ref`.
    ///
    /// Branch filters accept both `main` and `refs/heads/main` forms.
    pub fn matches_trigger(&self, event: TriggerKind, git_ref: &str) -> bool {
        if !self.on.is_empty() && !self.on.contains(&event) {
            return false;
        }
        if self.branches.is_empty() {
            return true;
        }
        let branch = git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref);
        self.branches.iter().any(|b| b == branch)
    }
}

/// Validated, immutable pipeline definition.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDefinition {
    name: String,
    secrets: Vec<String>,
    config: EngineConfig,
    env: BTreeMap<String, String>,
    actions: BTreeMap<String, ActionConfig>,
    publish: Option<PublishConfig>,
    jobs: Vec<Job>,
}

impl PipelineDefinition {
    /// Assemble a definition from already-validated parts.
    ///
    /// Only `config::validate` should call this.
    pub(crate) fn new_unchecked(
        name: String,
        secrets: Vec<String>,
        config: EngineConfig,
        env: BTreeMap<String, String>,
        actions: BTreeMap<String, ActionConfig>,
        publish: Option<PublishConfig>,
        jobs: Vec<Job>,
    ) -> Self {
        Self {
            name,
            secrets,
            config,
            env,
            actions,
            publish,
            jobs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn secrets(&self) -> &[String] {
        &self.secrets
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Same definition with the engine policy replaced (CLI overrides).
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn actions(&self) -> &BTreeMap<String, ActionConfig> {
        &self.actions
    }

    pub fn publish(&self) -> Option<&PublishConfig> {
        self.publish.as_ref()
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }
}
