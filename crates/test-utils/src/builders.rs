#![allow(dead_code)]

use std::collections::BTreeMap;

use pipewright::config::{
    ActionConfig, ConfigSection, JobConfig, PipelineDefinition, PublishConfig, RawPipelineFile, StepConfig,
};
use pipewright::types::{SkipPolicy, TriggerKind};

/// Builder for `PipelineDefinition` to simplify test setup.
pub struct DefinitionBuilder {
    raw: RawPipelineFile,
}

impl DefinitionBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            raw: RawPipelineFile {
                name: Some(name.to_string()),
                ..RawPipelineFile::default()
            },
        }
    }

    pub fn job(mut self, job: JobBuilder) -> Self {
        self.raw.job.push(job.build());
        self
    }

    pub fn secret(mut self, name: &str) -> Self {
        self.raw.secrets.push(name.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.raw.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn action(mut self, name: &str, cmd: &str) -> Self {
        self.raw.action.insert(
            name.to_string(),
            ActionConfig {
                cmd: cmd.to_string(),
                env: BTreeMap::new(),
            },
        );
        self
    }

    pub fn publish(mut self, dir: &str, destination: &str, cmd: Option<&str>, needs: &[&str]) -> Self {
        self.raw.publish = Some(PublishConfig {
            dir: dir.to_string(),
            destination: destination.to_string(),
            cmd: cmd.map(str::to_string),
            needs: needs.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.raw.config.concurrency = Some(n);
        self
    }

    pub fn fail_fast(mut self, val: bool) -> Self {
        self.raw.config.fail_fast = val;
        self
    }

    pub fn dispatch_retries(mut self, n: u32) -> Self {
        self.raw.config.dispatch_retries = n;
        self
    }

    pub fn timeout(mut self, duration: &str) -> Self {
        self.raw.config.timeout = duration.to_string();
        self
    }

    pub fn kill_grace(mut self, duration: &str) -> Self {
        self.raw.config.kill_grace = duration.to_string();
        self
    }

    pub fn max_output_bytes(mut self, n: usize) -> Self {
        self.raw.config.max_output_bytes = n;
        self
    }

    pub fn skipped_dependents(mut self, policy: SkipPolicy) -> Self {
        self.raw.config.skipped_dependents = policy;
        self
    }

    pub fn log_dir(mut self, dir: &std::path::Path) -> Self {
        self.raw.config.log_dir = dir.to_string_lossy().into_owned();
        self
    }

    pub fn keep_workspace(mut self, val: bool) -> Self {
        self.raw.config.keep_workspace = val;
        self
    }

    pub fn config(mut self, config: ConfigSection) -> Self {
        self.raw.config = config;
        self
    }

    pub fn raw(self) -> RawPipelineFile {
        self.raw
    }

    pub fn build(self) -> PipelineDefinition {
        PipelineDefinition::try_from(self.raw).expect("Failed to build valid definition from builder")
    }
}

/// Builder for `JobConfig`.
pub struct JobBuilder {
    job: JobConfig,
}

impl JobBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            job: JobConfig {
                name: name.to_string(),
                on: vec![],
                branches: vec![],
                needs: vec![],
                step: vec![],
            },
        }
    }

    pub fn on(mut self, kind: TriggerKind) -> Self {
        self.job.on.push(kind);
        self
    }

    pub fn branch(mut self, branch: &str) -> Self {
        self.job.branches.push(branch.to_string());
        self
    }

    pub fn needs(mut self, job: &str) -> Self {
        self.job.needs.push(job.to_string());
        self
    }

    pub fn step(mut self, step: StepBuilder) -> Self {
        self.job.step.push(step.build());
        self
    }

    pub fn build(self) -> JobConfig {
        self.job
    }
}

/// Builder for `StepConfig`.
pub struct StepBuilder {
    step: StepConfig,
}

impl StepBuilder {
    /// A `run` step.
    pub fn run(id: &str, cmd: &str) -> Self {
        Self::blank(id, Some(cmd.to_string()), None)
    }

    /// A `uses` step.
    pub fn uses(id: &str, action: &str) -> Self {
        Self::blank(id, None, Some(action.to_string()))
    }

    fn blank(id: &str, run: Option<String>, uses: Option<String>) -> Self {
        Self {
            step: StepConfig {
                id: id.to_string(),
                run,
                uses,
                with: BTreeMap::new(),
                env: BTreeMap::new(),
                outputs: vec![],
                condition: None,
                timeout: None,
                working_directory: None,
            },
        }
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.step.with.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.step.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn output(mut self, key: &str) -> Self {
        self.step.outputs.push(key.to_string());
        self
    }

    pub fn condition(mut self, expr: &str) -> Self {
        self.step.condition = Some(expr.to_string());
        self
    }

    pub fn timeout(mut self, duration: &str) -> Self {
        self.step.timeout = Some(duration.to_string());
        self
    }

    pub fn working_directory(mut self, dir: &str) -> Self {
        self.step.working_directory = Some(dir.to_string());
        self
    }

    pub fn build(self) -> StepConfig {
        self.step
    }
}
