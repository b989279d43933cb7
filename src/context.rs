// src/context.rs

//! Trigger payload and the frozen run-scoped environment.
//!
//! Nothing in the engine reads ambient process state: the run controller
//! resolves a [`RunEnvironment`] once when a run starts and every other
//! component receives it by `Arc`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::PipelineDefinition;
use crate::expr::{EvalContext, UpstreamStatus};
use crate::types::TriggerKind;

/// The external event that starts a run.
#[derive(Clone)]
pub struct TriggerContext {
    pub event: TriggerKind,
    pub repository: String,
    pub git_ref: String,
    /// Opaque token for authenticating external actions (e.g. publishing).
    pub token: Option<String>,
    /// Secret values offered to the run; only declared names are used.
    pub secrets: BTreeMap<String, String>,
}

impl fmt::Debug for TriggerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerContext")
            .field("event", &self.event)
            .field("repository", &self.repository)
            .field("git_ref", &self.git_ref)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TriggerContext {
    pub fn new(event: TriggerKind) -> Self {
        Self {
            event,
            repository: String::new(),
            git_ref: "refs/heads/main".to_string(),
            token: None,
            secrets: BTreeMap::new(),
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = git_ref.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }

    /// Token-free view safe to log and persist.
    pub fn summary(&self) -> TriggerSummary {
        TriggerSummary {
            event: self.event,
            repository: self.repository.clone(),
            git_ref: self.git_ref.clone(),
        }
    }
}

/// Trigger fields that may appear in logs and the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSummary {
    pub event: TriggerKind,
    pub repository: String,
    pub git_ref: String,
}

/// Variables, secrets and trigger data resolved once at run start.
#[derive(Clone)]
pub struct RunEnvironment {
    run_id: Uuid,
    trigger: TriggerSummary,
    vars: BTreeMap<String, String>,
    secrets: BTreeMap<String, String>,
    token: Option<String>,
}

impl fmt::Debug for RunEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunEnvironment")
            .field("run_id", &self.run_id)
            .field("trigger", &self.trigger)
            .field("vars", &self.vars)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RunEnvironment {
    /// Resolve the run-scoped environment for `definition` and `trigger`.
    ///
    /// Declared secrets missing from the trigger resolve to the empty string.
    pub fn freeze(run_id: Uuid, definition: &PipelineDefinition, trigger: &TriggerContext) -> Self {
        Self::resolve(run_id, definition, trigger, true)
    }

    /// Environment used to build a graph without starting a run (e.g.
    /// `pipewright validate`). Missing secrets are not reported.
    pub fn preview(definition: &PipelineDefinition, trigger: &TriggerContext) -> Self {
        Self::resolve(Uuid::nil(), definition, trigger, false)
    }

    fn resolve(run_id: Uuid, definition: &PipelineDefinition, trigger: &TriggerContext, report_missing: bool) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("CI".to_string(), "true".to_string());
        vars.insert("PIPEWRIGHT".to_string(), "true".to_string());
        vars.insert("PIPEWRIGHT_RUN_ID".to_string(), run_id.to_string());
        vars.insert("PIPEWRIGHT_PIPELINE".to_string(), definition.name().to_string());
        vars.insert("PIPEWRIGHT_EVENT".to_string(), trigger.event.to_string());
        vars.insert("PIPEWRIGHT_REPOSITORY".to_string(), trigger.repository.clone());
        vars.insert("PIPEWRIGHT_REF".to_string(), trigger.git_ref.clone());
        for (k, v) in definition.env() {
            vars.insert(k.clone(), v.clone());
        }

        let mut secrets = BTreeMap::new();
        for name in definition.secrets() {
            let value = match trigger.secrets.get(name) {
                Some(v) => v.clone(),
                None => {
                    if report_missing {
                        warn!(secret = %name, "declared secret not provided by trigger; using empty value");
                    }
                    String::new()
                }
            };
            secrets.insert(name.clone(), value);
        }

        Self {
            run_id,
            trigger: trigger.summary(),
            vars,
            secrets,
            token: trigger.token.clone(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn trigger(&self) -> &TriggerSummary {
        &self.trigger
    }

    /// Run-scoped variables (trigger payload plus declared `[env]`).
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn secret(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Values that must never appear in captured or streamed output.
    pub fn masked_values(&self) -> Vec<String> {
        self.secrets
            .values()
            .chain(self.token.iter())
            .filter(|v| !v.is_empty())
            .cloned()
            .collect()
    }

    /// Resolve the run-scoped part of an expression path.
    ///
    /// Paths rooted at `steps` / `jobs` are not known here and return `None`.
    pub fn lookup(&self, path: &[String]) -> Option<String> {
        let segs: Vec<&str> = path.iter().map(String::as_str).collect();
        match segs.as_slice() {
            ["trigger", "event"] => Some(self.trigger.event.to_string()),
            ["trigger", "ref"] => Some(self.trigger.git_ref.clone()),
            ["trigger", "branch"] => Some(
                self.trigger
                    .git_ref
                    .strip_prefix("refs/heads/")
                    .unwrap_or(&self.trigger.git_ref)
                    .to_string(),
            ),
            ["trigger", "repository"] => Some(self.trigger.repository.clone()),
            ["run", "id"] => Some(self.run_id.to_string()),
            ["env", name] => self.vars.get(*name).cloned(),
            ["secrets", name] => self.secrets.get(*name).cloned(),
            _ => None,
        }
    }
}

impl EvalContext for RunEnvironment {
    fn lookup(&self, path: &[String]) -> Option<String> {
        RunEnvironment::lookup(self, path)
    }

    fn upstream(&self) -> UpstreamStatus {
        UpstreamStatus::succeeded()
    }
}
