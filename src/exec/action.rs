// src/exec/action.rs

//! Named actions a step can `uses`.
//!
//! An action is either declared in the definition (`[action.<name>]`, a
//! shell command receiving its parameters as `INPUT_<KEY>`) or registered
//! in-process by the embedding program through [`ActionRegistry`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::ActionConfig;
use crate::exec::output::OutputSink;

/// Everything an in-process action gets to see.
pub struct ActionInvocation<'a> {
    pub node: &'a str,
    /// Resolved `with` parameters.
    pub params: &'a BTreeMap<String, String>,
    /// Full step environment (run vars plus step env).
    pub env: &'a BTreeMap<String, String>,
    pub workdir: &'a Path,
    /// Captures and streams whatever the action prints.
    pub output: &'a OutputSink,
}

/// Result of an in-process action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    /// Zero means success.
    pub exit_code: i32,
    pub outputs: BTreeMap<String, String>,
}

impl ActionOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

/// An action implemented in Rust.
///
/// Timeouts and cancellation drop the returned future.
pub trait Action: Send + Sync {
    fn invoke<'a>(
        &'a self,
        invocation: ActionInvocation<'a>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ActionOutcome>> + Send + 'a>>;
}

/// How a `uses` name was resolved.
#[derive(Clone)]
pub enum ResolvedAction {
    Command(ActionConfig),
    InProcess(Arc<dyn Action>),
}

/// In-process actions available to runs.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.actions.keys().collect();
        names.sort();
        f.debug_struct("ActionRegistry").field("actions", &names).finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, action: Arc<dyn Action>) -> &mut Self {
        self.actions.insert(name.into(), action);
        self
    }

    pub fn with(mut self, name: impl Into<String>, action: Arc<dyn Action>) -> Self {
        self.register(name, action);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Resolve `name`: actions declared by the definition shadow registered
    /// ones.
    pub fn resolve(&self, name: &str, declared: &BTreeMap<String, ActionConfig>) -> Option<ResolvedAction> {
        if let Some(cfg) = declared.get(name) {
            return Some(ResolvedAction::Command(cfg.clone()));
        }
        self.actions.get(name).cloned().map(ResolvedAction::InProcess)
    }
}

/// Environment variable carrying parameter `key` to a command action.
pub fn input_var(key: &str) -> String {
    format!("INPUT_{}", key.to_ascii_uppercase().replace('-', "_"))
}
