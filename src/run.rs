// src/run.rs

//! The observable record of one pipeline execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::TriggerSummary;
use crate::exec::StepResult;
use crate::types::{RunStatus, StepStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub pipeline: String,
    pub trigger: TriggerSummary,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// One entry per DAG node, in declaration order.
    pub steps: Vec<StepResult>,
    /// Why the run failed before or outside of its steps (invalid graph,
    /// publish failure, internal error).
    pub error: Option<String>,
}

impl Run {
    pub fn new(id: Uuid, pipeline: impl Into<String>, trigger: TriggerSummary) -> Self {
        Self {
            id,
            pipeline: pipeline.into(),
            trigger,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            steps: Vec::new(),
            error: None,
        }
    }

    pub fn step(&self, node: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.node == node)
    }

    pub fn step_mut(&mut self, node: &str) -> Option<&mut StepResult> {
        self.steps.iter_mut().find(|s| s.node == node)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Nodes with the given status, in declaration order.
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.node.as_str())
            .collect()
    }

    pub(crate) fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.ended_at = Some(Utc::now());
        if error.is_some() {
            self.error = error;
        }
    }
}
