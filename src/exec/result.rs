// src/exec/result.rs

//! What a step execution produced.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::NodeId;
use crate::types::{SkipReason, StepStatus};

/// Why a step failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The process exited non-zero, or was killed by a signal (`code` is
    /// `None`).
    NonZeroExit { code: Option<i32> },
    /// The step ran longer than its timeout and was terminated.
    TimedOut { after_ms: u64 },
    /// The output file could not be parsed, or a declared output was never
    /// written.
    OutputParse { message: String },
    /// The step could not be started (spawn failure, unknown action, IO).
    Infrastructure { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NonZeroExit { code: Some(code) } => write!(f, "exited with code {code}"),
            FailureReason::NonZeroExit { code: None } => f.write_str("terminated by signal"),
            FailureReason::TimedOut { after_ms } => write!(f, "timed out after {after_ms}ms"),
            FailureReason::OutputParse { message } => write!(f, "invalid step outputs: {message}"),
            FailureReason::Infrastructure { message } => write!(f, "infrastructure error: {message}"),
        }
    }
}

/// Captured bytes of one output stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    /// Output beyond the capture limit was discarded.
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Execution record of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub node: NodeId,
    pub status: StepStatus,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub exit_code: Option<i32>,
    pub outputs: BTreeMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureReason>,
    pub skip_reason: Option<SkipReason>,
    /// Number of spawn attempts (0 if never dispatched).
    pub attempts: u32,
}

impl StepResult {
    pub fn pending(node: impl Into<NodeId>) -> Self {
        Self {
            node: node.into(),
            status: StepStatus::Pending,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            exit_code: None,
            outputs: BTreeMap::new(),
            started_at: None,
            ended_at: None,
            failure: None,
            skip_reason: None,
            attempts: 0,
        }
    }

    pub fn succeeded(node: impl Into<NodeId>, outputs: BTreeMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            status: StepStatus::Succeeded,
            exit_code: Some(0),
            outputs,
            started_at: Some(now),
            ended_at: Some(now),
            attempts: 1,
            ..Self::pending(node)
        }
    }

    pub fn failed(node: impl Into<NodeId>, reason: FailureReason) -> Self {
        let now = Utc::now();
        let exit_code = match &reason {
            FailureReason::NonZeroExit { code } => *code,
            _ => None,
        };
        Self {
            status: StepStatus::Failed,
            exit_code,
            started_at: Some(now),
            ended_at: Some(now),
            failure: Some(reason),
            attempts: 1,
            ..Self::pending(node)
        }
    }

    pub fn cancelled(node: impl Into<NodeId>) -> Self {
        Self {
            status: StepStatus::Cancelled,
            ended_at: Some(Utc::now()),
            ..Self::pending(node)
        }
    }

    pub fn skipped(node: impl Into<NodeId>, reason: SkipReason) -> Self {
        Self {
            status: StepStatus::Skipped,
            skip_reason: Some(reason),
            ..Self::pending(node)
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}
