// src/events/mod.rs

//! Ordered, append-only run events.
//!
//! - [`bus`] fans events out to any number of live subscribers.
//! - [`log`] persists them as JSONL under the run directory so a finished
//!   run can be replayed.
//!
//! Per step the order is always `StepDispatched`, zero or more
//! `StepOutputChunk`, then `StepCompleted`. `RunStarted` is first and
//! `RunCompleted` last.

pub mod bus;
pub mod log;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::TriggerSummary;
use crate::dag::NodeId;
use crate::exec::FailureReason;
use crate::types::{RunStatus, SkipReason, StepStatus, StreamKind};

pub use bus::{EventBus, Subscription};
pub use log::{replay, EventLog, EVENTS_FILE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RunStarted {
        pipeline: String,
        trigger: TriggerSummary,
        /// Every node of the step DAG in declaration order (empty when the
        /// graph could not be built).
        nodes: Vec<NodeId>,
    },
    StepDispatched {
        node: NodeId,
    },
    StepOutputChunk {
        node: NodeId,
        stream: StreamKind,
        /// Output text with secret values masked.
        data: String,
    },
    StepCompleted {
        node: NodeId,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_reason: Option<SkipReason>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        outputs: BTreeMap<String, String>,
    },
    RunCompleted {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Event {
    /// Node this event belongs to, for step-level events.
    pub fn node(&self) -> Option<&str> {
        match self {
            Event::StepDispatched { node }
            | Event::StepOutputChunk { node, .. }
            | Event::StepCompleted { node, .. } => Some(node),
            Event::RunStarted { .. } | Event::RunCompleted { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::RunCompleted { .. })
    }
}

/// An event with its position in the run's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Zero-based, gap-free position within the run.
    pub offset: u64,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}
