// src/errors.rs

//! Crate-wide error types.
//!
//! Step failures are *not* errors: they are recorded as a
//! [`FailureReason`](crate::exec::FailureReason) on the step result. The
//! types here cover everything that prevents a run from being scheduled at
//! all.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipewrightError {
    #[error("Definition error: {0}")]
    Definition(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipewrightError {
    /// Exit code of the `pipewright` binary for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipewrightError::Definition(_) | PipewrightError::Graph(_) | PipewrightError::Toml(_) => {
                crate::exit_code::INVALID
            }
            _ => crate::exit_code::INTERNAL,
        }
    }
}

/// Errors produced while turning a definition into a step DAG.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("cycle detected in step graph: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("step '{step}' references unknown output '{reference}'")]
    UnknownReference { step: String, reference: String },

    #[error("job '{job}' declares step id '{id}' more than once")]
    DuplicateStep { job: String, id: String },

    #[error("invalid expression on step '{step}': {message}")]
    InvalidExpression { step: String, message: String },
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, PipewrightError>;
