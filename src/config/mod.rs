// src/config/mod.rs

//! Pipeline definition loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a definition file from disk (`loader.rs`).
//! - Validate it into an immutable [`PipelineDefinition`] (`validate.rs`).

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use duration::parse_duration;
pub use loader::{load_and_validate, load_from_path, parse_definition};
pub use model::{
    ActionConfig, ConfigSection, EngineConfig, Job, JobConfig, PipelineDefinition, PublishConfig,
    RawPipelineFile, StepConfig, StepKind, StepSpec,
};
