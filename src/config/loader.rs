// src/config/loader.rs

use std::fs;
use std::path::Path;

use crate::config::model::{PipelineDefinition, RawPipelineFile};
use crate::errors::Result;

/// Load a definition file from a given path and return the raw `RawPipelineFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawPipelineFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let mut raw: RawPipelineFile = toml::from_str(&contents)?;

    if raw.name.is_none() {
        raw.name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());
    }

    Ok(raw)
}

/// Load a definition from path and validate it.
///
/// Checks for:
/// - at least one job, unique job names, known `needs`,
/// - each step declaring exactly one of `run` / `uses`,
/// - well-formed durations and sane engine policy.
///
/// Graph-level problems (duplicate step ids, cycles, unknown output
/// references) are reported later by `dag::DagGraph::build`.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<PipelineDefinition> {
    let raw = load_from_path(&path)?;
    PipelineDefinition::try_from(raw)
}

/// Parse and validate a definition held in memory.
pub fn parse_definition(contents: &str) -> Result<PipelineDefinition> {
    let raw: RawPipelineFile = toml::from_str(contents)?;
    PipelineDefinition::try_from(raw)
}

