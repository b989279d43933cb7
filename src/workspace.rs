// src/workspace.rs

//! On-disk layout of a run.
//!
//! ```text
//! <log_dir>/<run_id>/
//!   events.jsonl        durable event log
//!   work/<job>/         workspace shared by the steps of one job
//!   steps/<job>.<step>/ private directory of one step (output file)
//! ```

use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::events::EVENTS_FILE;

/// Name of the output file inside a step directory.
pub const OUTPUT_FILE: &str = "outputs.env";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    run_dir: PathBuf,
}

impl Workspace {
    pub fn new(log_dir: &Path, run_id: Uuid) -> Self {
        Self {
            run_dir: log_dir.join(run_id.to_string()),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn events_path(&self) -> PathBuf {
        self.run_dir.join(EVENTS_FILE)
    }

    pub fn work_root(&self) -> PathBuf {
        self.run_dir.join("work")
    }

    pub fn steps_root(&self) -> PathBuf {
        self.run_dir.join("steps")
    }

    pub fn job_dir(&self, job: &str) -> PathBuf {
        self.work_root().join(job)
    }

    pub fn step_dir(&self, node: &str) -> PathBuf {
        self.steps_root().join(node)
    }

    pub fn output_file(&self, node: &str) -> PathBuf {
        self.step_dir(node).join(OUTPUT_FILE)
    }

    /// Create the job workspace and a fresh step directory.
    pub fn prepare_step(&self, job: &str, node: &str) -> io::Result<(PathBuf, PathBuf)> {
        let job_dir = self.job_dir(job);
        let step_dir = self.step_dir(node);
        std::fs::create_dir_all(&job_dir)?;
        if step_dir.exists() {
            std::fs::remove_dir_all(&step_dir)?;
        }
        std::fs::create_dir_all(&step_dir)?;
        Ok((job_dir, step_dir))
    }

    /// Remove job workspaces and step directories, keeping the event log.
    pub fn remove_scratch(&self) -> io::Result<()> {
        for dir in [self.work_root(), self.steps_root()] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
