// src/events/log.rs

//! Durable JSONL event log, one record per line.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::EventRecord;

/// File name of the event log inside a run directory.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Append-only writer for `<run_dir>/events.jsonl`.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    file: File,
}

impl EventLog {
    /// Create the run directory if needed and open its event log for append.
    pub fn open(run_dir: &Path) -> Result<Self> {
        fs::create_dir_all(run_dir)
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let path = run_dir.join(EVENTS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it.
    pub fn append(&mut self, record: &EventRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("Failed to serialize event")?;
        line.push(b'\n');
        self.file.write_all(&line).context("Failed to write event")?;
        self.file.flush().context("Failed to flush event")?;
        Ok(())
    }
}

/// Read every record of an event log in order.
///
/// A missing file is an empty log.
pub fn replay(path: &Path) -> Result<Vec<EventRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).with_context(|| format!("Failed to open events file: {}", path.display()))?;
    let mut records = Vec::new();

    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: EventRecord = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse event on line {}", n + 1))?;
        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::types::RunStatus;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn appends_and_replays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();
        let mut log = EventLog::open(&dir.path().join(run_id.to_string())).unwrap();

        for (offset, node) in ["build.a", "build.b"].into_iter().enumerate() {
            log.append(&EventRecord {
                offset: offset as u64,
                run_id,
                timestamp: Utc::now(),
                event: Event::StepDispatched { node: node.to_string() },
            })
            .unwrap();
        }
        log.append(&EventRecord {
            offset: 2,
            run_id,
            timestamp: Utc::now(),
            event: Event::RunCompleted {
                status: RunStatus::Succeeded,
                error: None,
            },
        })
        .unwrap();

        let records = replay(log.path()).unwrap();
        let offsets: Vec<u64> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(records[1].event.node(), Some("build.b"));
        assert!(records[2].event.is_terminal());
    }

    #[test]
    fn missing_log_replays_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(replay(&dir.path().join(EVENTS_FILE)).unwrap().is_empty());
    }

    #[test]
    fn corrupt_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(EVENTS_FILE);
        fs::write(&path, "{not json}\n").unwrap();
        let err = replay(&path).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
