// src/exec/output.rs

//! Step output capture: bounded buffers, secret masking, streaming to the
//! event bus and parsing of the `$PIPEWRIGHT_OUTPUT` file.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::dag::NodeId;
use crate::events::{Event, EventBus};
use crate::exec::result::CapturedOutput;
use crate::types::StreamKind;

/// Byte buffer that keeps at most `cap` bytes and remembers whether it
/// dropped anything.
#[derive(Debug, Clone)]
pub struct BoundedBuffer {
    cap: usize,
    bytes: Vec<u8>,
    truncated: bool,
}

impl BoundedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            bytes: Vec::new(),
            truncated: false,
        }
    }

    /// Append as much of `chunk` as fits. Returns `false` once anything has
    /// been dropped.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        let room = self.cap.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(chunk);
        }
        !self.truncated
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_captured(self) -> CapturedOutput {
        CapturedOutput {
            bytes: self.bytes,
            truncated: self.truncated,
        }
    }
}

/// Replaces secret values with `***`.
#[derive(Debug, Clone, Default)]
pub struct Masker {
    values: Vec<String>,
}

impl Masker {
    pub fn new(values: impl IntoIterator<Item = String>) -> Self {
        let mut values: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
        // Longest first so a secret containing another is masked whole.
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        values.dedup();
        Self { values }
    }

    pub fn mask(&self, text: &str) -> String {
        self.values
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), "***"))
    }

    /// Length in bytes of the longest secret.
    fn longest(&self) -> usize {
        self.values.first().map_or(0, String::len)
    }

    fn spans_lines(&self) -> bool {
        self.values.iter().any(|v| v.contains('\n'))
    }

    /// Mask `bytes[..limit]`, returning the masked bytes and how far the
    /// input was consumed. A secret starting before `limit` is masked whole,
    /// so the consumed length may exceed `limit`. Callers must leave at
    /// least `longest() - 1` bytes after `limit` unless `bytes` is complete.
    fn mask_prefix(&self, bytes: &[u8], limit: usize) -> (Vec<u8>, usize) {
        let mut out = Vec::with_capacity(limit);
        let mut i = 0;
        while i < limit {
            match self.values.iter().find(|v| bytes[i..].starts_with(v.as_bytes())) {
                Some(secret) => {
                    out.extend_from_slice(b"***");
                    i += secret.len();
                }
                None => {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
        }
        (out, i)
    }
}

/// Largest cut `<= at` that does not split a UTF-8 sequence.
fn char_boundary(bytes: &[u8], at: usize) -> usize {
    let from = at.saturating_sub(3);
    for j in (from..at).rev() {
        let b = bytes[j];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let width = match b {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if j + width > at { j } else { at };
    }
    at
}

/// Per-stream state of an [`OutputSink`].
#[derive(Debug)]
struct StreamState {
    capture: BoundedBuffer,
    /// Bytes not yet masked: a secret or a character may continue in the
    /// next read.
    pending: Vec<u8>,
}

/// Where a running step writes its output.
///
/// Output is masked, appended to the stream's bounded buffer and published
/// as `StepOutputChunk`s. The tail of a write that could be the start of a
/// secret (or of a multi-byte character) is held until the next write or
/// [`OutputSink::finish`]. Reaching the capture limit publishes one notice;
/// streaming to the bus continues.
#[derive(Debug)]
pub struct OutputSink {
    node: NodeId,
    bus: Arc<EventBus>,
    masker: Arc<Masker>,
    stdout: Mutex<StreamState>,
    stderr: Mutex<StreamState>,
}

impl OutputSink {
    pub fn new(node: NodeId, bus: Arc<EventBus>, masker: Arc<Masker>, cap: usize) -> Arc<Self> {
        let state = || {
            Mutex::new(StreamState {
                capture: BoundedBuffer::new(cap),
                pending: Vec::new(),
            })
        };
        Arc::new(Self {
            node,
            bus,
            masker,
            stdout: state(),
            stderr: state(),
        })
    }

    fn state(&self, stream: StreamKind) -> &Mutex<StreamState> {
        match stream {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    pub fn write(&self, stream: StreamKind, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.release(stream, Some(chunk));
    }

    pub fn write_str(&self, stream: StreamKind, text: &str) {
        self.write(stream, text.as_bytes());
    }

    /// Mask and forward whatever can be released from `stream`. With
    /// `chunk == None` the stream has ended and everything is released.
    fn release(&self, stream: StreamKind, chunk: Option<&[u8]>) {
        let (data, hit_limit) = {
            let mut state = self.state(stream).lock().unwrap_or_else(|p| p.into_inner());
            let complete = match chunk {
                Some(chunk) => {
                    state.pending.extend_from_slice(chunk);
                    chunk.ends_with(b"\n") && !self.masker.spans_lines()
                }
                None => true,
            };

            let limit = if complete {
                state.pending.len()
            } else {
                let hold = self.masker.longest().saturating_sub(1);
                char_boundary(&state.pending, state.pending.len().saturating_sub(hold))
            };
            let (masked, consumed) = self.masker.mask_prefix(&state.pending, limit);
            state.pending.drain(..consumed);
            if masked.is_empty() {
                return;
            }

            let was_truncated = state.capture.is_truncated();
            let kept = state.capture.push(&masked);
            (String::from_utf8_lossy(&masked).into_owned(), !was_truncated && !kept)
        };

        self.bus.publish(Event::StepOutputChunk {
            node: self.node.clone(),
            stream,
            data,
        });

        if hit_limit {
            debug!(step = %self.node, ?stream, "output limit reached; truncating capture");
            self.bus.publish(Event::StepOutputChunk {
                node: self.node.clone(),
                stream,
                data: "\n[pipewright: output truncated]\n".to_string(),
            });
        }
    }

    /// Release held-back output and return both captured streams.
    pub fn finish(&self) -> (CapturedOutput, CapturedOutput) {
        self.release(StreamKind::Stdout, None);
        self.release(StreamKind::Stderr, None);
        let take = |m: &Mutex<StreamState>| {
            m.lock()
                .unwrap_or_else(|p| p.into_inner())
                .capture
                .clone()
                .into_captured()
        };
        (take(&self.stdout), take(&self.stderr))
    }
}

/// Parse the contents of a step's output file.
///
/// Accepted lines:
/// - `key=value`;
/// - `key<<DELIM` followed by value lines and a closing `DELIM` line;
/// - blank lines and `#` comments, which are ignored.
///
/// Later assignments to the same key win.
pub fn parse_output_file(contents: &str) -> Result<BTreeMap<String, String>, String> {
    let mut outputs = BTreeMap::new();
    let mut lines = contents.lines().enumerate();

    while let Some((n, raw)) = lines.next() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let eq = line.find('=');
        let heredoc = line.find("<<");
        let (key, value) = match (eq, heredoc) {
            (Some(e), Some(h)) if h < e => read_heredoc(line, h, n, &mut lines)?,
            (None, Some(h)) => read_heredoc(line, h, n, &mut lines)?,
            (Some(e), _) => (line[..e].trim().to_string(), line[e + 1..].to_string()),
            (None, None) => {
                return Err(format!("line {}: expected key=value, got '{}'", n + 1, line));
            }
        };

        if !is_output_key(&key) {
            return Err(format!("line {}: invalid output key '{}'", n + 1, key));
        }
        outputs.insert(key, value);
    }

    Ok(outputs)
}

fn read_heredoc<'a>(
    line: &str,
    at: usize,
    n: usize,
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
) -> Result<(String, String), String> {
    let key = line[..at].trim().to_string();
    let delimiter = line[at + 2..].trim();
    if delimiter.is_empty() {
        return Err(format!("line {}: missing heredoc delimiter", n + 1));
    }

    let mut body = Vec::new();
    for (_, raw) in lines.by_ref() {
        let value_line = raw.trim_end_matches('\r');
        if value_line == delimiter {
            return Ok((key, body.join("\n")));
        }
        body.push(value_line);
    }

    Err(format!("line {}: unterminated value for '{}' (expected '{}')", n + 1, key, delimiter))
}

fn is_output_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
