//! Index progress events and reporters.
//!
//! Indexing publishes [`IndexEvent`]s on a tokio channel. The CLI drains
//! the channel into a [`ProgressReporter`], which writes to **stderr** so
//! stdout stays parseable for scripts.

use serde::Serialize;
use std::io::Write;

use crate::engine::{FileOutcome, IndexReport};

/// A single progress event from an indexing run.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IndexEvent {
    /// Walk finished; `total` files will be considered.
    Started { total: usize },
    /// File `n` of `total` was processed.
    File {
        path: String,
        n: usize,
        total: usize,
        #[serde(flatten)]
        outcome: FileOutcome,
    },
    /// File could not be read or decoded.
    Skipped { path: String, reason: String },
    /// Cancellation observed after `processed` files.
    Cancelled { processed: usize, total: usize },
    Finished(IndexReport),
}

/// Renders progress events. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &IndexEvent);
}

/// Human-friendly progress: "index  12 / 340  Characters/Chime.md  (4 chunks)".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &IndexEvent) {
        let line = match event {
            IndexEvent::Started { total } => {
                format!("index  scanning {} files\n", format_number(*total as u64))
            }
            IndexEvent::File {
                path,
                n,
                total,
                outcome,
            } => {
                let detail = match outcome {
                    FileOutcome::Indexed { chunks, .. } => format!("{} chunks", chunks),
                    FileOutcome::Unchanged => "unchanged".to_string(),
                    FileOutcome::Refreshed => "refreshed".to_string(),
                    FileOutcome::Repushed { vectors_ok: true } => "vectors restored".to_string(),
                    FileOutcome::Repushed { vectors_ok: false } => "vectors still missing".to_string(),
                    FileOutcome::Discarded => "discarded".to_string(),
                };
                format!(
                    "index  {} / {}  {}  ({})\n",
                    format_number(*n as u64),
                    format_number(*total as u64),
                    path,
                    detail
                )
            }
            IndexEvent::Skipped { path, reason } => format!("index  skipped {}: {}\n", path, reason),
            IndexEvent::Cancelled { processed, total } => {
                format!("index  cancelled after {} / {} files\n", processed, total)
            }
            IndexEvent::Finished(report) => format!(
                "index  done: {} indexed, {} unchanged, {} removed\n",
                report.indexed, report.unchanged, report.removed
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &IndexEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &IndexEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn json_event_shape() {
        let event = IndexEvent::File {
            path: "a.md".to_string(),
            n: 1,
            total: 2,
            outcome: FileOutcome::Indexed {
                chunks: 3,
                vectors_ok: true,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "file");
        assert_eq!(json["path"], "a.md");
        assert_eq!(json["outcome"], "indexed");
        assert_eq!(json["chunks"], 3);
    }
}
