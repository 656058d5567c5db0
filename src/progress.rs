//! Ingestion progress reporting.
//!
//! Reports what the pipeline is doing so that long runs show how much is
//! left. Progress is emitted on **stderr** so stdout remains parseable for
//! scripts.

use std::io::{IsTerminal, Write};

/// A single progress event from the pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Pre-flight validation is running.
    Validating,
    /// Walking source directories. Total unknown.
    Discovering,
    /// `n` files handled out of `total`.
    Processing { n: u64, total: u64 },
    /// Post-processing: orphan rescue, pruning, checkpoint.
    Committing,
}

/// Receives pipeline progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "ingest  processing  1,234 / 5,000 files".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Validating => "ingest  validating...\n".to_string(),
            ProgressEvent::Discovering => "ingest  discovering...\n".to_string(),
            ProgressEvent::Processing { n, total } => format!(
                "ingest  processing  {} / {} files\n",
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::Committing => "ingest  committing...\n".to_string(),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Validating => serde_json::json!({"event": "progress", "phase": "validating"}),
            ProgressEvent::Discovering => serde_json::json!({"event": "progress", "phase": "discovering"}),
            ProgressEvent::Processing { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "processing",
                "n": n,
                "total": total
            }),
            ProgressEvent::Committing => serde_json::json!({"event": "progress", "phase": "committing"}),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
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
    /// Human progress when stderr is a terminal, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
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
}
