//! Build progress callbacks.
//!
//! Runtimes report build output line by line through a [`ProgressSink`]. How
//! the lines reach a user (log, UI, websocket) is up to the sink.

use std::sync::Mutex;
use tracing::debug;

pub trait ProgressSink: Send + Sync {
    fn on_line(&self, machine: &str, line: &str);
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_line(&self, _machine: &str, _line: &str) {}
}

/// Forwards progress lines to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_line(&self, machine: &str, line: &str) {
        debug!(target: "berth::build", "[{machine}] {line}");
    }
}

/// Keeps every line in memory.
#[derive(Debug, Default)]
pub struct CollectProgress {
    lines: Mutex<Vec<(String, String)>>,
}

impl CollectProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(String, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl ProgressSink for CollectProgress {
    fn on_line(&self, machine: &str, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((machine.to_owned(), line.to_owned()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_progress_keeps_order() {
        let sink = CollectProgress::new();
        sink.on_line("app", "Step 1/2");
        sink.on_line("app", "Step 2/2");
        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], ("app".to_owned(), "Step 2/2".to_owned()));
    }

    #[test]
    fn no_progress_accepts_lines() {
        NoProgress.on_line("db", "ignored");
        TracingProgress.on_line("db", "logged");
    }
}
