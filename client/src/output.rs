//! Shared output/trace channel.
//!
//! One [`OutputChannel`] serves both general client output and protocol
//! tracing — all writers append lines to the same sink. The channel never
//! raises the host UI itself; it records a reveal request when a line
//! crosses the configured [`RevealOutputChannelOn`] threshold, and the
//! host decides what (if anything) to do with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;

/// Severity of a single output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OutputLevel {
    Trace,
    Info,
    Warn,
    Error,
}

impl OutputLevel {
    fn label(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// When the host should bring the output channel into view.
///
/// `Never` is the least intrusive level and the default — new lines are
/// recorded but the channel is never surfaced automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevealOutputChannelOn {
    Info,
    Warn,
    Error,
    #[default]
    Never,
}

impl RevealOutputChannelOn {
    fn triggered_by(self, level: OutputLevel) -> bool {
        match self {
            Self::Never => false,
            Self::Error => level >= OutputLevel::Error,
            Self::Warn => level >= OutputLevel::Warn,
            Self::Info => level >= OutputLevel::Info,
        }
    }
}

/// Named, cloneable, append-only line sink.
///
/// Clones share the same underlying buffer, so the session, the
/// connection tasks, and the error handler all write to one place.
#[derive(Debug, Clone)]
pub struct OutputChannel {
    name: Arc<str>,
    reveal_on: RevealOutputChannelOn,
    lines: Arc<Mutex<Vec<String>>>,
    reveal_requested: Arc<AtomicBool>,
}

impl OutputChannel {
    #[must_use]
    pub fn new(name: &str, reveal_on: RevealOutputChannelOn) -> Self {
        Self {
            name: Arc::from(name),
            reveal_on,
            lines: Arc::new(Mutex::new(Vec::new())),
            reveal_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn push(&self, level: OutputLevel, message: &str) {
        let line = format!("[{}] {message}", level.label());
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line);
        }
        if self.reveal_on.triggered_by(level) {
            self.reveal_requested.store(true, Ordering::Relaxed);
        }
    }

    /// General client output.
    pub fn append(&self, message: &str) {
        tracing::debug!(channel = %self.name, "{message}");
        self.push(OutputLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(channel = %self.name, "{message}");
        self.push(OutputLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(channel = %self.name, "{message}");
        self.push(OutputLevel::Error, message);
    }

    /// Protocol tracing. Same sink as general output.
    pub fn trace(&self, message: &str) {
        tracing::trace!(channel = %self.name, "{message}");
        self.push(OutputLevel::Trace, message);
    }

    /// Snapshot of all lines appended so far, in order.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Whether any line has crossed the reveal threshold.
    #[must_use]
    pub fn reveal_requested(&self) -> bool {
        self.reveal_requested.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_shared_between_clones() {
        let channel = OutputChannel::new("regal-ls", RevealOutputChannelOn::Never);
        let clone = channel.clone();
        channel.append("from original");
        clone.error("from clone");

        let lines = channel.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "[info] from original");
        assert_eq!(lines[1], "[error] from clone");
    }

    #[test]
    fn test_never_reveal_even_on_errors() {
        let channel = OutputChannel::new("regal-ls", RevealOutputChannelOn::Never);
        channel.error("server exploded");
        channel.error("again");
        assert!(!channel.reveal_requested());
    }

    #[test]
    fn test_reveal_on_error_ignores_info() {
        let channel = OutputChannel::new("regal-ls", RevealOutputChannelOn::Error);
        channel.append("starting");
        channel.trace("--> initialize");
        assert!(!channel.reveal_requested());

        channel.error("protocol error");
        assert!(channel.reveal_requested());
    }

    #[test]
    fn test_reveal_on_info_triggered_by_warn() {
        let channel = OutputChannel::new("regal-ls", RevealOutputChannelOn::Info);
        channel.warn("slow response");
        assert!(channel.reveal_requested());
    }

    #[test]
    fn test_trace_never_reveals() {
        let channel = OutputChannel::new("regal-ls", RevealOutputChannelOn::Info);
        channel.trace("<-- publishDiagnostics");
        assert!(!channel.reveal_requested());
    }

    #[test]
    fn test_default_reveal_policy_is_never() {
        assert_eq!(RevealOutputChannelOn::default(), RevealOutputChannelOn::Never);
    }

    #[test]
    fn test_reveal_policy_deserializes() {
        let policy: RevealOutputChannelOn = serde_json::from_str("\"never\"").unwrap();
        assert_eq!(policy, RevealOutputChannelOn::Never);
        let policy: RevealOutputChannelOn = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(policy, RevealOutputChannelOn::Error);
    }
}
