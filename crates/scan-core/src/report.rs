//! Status report messages broadcast by the acquisition engine.
//!
//! Consumers (UIs, loggers, tests) subscribe to one broadcast channel and
//! receive tagged messages. `ScanDone`, `TimedOut` and `Stopped` are
//! terminal tags; a session emits exactly one of them, after storage has
//! been flushed.

use serde::{Deserialize, Serialize};

/// Severity of a textual status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{}", label)
    }
}

/// Tagged message sent over the engine's report channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScanReport {
    /// Free-text status line.
    UpdateStatus { text: String, severity: Severity },
    /// Progress: the session is processing this (step, average) pair.
    UpdateStepIndex { step: usize, average: usize },
    /// Terminal: the scan ran to completion (or failed after an error
    /// status was reported).
    ScanDone,
    /// Terminal: a move or acquire deadline elapsed.
    TimedOut,
    /// Terminal: the stop flag was honoured at a step boundary.
    Stopped,
}

impl ScanReport {
    /// Whether this tag ends a session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanReport::ScanDone | ScanReport::TimedOut | ScanReport::Stopped
        )
    }

    /// Shorthand for an informational status line.
    pub fn info(text: impl Into<String>) -> Self {
        ScanReport::UpdateStatus {
            text: text.into(),
            severity: Severity::Info,
        }
    }

    /// Shorthand for an error status line.
    pub fn error(text: impl Into<String>) -> Self {
        ScanReport::UpdateStatus {
            text: text.into(),
            severity: Severity::Error,
        }
    }
}
