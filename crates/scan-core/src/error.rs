//! Error taxonomy for the scan engine.
//!
//! `ScanError` consolidates everything that can go wrong between scan
//! configuration and session teardown. The variants map one-to-one onto
//! how the session reacts:
//!
//! - **`InvalidScanConfig`**: bad grid parameters (zero step, too few
//!   axes). Surfaced during validation, before any device command is
//!   issued.
//! - **`Configuration`**: actuator/detector identity mismatch against the
//!   grid. Fatal, aborts the session with no partial retry.
//! - **`Timeout`**: a move or acquire deadline elapsed. Fatal, reported
//!   distinctly from other failures.
//! - **`Dimensionality`**: a grid-cell index arity outside {1, 2}. Fatal.
//! - **`Persistence`**: a storage failure. At channel level this is
//!   recovered locally (the channel is skipped for the step); anywhere
//!   else it is session-fatal.
//! - **`Device`**: a driver call failed (move command rejected, trigger
//!   refused). Session-fatal.

use thiserror::Error;

/// Which wait point a deadline expired at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    /// Waiting on actuator move-completion signals.
    Move,
    /// Waiting on detector acquisition-completion signals.
    Acquire,
}

impl std::fmt::Display for WaitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            WaitPhase::Move => "move",
            WaitPhase::Acquire => "acquire",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Primary error type for scan configuration and execution.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Grid parameters cannot produce a valid scan.
    #[error("Invalid scan configuration: {0}")]
    InvalidScanConfig(String),

    /// Semantic mismatch between the grid and the configured devices.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A per-step wait deadline elapsed before all completions arrived.
    #[error("Deadline exceeded during {phase} wait at step {step} (missing: {missing:?})")]
    Timeout {
        phase: WaitPhase,
        step: usize,
        missing: Vec<String>,
    },

    /// Grid-cell index arity outside the supported 1D/2D addressing.
    #[error("Grid index arity {arity} is not 1 (Scan1D) or 2 (Scan2D)")]
    Dimensionality { arity: usize },

    /// Storage layer failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A device driver rejected or failed a command.
    #[error("Device error: {0}")]
    Device(String),
}

impl ScanError {
    /// Wrap a driver-level failure (drivers report through `anyhow`).
    pub fn device(err: anyhow::Error) -> Self {
        ScanError::Device(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_names_the_phase() {
        let err = ScanError::Timeout {
            phase: WaitPhase::Move,
            step: 3,
            missing: vec!["X".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("move wait"));
        assert!(text.contains("step 3"));
    }

    #[test]
    fn dimensionality_display() {
        let err = ScanError::Dimensionality { arity: 3 };
        assert!(err.to_string().contains("arity 3"));
    }
}
