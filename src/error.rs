//! Custom error types for the acquisition and alignment pipeline.
//!
//! This module defines the primary error type, `DaqError`, shared by every stage of
//! the crate. Using the `thiserror` crate, it provides a centralized and consistent way
//! to report failures, from configuration and storage problems to hardware faults.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: parse errors from `figment`, and semantic
//!   errors caught by `RunConfig::validate`.
//! - **`Io`**, **`Arrow`**, **`Storage`**: persistence failures. A failed flush never
//!   leaves a partially written artifact behind.
//! - **`Instrument`**, **`Device`**: connection or setup failures of the recorder or
//!   the computation device. These are fatal for a run.
//! - **`ArmFailure`**: the recorder never reported an armed state. Whether this aborts
//!   the run depends on the configured `ArmFailurePolicy`.
//! - **`ComputationTimeout`**: the device busy flag never cleared. Always fatal.
//! - **`EmptyCapture`**: a zero-length waveform reached accumulation. Always fatal.
//! - **`LengthMismatch`**: traces of one run disagree on sample length.
//! - **`Alignment`**: the offline engine was handed unusable input.
//! - **`Panicked`**: the capture loop panicked; teardown still ran.
//!
//! Per-trace recoverable conditions (degraded reads, skipped traces, dropped traces)
//! are not errors at all: they only show up as counts in summaries.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Recorder failed to arm for trace {trace} after {attempts} attempts")]
    ArmFailure { trace: usize, attempts: u32 },

    #[error("Computation did not complete within {polls} status polls")]
    ComputationTimeout { polls: u32 },

    #[error("Recorder returned an empty waveform for trace {trace}")]
    EmptyCapture { trace: usize },

    #[error("Waveform length mismatch: expected {expected} samples, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Alignment error: {0}")]
    Alignment(String),

    #[error("Acquisition panicked: {0}")]
    Panicked(String),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// Whether the condition is local to a single trace.
    ///
    /// Only an arm failure can be absorbed by the orchestrator (under the skip
    /// policy); everything else indicates a device-, storage- or configuration-level
    /// fault and ends the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DaqError::ArmFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_failure_is_the_only_recoverable_kind() {
        assert!(DaqError::ArmFailure {
            trace: 3,
            attempts: 2
        }
        .is_recoverable());
        assert!(!DaqError::ComputationTimeout { polls: 100 }.is_recoverable());
        assert!(!DaqError::EmptyCapture { trace: 0 }.is_recoverable());
        assert!(!DaqError::Storage("disk full".into()).is_recoverable());
    }

    #[test]
    fn messages_carry_context() {
        let err = DaqError::ArmFailure {
            trace: 7,
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Recorder failed to arm for trace 7 after 3 attempts"
        );

        let err = DaqError::LengthMismatch {
            expected: 100,
            actual: 99,
        };
        assert!(err.to_string().contains("expected 100"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: DaqError = io.into();
        assert!(matches!(err, DaqError::Io(_)));
    }
}
