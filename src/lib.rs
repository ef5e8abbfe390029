//! # trace_daq
//!
//! Synchronized waveform acquisition for a computation running on external hardware,
//! followed by offline alignment of the captured traces.
//!
//! A capture run pairs a waveform recorder (an oscilloscope behind SCPI, or the mock
//! bench) with a register-mapped computation device. For every trace the recorder is
//! armed, the device computes on a generated input, and the triggered segments are
//! read back, averaged and batched to disk. The offline side loads those batches,
//! finds the active window, realigns each trace on its event and normalizes them.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: capability traits for the two instruments, the SCPI binding and
//!   the mock bench used by tests and the `simulate` command.
//! - **`acquisition`**: `InstrumentController`, `ComputationDriver` and the
//!   `AcquisitionOrchestrator` state machine.
//! - **`storage`**: `TraceStore` batching and the Arrow IPC artifact format.
//! - **`alignment`**: window detection, event alignment, normalization and filtering.
//! - **`config`**: layered configuration (TOML file plus `TRACE_DAQ_` environment).
//! - **`error`**: the crate-wide `DaqError`.
//! - **`tracing_setup`**: subscriber initialization for the binary.

pub mod acquisition;
pub mod alignment;
pub mod config;
pub mod error;
pub mod hardware;
pub mod storage;
pub mod tracing_setup;

pub use error::{DaqError, DaqResult};
