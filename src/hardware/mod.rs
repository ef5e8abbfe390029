//! Hardware Layer
//!
//! Capability traits for the two instruments of a capture run, plus the bindings
//! shipped with the crate:
//!
//! - `capabilities`: `Instrument` (waveform recorder) and `ComputationDevice`
//! - `scpi`: SCPI transport over TCP and IEEE 488.2 block decoding
//! - `scpi_recorder`: generic SCPI oscilloscope implementing `Instrument`
//! - `mock`: simulated recorder and device sharing one bench, with fault injection

pub mod capabilities;
pub mod mock;
pub mod scpi;
pub mod scpi_recorder;

pub use capabilities::{Calibration, ComputationDevice, Instrument};
