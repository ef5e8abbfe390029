//! Hardware Capabilities
//!
//! The acquisition core talks to hardware through two small capability traits:
//!
//! - `Instrument`: a single-acquisition waveform recorder (oscilloscope, digitizer)
//! - `ComputationDevice`: a register-mapped device under test (FPGA target)
//!
//! Concrete vendor bindings implement these traits outside the core. The crate ships
//! a generic SCPI recorder (`hardware::scpi_recorder`) and simulated devices
//! (`hardware::mock`).
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Takes `&mut self`: the orchestrator owns both handles exclusively for a session
//! - Uses anyhow::Result for errors
//! - Exposes primitive steps only; retry and polling policy lives in
//!   `acquisition::controller` and `acquisition::driver`
//!
//! # Example
//!
//! ```rust,ignore
//! async fn one_shot<I: Instrument>(scope: &mut I) -> Result<Vec<u8>> {
//!     scope.stop().await?;
//!     scope.request_single().await?;
//!     while !scope.query_status().await?.contains("WAIT") {}
//!     scope.select_segment(0).await?;
//!     scope.read_raw_block().await
//! }
//! ```

use crate::config::{AcquireMode, ChannelConfig, TriggerConfig};
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// Per-segment conversion from raw sample codes to volts.
///
/// `value = (raw - reference) * increment + origin`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Volts per raw code
    pub increment: f64,
    /// Offset in volts
    pub origin: f64,
    /// Raw code corresponding to `origin`
    pub reference: f64,
}

impl Default for Calibration {
    /// Identity mapping, used when the recorder cannot report calibration.
    fn default() -> Self {
        Self {
            increment: 1.0,
            origin: 0.0,
            reference: 0.0,
        }
    }
}

impl Calibration {
    /// Convert one raw sample code.
    pub fn apply(&self, raw: u8) -> f32 {
        ((f64::from(raw) - self.reference) * self.increment + self.origin) as f32
    }
}

/// Capability: Single-Acquisition Waveform Recorder
///
/// # Contract
/// - `stop` clears any acquisition in progress
/// - `request_single` requests exactly one acquisition (all configured segments)
/// - `query_status` returns the raw trigger-status token, upper-cased
/// - `query_point_count` and `query_calibration` may return `Ok(None)` when the
///   recorder cannot answer; callers fall back to configured defaults
/// - `read_raw_block` returns the unconverted sample codes of the selected segment
#[async_trait]
pub trait Instrument: Send {
    /// Open the transport and identify the recorder
    async fn connect(&mut self) -> Result<()>;

    /// Return to a known state and stop acquiring
    async fn reset(&mut self) -> Result<()>;

    /// Configure the recorded channel
    async fn configure_channel(&mut self, cfg: &ChannelConfig) -> Result<()>;

    /// Configure the trigger
    async fn configure_trigger(&mut self, cfg: &TriggerConfig) -> Result<()>;

    /// Configure acquisition mode, memory depth and number of segments per acquisition
    async fn configure_acquisition(
        &mut self,
        mode: AcquireMode,
        points: usize,
        segments: usize,
    ) -> Result<()>;

    /// Stop and clear the current acquisition
    async fn stop(&mut self) -> Result<()>;

    /// Request one single acquisition
    async fn request_single(&mut self) -> Result<()>;

    /// Block until queued commands are processed (operation-complete query)
    async fn operation_complete(&mut self) -> Result<()>;

    /// Query the trigger status token
    async fn query_status(&mut self) -> Result<String>;

    /// Select the segment subsequent reads refer to
    async fn select_segment(&mut self, index: usize) -> Result<()>;

    /// Number of points in the selected segment, if the recorder reports it
    async fn query_point_count(&mut self) -> Result<Option<usize>>;

    /// Calibration of the selected segment, if the recorder reports it
    async fn query_calibration(&mut self) -> Result<Option<Calibration>>;

    /// Raw sample codes of the selected segment
    async fn read_raw_block(&mut self) -> Result<Vec<u8>>;

    /// Number of trigger events seen by the recorder, if supported
    async fn trigger_count(&mut self) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Release the recorder
    async fn disconnect(&mut self) -> Result<()>;
}

/// Capability: Register-Mapped Computation Device
///
/// # Contract
/// - Register reads and writes are byte-exact; byte-order conventions are applied
///   by `acquisition::driver`, not by the binding
/// - `reset` returns the device to its idle state
#[async_trait]
pub trait ComputationDevice: Send {
    /// Connect, optionally programming the device first
    async fn connect(&mut self, program: Option<&Path>) -> Result<()>;

    /// Write bytes to a register
    async fn write_register(&mut self, addr: u32, bytes: &[u8]) -> Result<()>;

    /// Read `len` bytes from a register
    async fn read_register(&mut self, addr: u32, len: usize) -> Result<Vec<u8>>;

    /// Reset device-internal state
    async fn reset(&mut self) -> Result<()>;

    /// Release the device
    async fn disconnect(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_maps_codes_to_volts() {
        let cal = Calibration {
            increment: 0.5,
            origin: -1.0,
            reference: 128.0,
        };
        assert_eq!(cal.apply(128), -1.0);
        assert_eq!(cal.apply(130), 0.0);
        assert_eq!(cal.apply(126), -2.0);
    }

    #[test]
    fn default_calibration_is_identity() {
        let cal = Calibration::default();
        assert_eq!(cal.apply(0), 0.0);
        assert_eq!(cal.apply(200), 200.0);
    }
}
