//! Computation driver.
//!
//! Runs one computation on the register-mapped device: write input and key, pulse
//! the start flag, poll the busy flag with a hard iteration cap, read the result.
//! Starting the computation is what triggers the recorder, so the driver is the
//! synchronisation point between the two instruments.

use crate::config::{millis, DeviceConfig};
use crate::error::{DaqError, DaqResult};
use crate::hardware::capabilities::ComputationDevice;

/// Bounded start/poll/read protocol over a `ComputationDevice`.
pub struct ComputationDriver<D: ComputationDevice> {
    device: D,
    cfg: DeviceConfig,
}

impl<D: ComputationDevice> ComputationDriver<D> {
    /// Wrap a device handle.
    pub fn new(device: D, cfg: DeviceConfig) -> Self {
        Self { device, cfg }
    }

    /// Connect (programming the device if configured).
    pub async fn connect(&mut self) -> DaqResult<()> {
        let program = self.cfg.program.clone();
        self.device
            .connect(program.as_deref())
            .await
            .map_err(|e| DaqError::Device(format!("connect failed: {e:#}")))
    }

    /// Pulse the reset register and reset the device into a known state.
    pub async fn initialize(&mut self) -> DaqResult<()> {
        let reset = self.cfg.registers.reset;
        for level in [1u8, 0u8] {
            self.device
                .write_register(reset, &[level])
                .await
                .map_err(|e| DaqError::Device(format!("reset pulse failed: {e:#}")))?;
        }
        self.device
            .reset()
            .await
            .map_err(|e| DaqError::Device(format!("reset failed: {e:#}")))?;
        tracing::debug!("Computation device initialised");
        Ok(())
    }

    fn to_wire(&self, bytes: &[u8]) -> Vec<u8> {
        let mut wire = bytes.to_vec();
        if self.cfg.reverse_bytes {
            wire.reverse();
        }
        wire
    }

    /// Run one computation and return the device output.
    ///
    /// The busy flag is polled at most `max_busy_polls` times; running out of polls
    /// is a device-level fault and yields `DaqError::ComputationTimeout`.
    pub async fn run_once(&mut self, input: &[u8], key: Option<&[u8]>) -> DaqResult<Vec<u8>> {
        let regs = self.cfg.registers;
        let device_err = |what: &str, e: anyhow::Error| DaqError::Device(format!("{what}: {e:#}"));

        if let Some(key) = key {
            let wire = self.to_wire(key);
            self.device
                .write_register(regs.key, &wire)
                .await
                .map_err(|e| device_err("key write failed", e))?;
        }
        let wire = self.to_wire(input);
        self.device
            .write_register(regs.input, &wire)
            .await
            .map_err(|e| device_err("input write failed", e))?;
        self.device
            .write_register(regs.go, &[1])
            .await
            .map_err(|e| device_err("start failed", e))?;

        let interval = millis(self.cfg.busy_poll_interval_ms);
        let mut done = false;
        for _ in 0..self.cfg.max_busy_polls {
            let flag = self
                .device
                .read_register(regs.go, 1)
                .await
                .map_err(|e| device_err("busy poll failed", e))?;
            if flag.first().copied() != Some(1) {
                done = true;
                break;
            }
            tokio::time::sleep(interval).await;
        }
        if !done {
            return Err(DaqError::ComputationTimeout {
                polls: self.cfg.max_busy_polls,
            });
        }

        let mut output = self
            .device
            .read_register(regs.output, self.cfg.block_bytes)
            .await
            .map_err(|e| device_err("output read failed", e))?;
        if self.cfg.reverse_bytes {
            output.reverse();
        }
        Ok(output)
    }

    /// Release the device.
    pub async fn disconnect(&mut self) -> DaqResult<()> {
        self.device
            .disconnect()
            .await
            .map_err(|e| DaqError::Device(format!("disconnect failed: {e:#}")))
    }
}
