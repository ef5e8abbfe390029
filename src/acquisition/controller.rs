//! Instrument controller.
//!
//! Owns the recorder handle and implements the two protocols the capture loop
//! depends on:
//!
//! - **Arming**: stop, request a single acquisition, optionally wait for the
//!   operation-complete acknowledgment, then poll the status until one of the
//!   accepted armed tokens shows up. The whole sequence is retried a fixed number
//!   of times. Never arming is reported as `false`, not as an error; the
//!   orchestrator applies the skip/abort policy.
//! - **Segment read-back**: select, size, calibrate, read, convert. Transport errors
//!   are retried; when every attempt fails the segment degrades to a NaN vector of
//!   the expected length, so the run keeps a 1:1 correspondence between waveforms
//!   and metadata.

use crate::config::{millis, ArmConfig, RecorderConfig};
use crate::error::{DaqError, DaqResult};
use crate::hardware::capabilities::{Calibration, Instrument};
use std::time::Duration;
use tokio::time::Instant;

/// Result of reading one segment.
#[derive(Debug, Clone)]
pub struct SegmentRead {
    /// Calibrated samples (NaN-filled when degraded)
    pub samples: Vec<f32>,
    /// All read attempts failed
    pub degraded: bool,
}

/// Arm/read protocol over an `Instrument`.
pub struct InstrumentController<I: Instrument> {
    instrument: I,
    cfg: RecorderConfig,
    last_good_len: Option<usize>,
}

impl<I: Instrument> InstrumentController<I> {
    /// Wrap a recorder handle.
    pub fn new(instrument: I, cfg: RecorderConfig) -> Self {
        Self {
            instrument,
            cfg,
            last_good_len: None,
        }
    }

    /// Sample length of the last successful read.
    ///
    /// `None` until the recorder has delivered at least one segment.
    pub fn sample_len(&self) -> Option<usize> {
        self.last_good_len
    }

    /// Connect, reset and apply channel, trigger and acquisition settings.
    pub async fn setup(&mut self, segments: usize) -> DaqResult<()> {
        let fail = |what: &str, e: anyhow::Error| DaqError::Instrument(format!("{what}: {e:#}"));
        let inst = &mut self.instrument;

        inst.connect().await.map_err(|e| fail("connect failed", e))?;
        inst.reset().await.map_err(|e| fail("reset failed", e))?;
        inst.configure_channel(&self.cfg.channel)
            .await
            .map_err(|e| fail("channel setup failed", e))?;
        inst.configure_trigger(&self.cfg.trigger)
            .await
            .map_err(|e| fail("trigger setup failed", e))?;
        inst.configure_acquisition(self.cfg.acquire_mode, self.cfg.points_per_trace, segments)
            .await
            .map_err(|e| fail("acquisition setup failed", e))?;

        tracing::info!(
            resource = %self.cfg.resource,
            points = self.cfg.points_per_trace,
            segments,
            mode = ?self.cfg.acquire_mode,
            "Recorder configured"
        );
        Ok(())
    }

    fn is_armed(&self, status: &str) -> bool {
        self.cfg
            .arm
            .accepted_states
            .iter()
            .any(|token| status.contains(token.as_str()))
    }

    /// Arm the recorder for one single acquisition.
    ///
    /// Returns `false` when no attempt observed an armed status.
    pub async fn arm(&mut self) -> bool {
        let arm = self.cfg.arm.clone();
        let deadline_per_attempt = millis(arm.timeout_ms);
        let poll = millis(arm.poll_interval_ms);

        for attempt in 1..=arm.retries {
            match self.arm_attempt(&arm, deadline_per_attempt, poll).await {
                Ok(true) => {
                    tracing::trace!(attempt, "Recorder armed");
                    return true;
                }
                Ok(false) => {
                    tracing::warn!(attempt, retries = arm.retries, "Recorder did not arm");
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Arm attempt failed");
                    tokio::time::sleep(millis(arm.retry_backoff_ms)).await;
                }
            }
        }
        false
    }

    async fn arm_attempt(
        &mut self,
        arm: &ArmConfig,
        timeout: Duration,
        poll: Duration,
    ) -> anyhow::Result<bool> {
        // A stale acquisition must not satisfy the status poll
        if let Err(e) = self.instrument.stop().await {
            tracing::debug!(error = %e, "Stop before arming failed");
        }
        self.instrument.request_single().await?;
        if arm.wait_operation_complete {
            if let Err(e) = self.instrument.operation_complete().await {
                tracing::debug!(error = %e, "Operation-complete query failed");
            }
        }
        tokio::time::sleep(millis(arm.delay_ms)).await;

        let deadline = Instant::now() + timeout;
        loop {
            let status = self.instrument.query_status().await?;
            if self.is_armed(&status) {
                return Ok(true);
            }
            tracing::trace!(status = %status, "Waiting for armed status");
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Length of a degraded segment.
    fn fallback_len(&self) -> usize {
        self.last_good_len.unwrap_or(self.cfg.points_per_trace)
    }

    /// Read one calibrated segment, degrading to NaN when every attempt fails.
    pub async fn read_segment(&mut self, index: usize) -> SegmentRead {
        let attempts = self.cfg.read.attempts;
        for attempt in 1..=attempts {
            match self.read_attempt(index).await {
                Ok(samples) => {
                    self.last_good_len = Some(samples.len());
                    return SegmentRead {
                        samples,
                        degraded: false,
                    };
                }
                Err(e) => {
                    tracing::warn!(segment = index, attempt, attempts, error = %e, "Segment read failed");
                    if attempt < attempts {
                        tokio::time::sleep(millis(self.cfg.read.backoff_ms)).await;
                    }
                }
            }
        }

        let len = self.fallback_len();
        tracing::warn!(segment = index, len, "Read attempts exhausted, storing NaN segment");
        SegmentRead {
            samples: vec![f32::NAN; len],
            degraded: true,
        }
    }

    async fn read_attempt(&mut self, index: usize) -> anyhow::Result<Vec<f32>> {
        self.instrument.select_segment(index).await?;

        let expected = match self.instrument.query_point_count().await {
            Ok(Some(points)) if points > 0 => points,
            Ok(_) => self.fallback_len(),
            Err(e) => {
                tracing::debug!(error = %e, "Point count query failed");
                self.fallback_len()
            }
        };

        let calibration = match self.instrument.query_calibration().await {
            Ok(Some(cal)) => cal,
            Ok(None) => {
                tracing::warn!(segment = index, "Recorder reported no calibration, using identity");
                Calibration::default()
            }
            Err(e) => {
                tracing::warn!(segment = index, error = %e, "Calibration query failed, using identity");
                Calibration::default()
            }
        };

        let raw = self.instrument.read_raw_block().await?;
        if raw.is_empty() {
            anyhow::bail!("recorder returned zero points");
        }
        if raw.len() != expected {
            anyhow::bail!("expected {} points, received {}", expected, raw.len());
        }
        Ok(raw.iter().map(|&code| calibration.apply(code)).collect())
    }

    /// Number of triggers seen by the recorder, if it can report it.
    pub async fn trigger_count(&mut self) -> Option<u64> {
        match self.instrument.trigger_count().await {
            Ok(count) => count,
            Err(e) => {
                tracing::debug!(error = %e, "Trigger count query failed");
                None
            }
        }
    }

    /// Release the recorder.
    pub async fn disconnect(&mut self) -> DaqResult<()> {
        self.instrument
            .disconnect()
            .await
            .map_err(|e| DaqError::Instrument(format!("disconnect failed: {e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegisterMap;
    use crate::hardware::capabilities::ComputationDevice;
    use crate::hardware::mock::{MockBench, MockRecorder, MockSignal, MOCK_CALIBRATION};

    fn fast_cfg(points: usize) -> RecorderConfig {
        let mut cfg = RecorderConfig {
            points_per_trace: points,
            ..Default::default()
        };
        cfg.arm.delay_ms = 0;
        cfg.arm.timeout_ms = 5;
        cfg.arm.poll_interval_ms = 1;
        cfg.arm.retry_backoff_ms = 0;
        cfg.read.backoff_ms = 0;
        cfg
    }

    async fn capture_one(bench: &MockBench, ctl: &mut InstrumentController<MockRecorder>) {
        assert!(ctl.arm().await);
        let regs = RegisterMap::default();
        bench.device(regs).write_register(regs.go, &[1]).await.unwrap();
    }

    #[tokio::test]
    async fn arm_succeeds_after_scripted_failures() {
        let bench = MockBench::default();
        bench.with_state(|s| s.faults.arm_failures = 2).await;
        let mut ctl = InstrumentController::new(bench.recorder(), fast_cfg(400));

        assert!(ctl.arm().await);
        assert_eq!(bench.with_state(|s| s.requests).await, 3);
    }

    #[tokio::test]
    async fn arm_reports_false_after_retries() {
        let bench = MockBench::default();
        bench.with_state(|s| s.faults.arm_failures = 100).await;
        let mut ctl = InstrumentController::new(bench.recorder(), fast_cfg(400));

        assert!(!ctl.arm().await);
        assert_eq!(bench.with_state(|s| s.requests).await, 3);
    }

    #[tokio::test]
    async fn read_converts_with_calibration() {
        let bench = MockBench::new(MockSignal {
            noise: 0,
            ..Default::default()
        });
        let mut ctl = InstrumentController::new(bench.recorder(), fast_cfg(400));
        capture_one(&bench, &mut ctl).await;

        let read = ctl.read_segment(0).await;
        assert!(!read.degraded);
        assert_eq!(read.samples.len(), 400);
        // quiescent samples sit at the reference code
        assert_eq!(read.samples[0], MOCK_CALIBRATION.apply(128));
        assert!(read.samples[0].abs() < 1e-6);
    }

    #[tokio::test]
    async fn transient_read_errors_are_retried() {
        let bench = MockBench::default();
        let mut ctl = InstrumentController::new(bench.recorder(), fast_cfg(400));
        capture_one(&bench, &mut ctl).await;
        bench.with_state(|s| s.faults.read_failures = 2).await;

        let read = ctl.read_segment(0).await;
        assert!(!read.degraded);
        assert!(read.samples.iter().all(|v| v.is_finite()));
    }

    #[tokio::test]
    async fn exhausted_reads_degrade_to_nan_of_expected_length() {
        let bench = MockBench::default();
        let mut ctl = InstrumentController::new(bench.recorder(), fast_cfg(400));
        capture_one(&bench, &mut ctl).await;
        bench.with_state(|s| s.faults.read_failures = 3).await;

        let read = ctl.read_segment(0).await;
        assert!(read.degraded);
        assert_eq!(read.samples.len(), 400);
        assert!(read.samples.iter().all(|v| v.is_nan()));
    }

    #[tokio::test]
    async fn empty_segments_count_as_failed_reads() {
        let bench = MockBench::default();
        let mut ctl = InstrumentController::new(bench.recorder(), fast_cfg(400));
        capture_one(&bench, &mut ctl).await;
        bench.with_state(|s| s.faults.empty_reads = 3).await;

        let read = ctl.read_segment(0).await;
        assert!(read.degraded);
        assert_eq!(read.samples.len(), 400);
    }

    #[tokio::test]
    async fn missing_metadata_falls_back_to_defaults() {
        let bench = MockBench::default();
        bench
            .with_state(|s| {
                s.faults.report_points = false;
                s.faults.report_calibration = false;
            })
            .await;
        let mut ctl = InstrumentController::new(bench.recorder(), fast_cfg(400));
        capture_one(&bench, &mut ctl).await;

        let read = ctl.read_segment(0).await;
        assert!(!read.degraded);
        // identity calibration yields raw codes
        assert!(read.samples.iter().all(|v| (0.0..=255.0).contains(v)));
    }
}
