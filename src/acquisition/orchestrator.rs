//! Acquisition orchestrator.
//!
//! Drives one capture run. Each logical trace walks the state machine
//!
//! ```text
//! ARM -> TRIGGER -> WAIT_DONE -> READ -> ACCUMULATE -> DONE
//!  |                   |
//!  +-> SKIPPED         +-> ABORTED (computation timeout)
//!  +-> ABORTED (abort policy)
//! ```
//!
//! Averaging is controlled by two knobs:
//! - `segment_count` K: the recorder buffers K segments per acquisition; one arm is
//!   followed by K trigger/compute cycles and K segment reads.
//! - `repeat_count` M: the whole arm/trigger/read cycle is repeated M times and the
//!   segments are averaged in software (on top of any recorder-side averaging).
//!
//! With `SegmentCombine::Mean` one waveform is stored per logical trace (the mean
//! of all K*M captures); with `Retain` K waveforms are stored, each the mean of its
//! M repeats, sharing the trace metadata.
//!
//! A segment whose reads all fail before the recorder has delivered anything
//! has no trustworthy length. Traces made only of such segments are held back
//! and reach the store once a good read fixes the sample length, NaN-filled to
//! that length (or as captured, if the run never reads a good segment).
//!
//! Both hardware handles are owned by the orchestrator for the lifetime of the
//! run. Whatever way the run ends (completion, abort, or a panic inside the
//! capture loop) the pending batch is flushed and both handles are disconnected
//! before `run` returns.

use super::controller::{InstrumentController, SegmentRead};
use super::driver::ComputationDriver;
use super::pattern::{InputGenerator, TraceIo};
use crate::config::{millis, ArmFailurePolicy, RunConfig, SegmentCombine};
use crate::error::{DaqError, DaqResult};
use crate::hardware::capabilities::{ComputationDevice, Instrument};
use crate::storage::{RawTrace, TraceStore};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use tracing::Instrument as _;

/// Optional verification of device outputs.
///
/// Returning `None` means no expectation exists for this input.
pub trait OutputCheck: Send {
    /// Expected output for `input` under `key`.
    fn expected(&mut self, input: &[u8], key: Option<&[u8]>) -> Option<Vec<u8>>;
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every requested trace was attempted
    Completed,
    /// The run stopped early
    Aborted(String),
}

/// Aggregate result of a capture run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Logical traces requested
    pub requested: usize,
    /// Logical traces captured (degraded ones included)
    pub captured: usize,
    /// Logical traces skipped after arm failures
    pub skipped: usize,
    /// Logical traces containing at least one NaN segment
    pub degraded: usize,
    /// Outputs that disagreed with the output check
    pub output_mismatches: usize,
    /// Waveforms handed to the store
    pub stored: usize,
    /// Artifacts written
    pub batches_written: usize,
    /// Distinct recorder trigger counts seen
    pub trigger_counts: BTreeSet<u64>,
    /// Final state
    pub outcome: RunOutcome,
}

impl RunSummary {
    fn new(requested: usize) -> Self {
        Self {
            requested,
            captured: 0,
            skipped: 0,
            degraded: 0,
            output_mismatches: 0,
            stored: 0,
            batches_written: 0,
            trigger_counts: BTreeSet::new(),
            outcome: RunOutcome::Completed,
        }
    }

    fn log(&self) {
        match &self.outcome {
            RunOutcome::Completed => tracing::info!(
                requested = self.requested,
                captured = self.captured,
                skipped = self.skipped,
                degraded = self.degraded,
                output_mismatches = self.output_mismatches,
                stored = self.stored,
                batches = self.batches_written,
                trigger_counts = ?self.trigger_counts,
                "Acquisition run completed"
            ),
            RunOutcome::Aborted(reason) => tracing::error!(
                requested = self.requested,
                captured = self.captured,
                skipped = self.skipped,
                degraded = self.degraded,
                stored = self.stored,
                batches = self.batches_written,
                reason = %reason,
                "Acquisition run aborted"
            ),
        }
    }
}

/// Sequential capture loop over one recorder and one computation device.
pub struct AcquisitionOrchestrator<I: Instrument, D: ComputationDevice> {
    controller: InstrumentController<I>,
    driver: ComputationDriver<D>,
    store: TraceStore,
    inputs: InputGenerator,
    cfg: RunConfig,
    output_check: Option<Box<dyn OutputCheck>>,
    held: Vec<RawTrace>,
    summary: RunSummary,
}

impl<I: Instrument, D: ComputationDevice> AcquisitionOrchestrator<I, D> {
    /// Validate the configuration and take ownership of both hardware handles.
    pub fn new(instrument: I, device: D, cfg: RunConfig) -> DaqResult<Self> {
        cfg.validate()?;
        let store = TraceStore::new(&cfg.storage)?;
        let inputs = InputGenerator::new(&cfg.acquisition, cfg.device.block_bytes)?;
        Ok(Self {
            controller: InstrumentController::new(instrument, cfg.recorder.clone()),
            driver: ComputationDriver::new(device, cfg.device.clone()),
            store,
            inputs,
            summary: RunSummary::new(cfg.acquisition.n_traces),
            cfg,
            output_check: None,
            held: Vec::new(),
        })
    }

    /// Install an output check.
    pub fn with_output_check(mut self, check: Box<dyn OutputCheck>) -> Self {
        self.output_check = Some(check);
        self
    }

    /// Run the capture to completion or abort.
    ///
    /// Returns the summary of a completed run, or the error that aborted it. In
    /// both cases the partial batch has been flushed and the hardware released.
    pub async fn run(mut self) -> DaqResult<RunSummary> {
        let span = tracing::info_span!(
            "acquisition_run",
            traces = self.cfg.acquisition.n_traces,
            segments = self.cfg.acquisition.segment_count,
            repeats = self.cfg.acquisition.repeat_count,
            hardware_averages = self.cfg.recorder.hardware_averages(),
        );
        async move {
            let result = match AssertUnwindSafe(self.capture_all()).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(DaqError::Panicked(panic_message(payload.as_ref()))),
            };

            // Persist what was captured before releasing the hardware
            let persisted = self.release_held().and_then(|()| self.store.flush(true));
            let result = match (result, persisted) {
                (Ok(()), Ok(_)) => Ok(()),
                (Ok(()), Err(e)) => Err(e),
                (Err(e), Ok(_)) => Err(e),
                (Err(e), Err(flush_err)) => {
                    tracing::error!(error = %flush_err, "Final flush failed");
                    Err(e)
                }
            };
            self.summary.batches_written = self.store.written().len();
            self.teardown().await;

            match result {
                Ok(()) => {
                    self.summary.outcome = RunOutcome::Completed;
                    self.summary.log();
                    Ok(self.summary)
                }
                Err(e) => {
                    self.summary.outcome = RunOutcome::Aborted(e.to_string());
                    self.summary.log();
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn capture_all(&mut self) -> DaqResult<()> {
        self.controller
            .setup(self.cfg.acquisition.segment_count)
            .await?;
        self.driver.connect().await?;
        self.driver.initialize().await?;

        let total = self.cfg.acquisition.n_traces;
        let report_every = self.cfg.application.report_interval.max(1);

        for trace in 0..total {
            let io = self.inputs.next_io(trace);
            if let Some(records) = self.capture_trace(trace, &io).await? {
                if self.controller.sample_len().is_some() {
                    self.release_held()?;
                    self.store_records(records)?;
                } else {
                    self.held.extend(records);
                }
                self.summary.captured += 1;
            }

            if (trace + 1) % report_every == 0 {
                tracing::info!(
                    trace = trace + 1,
                    total,
                    skipped = self.summary.skipped,
                    degraded = self.summary.degraded,
                    "Capture progress"
                );
            }
        }
        Ok(())
    }

    /// Arm with one extra chance, then apply the arm-failure policy.
    ///
    /// `Ok(false)` means the trace is skipped.
    async fn arm_or_skip(&mut self, trace: usize) -> DaqResult<bool> {
        if self.controller.arm().await {
            return Ok(true);
        }
        tracing::warn!(trace, "Recorder not armed, re-arming");
        if self.controller.arm().await {
            return Ok(true);
        }

        let err = DaqError::ArmFailure {
            trace,
            attempts: 2 * self.cfg.recorder.arm.retries,
        };
        match self.cfg.acquisition.arm_failure_policy {
            ArmFailurePolicy::Skip if err.is_recoverable() => {
                self.summary.skipped += 1;
                tracing::warn!(trace, skipped = self.summary.skipped, error = %err, "Trace skipped");
                Ok(false)
            }
            _ => Err(err),
        }
    }

    /// Capture one logical trace. `None` means it was skipped.
    async fn capture_trace(
        &mut self,
        trace: usize,
        io: &TraceIo,
    ) -> DaqResult<Option<Vec<RawTrace>>> {
        let segments = self.cfg.acquisition.segment_count;
        let repeats = self.cfg.acquisition.repeat_count;
        let settle = millis(self.cfg.recorder.post_trigger_delay_ms);

        let mut reads: Vec<Vec<SegmentRead>> = vec![Vec::with_capacity(repeats); segments];
        let mut output = Vec::new();

        for _ in 0..repeats {
            if !self.arm_or_skip(trace).await? {
                return Ok(None);
            }

            for _ in 0..segments {
                output = self.driver.run_once(&io.input, io.key.as_deref()).await?;
            }
            tokio::time::sleep(settle).await;

            for (segment, slot) in reads.iter_mut().enumerate() {
                slot.push(self.controller.read_segment(segment).await);
            }
        }

        // A later good read may have fixed the length of earlier degraded ones
        let sample_len = self.controller.sample_len();
        let mut sums: Vec<Vec<f64>> = Vec::with_capacity(segments);
        let mut degraded = false;
        for slot in reads {
            let mut sum = Vec::new();
            for read in slot {
                degraded |= read.degraded;
                let wave = conform(read, sample_len);
                if wave.is_empty() {
                    return Err(DaqError::EmptyCapture { trace });
                }
                accumulate(&mut sum, &wave)?;
            }
            sums.push(sum);
        }

        if degraded {
            self.summary.degraded += 1;
        }
        self.check_output(trace, io, &output);
        let activity_count = self.controller.trigger_count().await;
        if let Some(count) = activity_count {
            self.summary.trigger_counts.insert(count);
        }

        let key = io.key.clone().unwrap_or_default();
        let make = |wave: Vec<f32>| RawTrace {
            wave,
            input: io.input.clone(),
            key: key.clone(),
            output: output.clone(),
            activity_count,
        };

        let records = match self.cfg.acquisition.segment_combine {
            SegmentCombine::Mean => {
                let mut total = Vec::new();
                for sum in &sums {
                    accumulate(&mut total, sum)?;
                }
                vec![make(mean(&total, segments * repeats))]
            }
            SegmentCombine::Retain => sums.iter().map(|sum| make(mean(sum, repeats))).collect(),
        };
        Ok(Some(records))
    }

    fn store_records(&mut self, records: Vec<RawTrace>) -> DaqResult<()> {
        for record in records {
            self.store.append(record)?;
            self.summary.stored += 1;
            self.store.flush(false)?;
        }
        Ok(())
    }

    /// Hand held-back traces to the store, resized to the known sample length.
    fn release_held(&mut self) -> DaqResult<()> {
        if self.held.is_empty() {
            return Ok(());
        }
        let mut held = std::mem::take(&mut self.held);
        let sample_len = self.controller.sample_len();
        if let Some(len) = sample_len {
            for record in &mut held {
                record.wave = vec![f32::NAN; len];
            }
        }
        tracing::debug!(traces = held.len(), ?sample_len, "Releasing held-back traces");
        self.store_records(held)
    }

    fn check_output(&mut self, trace: usize, io: &TraceIo, output: &[u8]) {
        let Some(check) = self.output_check.as_mut() else {
            return;
        };
        if let Some(expected) = check.expected(&io.input, io.key.as_deref()) {
            if expected != output {
                self.summary.output_mismatches += 1;
                tracing::warn!(trace, ?expected, ?output, "Device output mismatch");
            }
        }
    }

    async fn teardown(&mut self) {
        if let Err(e) = self.controller.disconnect().await {
            tracing::warn!(error = %e, "Recorder teardown failed");
        }
        if let Err(e) = self.driver.disconnect().await {
            tracing::warn!(error = %e, "Device teardown failed");
        }
        tracing::debug!("Hardware released");
    }
}

/// Samples of `read`, NaN-refilled to `sample_len` when degraded.
///
/// A segment that failed before any good read was sized from configuration,
/// which may disagree with what the recorder actually delivers.
fn conform(read: SegmentRead, sample_len: Option<usize>) -> Vec<f32> {
    match sample_len {
        Some(len) if read.degraded && read.samples.len() != len => vec![f32::NAN; len],
        _ => read.samples,
    }
}

/// Add `wave` into `sum`, sizing `sum` on first use.
fn accumulate<T: Copy + Into<f64>>(sum: &mut Vec<f64>, wave: &[T]) -> DaqResult<()> {
    if sum.is_empty() {
        sum.resize(wave.len(), 0.0);
    }
    if sum.len() != wave.len() {
        return Err(DaqError::LengthMismatch {
            expected: sum.len(),
            actual: wave.len(),
        });
    }
    for (acc, &v) in sum.iter_mut().zip(wave) {
        *acc += v.into();
    }
    Ok(())
}

fn mean(sum: &[f64], count: usize) -> Vec<f32> {
    sum.iter().map(|&v| (v / count as f64) as f32).collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
