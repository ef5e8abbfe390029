//! End-to-end alignment pass over a captured trace set.

use super::event::{align, locate_event, reference_index};
use super::filter::filter;
use super::normalize::normalize;
use super::window::{detect_window, AlignmentWindow};
use crate::config::AlignmentConfig;
use crate::error::{DaqError, DaqResult};
use crate::storage::TraceSet;

/// Terminal artifact of the offline phase.
///
/// Every retained trace is finite and non-constant, and every metadata array of
/// `traces` has the same length and order as the waveforms.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedDataset {
    /// Cropped, normalized traces with parallel metadata
    pub traces: TraceSet,
    /// Crop window in the (realigned) sample coordinates
    pub window: AlignmentWindow,
    /// Sample every event was moved to, when realignment ran
    pub reference: Option<usize>,
    /// Traces removed by the final filter
    pub dropped: usize,
}

/// Stateless alignment pipeline parameterised by one `AlignmentConfig`.
#[derive(Debug, Clone)]
pub struct AlignmentEngine {
    cfg: AlignmentConfig,
}

impl AlignmentEngine {
    /// Create an engine.
    pub fn new(cfg: AlignmentConfig) -> Self {
        Self { cfg }
    }

    /// Active window across all traces.
    pub fn detect_window(&self, traces: &[Vec<f32>]) -> AlignmentWindow {
        detect_window(traces, &self.cfg)
    }

    /// Event index of every trace inside `window`.
    pub fn locate_events(&self, traces: &[Vec<f32>], window: AlignmentWindow) -> Vec<usize> {
        traces.iter().map(|t| locate_event(t, window)).collect()
    }

    /// Reference index for `events` under the configured mode.
    pub fn reference_index(&self, events: &[usize]) -> Option<usize> {
        reference_index(events, self.cfg.reference)
    }

    /// Shift every trace so its event lands on `reference`.
    pub fn align(&self, traces: &[Vec<f32>], events: &[usize], reference: usize) -> Vec<Vec<f32>> {
        align(traces, events, reference)
    }

    /// Crop and normalize every trace.
    pub fn normalize(&self, traces: &[Vec<f32>], window: AlignmentWindow) -> Vec<Vec<f32>> {
        normalize(traces, window, self.cfg.baseline_window, &self.cfg)
    }

    /// Drop unusable traces with their metadata, returning how many were dropped.
    pub fn filter(&self, set: &mut TraceSet) -> usize {
        filter(set, self.cfg.variance_epsilon)
    }

    /// Run the whole pipeline: detect, (locate, reference, align, recenter),
    /// normalize, filter.
    pub fn process(&self, mut set: TraceSet) -> DaqResult<AlignedDataset> {
        if !set.is_consistent() {
            return Err(DaqError::Alignment(
                "metadata arrays do not match the waveform count".into(),
            ));
        }
        let len = match set.sample_len() {
            Some(len) if len > 0 => len,
            _ => return Err(DaqError::Alignment("no samples to align".into())),
        };
        if let Some(bad) = set.waves.iter().find(|w| w.len() != len) {
            return Err(DaqError::LengthMismatch {
                expected: len,
                actual: bad.len(),
            });
        }

        let mut window = self.detect_window(&set.waves);
        tracing::info!(
            traces = set.len(),
            start = window.start,
            end = window.end,
            "Detected active window"
        );

        let mut reference = None;
        if self.cfg.align {
            let events = self.locate_events(&set.waves, window);
            let r = self
                .reference_index(&events)
                .ok_or_else(|| DaqError::Alignment("no events to derive a reference".into()))?;
            if r >= len {
                return Err(DaqError::Alignment(format!(
                    "reference index {r} outside traces of {len} samples"
                )));
            }
            set.waves = self.align(&set.waves, &events, r);
            window = window.recenter(r, len);
            reference = Some(r);
            tracing::info!(
                reference = r,
                start = window.start,
                end = window.end,
                "Traces aligned, crop window recentered"
            );
        }

        set.waves = self.normalize(&set.waves, window);
        let dropped = self.filter(&mut set);
        if dropped > 0 {
            tracing::warn!(dropped, kept = set.len(), "Dropped non-finite or constant traces");
        }

        Ok(AlignedDataset {
            traces: set,
            window,
            reference,
            dropped,
        })
    }
}
