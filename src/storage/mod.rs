//! Trace storage.
//!
//! Captured traces are batched in memory by `TraceStore` and flushed as
//! numbered, ZSTD-compressed Arrow IPC artifacts. Each artifact is self-describing:
//! one `wave` column of equal-length Float32 waveforms plus parallel metadata
//! columns, and schema metadata naming the pipeline stage that produced it.
//!
//! The offline side reads artifacts back into a columnar `TraceSet`.

pub mod format;
pub mod trace_store;

pub use format::{
    artifact_path, list_artifacts, read_aligned_artifact, read_capture_artifact,
    read_capture_run, write_aligned_artifact,
};
pub use trace_store::TraceStore;

use crate::error::{DaqError, DaqResult};

/// One captured waveform with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTrace {
    /// Calibrated samples
    pub wave: Vec<f32>,
    /// Input block sent to the device
    pub input: Vec<u8>,
    /// Key block (empty when no key was written)
    pub key: Vec<u8>,
    /// Output block read back from the device
    pub output: Vec<u8>,
    /// Recorder trigger count after the capture, if reported
    pub activity_count: Option<u64>,
}

/// Columnar set of traces with parallel metadata arrays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceSet {
    /// Waveforms, all of one length
    pub waves: Vec<Vec<f32>>,
    /// Input per waveform
    pub inputs: Vec<Vec<u8>>,
    /// Key per waveform
    pub keys: Vec<Vec<u8>>,
    /// Output per waveform
    pub outputs: Vec<Vec<u8>>,
    /// Activity count per waveform
    pub activity_counts: Vec<Option<u64>>,
}

impl TraceSet {
    /// Number of traces.
    pub fn len(&self) -> usize {
        self.waves.len()
    }

    /// True when the set holds no traces.
    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    /// Common sample length, `None` for an empty set.
    pub fn sample_len(&self) -> Option<usize> {
        self.waves.first().map(Vec::len)
    }

    /// Append one trace, enforcing the common sample length.
    pub fn push(&mut self, trace: RawTrace) -> DaqResult<()> {
        if let Some(expected) = self.sample_len() {
            if trace.wave.len() != expected {
                return Err(DaqError::LengthMismatch {
                    expected,
                    actual: trace.wave.len(),
                });
            }
        }
        self.waves.push(trace.wave);
        self.inputs.push(trace.input);
        self.keys.push(trace.key);
        self.outputs.push(trace.output);
        self.activity_counts.push(trace.activity_count);
        Ok(())
    }

    /// Append every trace of `other`.
    pub fn extend(&mut self, other: TraceSet) -> DaqResult<()> {
        if let (Some(expected), Some(actual)) = (self.sample_len(), other.sample_len()) {
            if expected != actual {
                return Err(DaqError::LengthMismatch { expected, actual });
            }
        }
        self.waves.extend(other.waves);
        self.inputs.extend(other.inputs);
        self.keys.extend(other.keys);
        self.outputs.extend(other.outputs);
        self.activity_counts.extend(other.activity_counts);
        Ok(())
    }

    /// True when every metadata array matches the waveform count.
    pub fn is_consistent(&self) -> bool {
        let n = self.waves.len();
        self.inputs.len() == n
            && self.keys.len() == n
            && self.outputs.len() == n
            && self.activity_counts.len() == n
    }
}
