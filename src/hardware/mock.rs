//! Mock Hardware Implementations
//!
//! Simulated recorder and computation device for running the full acquisition
//! pipeline without a bench. Both mocks share one `MockBench`, so starting a
//! computation on the `MockDevice` fills a segment of an armed `MockRecorder`,
//! the same causal link a trigger wire provides on real hardware.
//!
//! All mock devices use async-safe operations (tokio locks, no blocking sleeps).
//!
//! # Fault injection
//!
//! `MockFaults` scripts the failures the acquisition core must survive:
//! - `arm_failures`: single-acquisition requests that never reach an armed state
//! - `read_failures` / `empty_reads`: transport errors and zero-point segments
//! - `busy_polls` / `hang` / `hang_after`: slow or stuck computations
//! - `panic_on_start`: an uncaught fault in the middle of a trace
//!
//! # Example
//!
//! ```rust,ignore
//! let bench = MockBench::new(MockSignal::default());
//! let recorder = bench.recorder();
//! let device = bench.device(RegisterMap::default());
//! bench.with_state(|s| s.faults.read_failures = 2).await;
//! ```

use crate::config::{AcquireMode, ChannelConfig, RegisterMap, TriggerConfig};
use crate::hardware::capabilities::{Calibration, ComputationDevice, Instrument};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Calibration reported by the mock recorder.
pub const MOCK_CALIBRATION: Calibration = Calibration {
    increment: 0.001,
    origin: 0.0,
    reference: 128.0,
};

/// Shape of the synthetic waveform.
#[derive(Debug, Clone)]
pub struct MockSignal {
    /// Points per segment
    pub points: usize,
    /// Nominal sample at which the computation starts
    pub event_index: usize,
    /// Maximum random offset of the event (uniform in `[-jitter, jitter]`)
    pub jitter: usize,
    /// Samples the computation stays active
    pub active_len: usize,
    /// Step height in raw codes while active
    pub amplitude: u8,
    /// Peak noise in raw codes
    pub noise: u8,
    /// RNG seed for jitter and noise
    pub seed: u64,
}

impl Default for MockSignal {
    fn default() -> Self {
        Self {
            points: 400,
            event_index: 200,
            jitter: 10,
            active_len: 60,
            amplitude: 40,
            noise: 2,
            seed: 7,
        }
    }
}

/// Scripted failures.
#[derive(Debug, Clone)]
pub struct MockFaults {
    /// Remaining single-acquisition requests that will not arm
    pub arm_failures: u32,
    /// Remaining raw reads that fail with a transport error
    pub read_failures: u32,
    /// Remaining raw reads that return zero points
    pub empty_reads: u32,
    /// Busy-register polls that still read busy after a start
    pub busy_polls: u32,
    /// The busy flag never clears
    pub hang: bool,
    /// The busy flag never clears once more than this many computations started
    pub hang_after: Option<u32>,
    /// Panic when a computation is started
    pub panic_on_start: bool,
    /// Answer point-count queries
    pub report_points: bool,
    /// Answer calibration queries
    pub report_calibration: bool,
}

impl Default for MockFaults {
    fn default() -> Self {
        Self {
            arm_failures: 0,
            read_failures: 0,
            empty_reads: 0,
            busy_polls: 2,
            hang: false,
            hang_after: None,
            panic_on_start: false,
            report_points: true,
            report_calibration: true,
        }
    }
}

/// Shared state of the simulated bench.
#[derive(Debug)]
pub struct BenchState {
    /// Waveform shape
    pub signal: MockSignal,
    /// Scripted failures
    pub faults: MockFaults,
    /// Recorder waits for triggers
    pub armed: bool,
    /// Segments per acquisition
    pub segments: usize,
    /// Hardware averages per segment
    pub averages: u32,
    /// Segments filled by the current acquisition
    pub captured: Vec<Vec<u8>>,
    /// Segment selected for read-back
    pub selected: usize,
    /// Triggers observed by the recorder
    pub trigger_count: u64,
    /// Single-acquisition requests received
    pub requests: u32,
    /// Device register file
    pub registers: HashMap<u32, Vec<u8>>,
    /// Busy polls left for the running computation
    pub busy_remaining: u32,
    /// Computations started
    pub computations: u32,
    /// Recorder is connected
    pub recorder_connected: bool,
    /// Device is connected
    pub device_connected: bool,
    /// Raw blocks handed out by successful reads, in order
    pub delivered: Vec<Vec<u8>>,
    /// Recorder disconnect calls
    pub recorder_disconnects: u32,
    /// Device disconnect calls
    pub device_disconnects: u32,
    rng: StdRng,
}

impl BenchState {
    fn synthesize(&mut self, leak: u8) -> Vec<u8> {
        let sig = self.signal.clone();
        let offset = if sig.jitter > 0 {
            self.rng.gen_range(0..=2 * sig.jitter) as isize - sig.jitter as isize
        } else {
            0
        };
        let start = (sig.event_index as isize + offset).clamp(0, sig.points as isize) as usize;
        let end = (start + sig.active_len).min(sig.points);
        let height = sig.amplitude.saturating_add(leak);

        (0..sig.points)
            .map(|i| {
                let noise = if sig.noise > 0 {
                    self.rng.gen_range(-(sig.noise as i16)..=sig.noise as i16)
                } else {
                    0
                };
                let level = if (start..end).contains(&i) {
                    i16::from(height)
                } else {
                    0
                };
                (128 + level + noise).clamp(0, 255) as u8
            })
            .collect()
    }

    fn on_trigger(&mut self, leak: u8) {
        if !self.armed {
            return;
        }
        self.trigger_count += 1;
        let wave = self.synthesize(leak);
        self.captured.push(wave);
        if self.captured.len() >= self.segments {
            self.armed = false;
        }
    }
}

/// Handle to a simulated bench shared by a `MockRecorder` and a `MockDevice`.
#[derive(Clone)]
pub struct MockBench {
    state: Arc<Mutex<BenchState>>,
}

impl MockBench {
    /// Create a bench producing the given waveform.
    pub fn new(signal: MockSignal) -> Self {
        let rng = StdRng::seed_from_u64(signal.seed);
        Self {
            state: Arc::new(Mutex::new(BenchState {
                signal,
                faults: MockFaults::default(),
                armed: false,
                segments: 1,
                averages: 1,
                captured: Vec::new(),
                selected: 0,
                trigger_count: 0,
                requests: 0,
                registers: HashMap::new(),
                busy_remaining: 0,
                computations: 0,
                recorder_connected: false,
                device_connected: false,
                delivered: Vec::new(),
                recorder_disconnects: 0,
                device_disconnects: 0,
                rng,
            })),
        }
    }

    /// Recorder attached to this bench.
    pub fn recorder(&self) -> MockRecorder {
        MockRecorder {
            state: Arc::clone(&self.state),
        }
    }

    /// Computation device attached to this bench.
    pub fn device(&self, registers: RegisterMap) -> MockDevice {
        MockDevice {
            state: Arc::clone(&self.state),
            registers,
        }
    }

    /// Inspect or modify the bench state.
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut BenchState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }
}

impl Default for MockBench {
    fn default() -> Self {
        Self::new(MockSignal::default())
    }
}

// =============================================================================
// MockRecorder
// =============================================================================

/// Simulated single-acquisition recorder.
pub struct MockRecorder {
    state: Arc<Mutex<BenchState>>,
}

#[async_trait]
impl Instrument for MockRecorder {
    async fn connect(&mut self) -> Result<()> {
        self.state.lock().await.recorder_connected = true;
        tracing::debug!("MockRecorder connected");
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        let mut s = self.state.lock().await;
        s.armed = false;
        s.captured.clear();
        Ok(())
    }

    async fn configure_channel(&mut self, _cfg: &ChannelConfig) -> Result<()> {
        Ok(())
    }

    async fn configure_trigger(&mut self, _cfg: &TriggerConfig) -> Result<()> {
        Ok(())
    }

    async fn configure_acquisition(
        &mut self,
        mode: AcquireMode,
        points: usize,
        segments: usize,
    ) -> Result<()> {
        let mut s = self.state.lock().await;
        s.segments = segments.max(1);
        s.averages = match mode {
            AcquireMode::Average { count } => count,
            _ => 1,
        };
        if points != s.signal.points {
            tracing::debug!(
                requested = points,
                generated = s.signal.points,
                "MockRecorder memory depth differs from synthetic waveform"
            );
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.state.lock().await.armed = false;
        Ok(())
    }

    async fn request_single(&mut self) -> Result<()> {
        let mut s = self.state.lock().await;
        s.requests += 1;
        s.captured.clear();
        if s.faults.arm_failures > 0 {
            s.faults.arm_failures -= 1;
            s.armed = false;
        } else {
            s.armed = true;
        }
        Ok(())
    }

    async fn operation_complete(&mut self) -> Result<()> {
        Ok(())
    }

    async fn query_status(&mut self) -> Result<String> {
        let s = self.state.lock().await;
        Ok(if s.armed { "WAIT" } else { "STOP" }.to_string())
    }

    async fn select_segment(&mut self, index: usize) -> Result<()> {
        let mut s = self.state.lock().await;
        if index >= s.segments {
            bail!("Segment {} out of range ({} configured)", index, s.segments);
        }
        s.selected = index;
        Ok(())
    }

    async fn query_point_count(&mut self) -> Result<Option<usize>> {
        let s = self.state.lock().await;
        Ok(s.faults.report_points.then_some(s.signal.points))
    }

    async fn query_calibration(&mut self) -> Result<Option<Calibration>> {
        let s = self.state.lock().await;
        Ok(s.faults.report_calibration.then_some(MOCK_CALIBRATION))
    }

    async fn read_raw_block(&mut self) -> Result<Vec<u8>> {
        let mut s = self.state.lock().await;
        if s.faults.read_failures > 0 {
            s.faults.read_failures -= 1;
            bail!("MockRecorder: simulated transport error");
        }
        if s.faults.empty_reads > 0 {
            s.faults.empty_reads -= 1;
            return Ok(Vec::new());
        }
        let selected = s.selected;
        let block = s
            .captured
            .get(selected)
            .cloned()
            .ok_or_else(|| anyhow!("MockRecorder: segment {} holds no data", selected))?;
        s.delivered.push(block.clone());
        Ok(block)
    }

    async fn trigger_count(&mut self) -> Result<Option<u64>> {
        Ok(Some(self.state.lock().await.trigger_count))
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut s = self.state.lock().await;
        s.recorder_connected = false;
        s.recorder_disconnects += 1;
        Ok(())
    }
}

// =============================================================================
// MockDevice
// =============================================================================

/// Simulated register-mapped computation device.
///
/// Computes `output = input XOR key` and triggers the bench recorder when the
/// start flag is written.
pub struct MockDevice {
    state: Arc<Mutex<BenchState>>,
    registers: RegisterMap,
}

#[async_trait]
impl ComputationDevice for MockDevice {
    async fn connect(&mut self, program: Option<&Path>) -> Result<()> {
        if let Some(path) = program {
            tracing::debug!(program = %path.display(), "MockDevice ignoring program");
        }
        self.state.lock().await.device_connected = true;
        Ok(())
    }

    #[allow(clippy::panic)]
    async fn write_register(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        let mut s = self.state.lock().await;
        s.registers.insert(addr, bytes.to_vec());

        if addr == self.registers.go && bytes.first() == Some(&1) {
            if s.faults.panic_on_start {
                panic!("MockDevice: simulated fault on start");
            }
            let input = s.registers.get(&self.registers.input).cloned().unwrap_or_default();
            let key = s.registers.get(&self.registers.key).cloned().unwrap_or_default();
            let output: Vec<u8> = input
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ key.get(i).copied().unwrap_or(0))
                .collect();
            let leak = output.first().map_or(0, |b| b.count_ones() as u8);

            s.registers.insert(self.registers.output, output);
            s.busy_remaining = s.faults.busy_polls;
            s.computations += 1;
            s.on_trigger(leak);
        }
        Ok(())
    }

    async fn read_register(&mut self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let mut s = self.state.lock().await;
        if addr == self.registers.go {
            let stuck = s.faults.hang || s.faults.hang_after.is_some_and(|n| s.computations > n);
            let busy = stuck || s.busy_remaining > 0;
            if s.busy_remaining > 0 {
                s.busy_remaining -= 1;
            }
            return Ok(vec![u8::from(busy)]);
        }
        let mut value = s.registers.get(&addr).cloned().unwrap_or_default();
        value.resize(len, 0);
        Ok(value)
    }

    async fn reset(&mut self) -> Result<()> {
        let mut s = self.state.lock().await;
        s.registers.clear();
        s.busy_remaining = 0;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut s = self.state.lock().await;
        s.device_connected = false;
        s.device_disconnects += 1;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_flag_fills_armed_recorder() {
        let bench = MockBench::default();
        let regs = RegisterMap::default();
        let mut recorder = bench.recorder();
        let mut device = bench.device(regs);

        recorder.request_single().await.unwrap();
        assert_eq!(recorder.query_status().await.unwrap(), "WAIT");

        device.write_register(regs.input, &[0xff; 16]).await.unwrap();
        device.write_register(regs.key, &[0x0f; 16]).await.unwrap();
        device.write_register(regs.go, &[1]).await.unwrap();

        assert_eq!(recorder.query_status().await.unwrap(), "STOP");
        recorder.select_segment(0).await.unwrap();
        let wave = recorder.read_raw_block().await.unwrap();
        assert_eq!(wave.len(), MockSignal::default().points);
        assert_eq!(
            device.read_register(regs.output, 16).await.unwrap(),
            vec![0xf0; 16]
        );
    }

    #[tokio::test]
    async fn busy_flag_clears_after_scripted_polls() {
        let bench = MockBench::default();
        let regs = RegisterMap::default();
        let mut device = bench.device(regs);
        bench.with_state(|s| s.faults.busy_polls = 2).await;

        device.write_register(regs.go, &[1]).await.unwrap();
        assert_eq!(device.read_register(regs.go, 1).await.unwrap(), vec![1]);
        assert_eq!(device.read_register(regs.go, 1).await.unwrap(), vec![1]);
        assert_eq!(device.read_register(regs.go, 1).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn scripted_arm_failures_are_consumed() {
        let bench = MockBench::default();
        let mut recorder = bench.recorder();
        bench.with_state(|s| s.faults.arm_failures = 1).await;

        recorder.request_single().await.unwrap();
        assert_eq!(recorder.query_status().await.unwrap(), "STOP");
        recorder.request_single().await.unwrap();
        assert_eq!(recorder.query_status().await.unwrap(), "WAIT");
    }

    #[tokio::test]
    async fn unarmed_recorder_ignores_trigger() {
        let bench = MockBench::default();
        let regs = RegisterMap::default();
        let mut recorder = bench.recorder();
        let mut device = bench.device(regs);

        device.write_register(regs.go, &[1]).await.unwrap();
        assert!(recorder.read_raw_block().await.is_err());
        assert_eq!(recorder.trigger_count().await.unwrap(), Some(0));
    }
}
