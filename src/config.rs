//! Run configuration using Figment
//!
//! A run is fully parameterised by one immutable `RunConfig` value, built before the
//! run starts and handed to the orchestrator and the alignment engine. It is loaded from:
//! 1. Built-in defaults (every section implements `Default`)
//! 2. A TOML file (default `config/trace_daq.toml`)
//! 3. Environment variables prefixed with `TRACE_DAQ_` (nested keys split on `__`)
//!
//! # Example
//! ```no_run
//! use trace_daq::config::RunConfig;
//!
//! let config = RunConfig::load_from("config/trace_daq.toml")?;
//! config.validate()?;
//! println!("Capturing {} traces", config.acquisition.n_traces);
//! # Ok::<(), trace_daq::error::DaqError>(())
//! ```

use crate::acquisition::pattern::parse_hex;
use crate::error::{DaqError, DaqResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Waveform recorder settings
    pub recorder: RecorderConfig,
    /// Computation device settings
    pub device: DeviceConfig,
    /// Per-trace capture policy
    pub acquisition: AcquisitionConfig,
    /// Artifact output settings
    pub storage: StorageConfig,
    /// Offline alignment parameters
    pub alignment: AlignmentConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log capture progress every N traces
    pub report_interval: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "trace-daq".to_string(),
            log_level: "info".to_string(),
            report_interval: 500,
        }
    }
}

/// Analog input channel of the recorder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel name as the recorder spells it (e.g. "CHAN1")
    pub source: String,
    /// Vertical scale in volts per division
    pub vertical_scale_v: f64,
    /// Input coupling ("DC" or "AC")
    pub coupling: String,
    /// Probe attenuation factor
    pub probe: f64,
    /// Bandwidth limit in MHz, `None` leaves the limit off
    pub bandwidth_limit_mhz: Option<u32>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            source: "CHAN1".to_string(),
            vertical_scale_v: 0.01,
            coupling: "DC".to_string(),
            probe: 1.0,
            bandwidth_limit_mhz: Some(20),
        }
    }
}

/// Edge slope for the trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSlope {
    /// Rising edge
    Positive,
    /// Falling edge
    Negative,
}

/// Edge trigger of the recorder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Trigger source (digital input or analog channel)
    pub source: String,
    /// Trigger level in volts
    pub level_v: f64,
    /// Edge slope
    pub slope: TriggerSlope,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            source: "CHAN2".to_string(),
            level_v: 1.5,
            slope: TriggerSlope::Positive,
        }
    }
}

/// Recorder acquisition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AcquireMode {
    /// Single-shot sampling
    Normal,
    /// High-resolution (oversampled) single-shot sampling
    HighRes,
    /// Recorder-side averaging over `count` triggers
    Average {
        /// Number of hardware averages
        count: u32,
    },
}

/// Arming protocol timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmConfig {
    /// Fixed settle delay after the single-acquisition request
    pub delay_ms: u64,
    /// Per-attempt deadline for observing an armed status
    pub timeout_ms: u64,
    /// Interval between status polls
    pub poll_interval_ms: u64,
    /// Attempts of the whole stop, request, poll sequence
    pub retries: u32,
    /// Backoff after an attempt that raised a transport error
    pub retry_backoff_ms: u64,
    /// Block on the operation-complete query after requesting an acquisition
    pub wait_operation_complete: bool,
    /// Status tokens accepted as "armed" (firmware vocabulary differs)
    pub accepted_states: Vec<String>,
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            delay_ms: 50,
            timeout_ms: 1000,
            poll_interval_ms: 20,
            retries: 3,
            retry_backoff_ms: 50,
            wait_operation_complete: true,
            accepted_states: ["WAIT", "ARM", "READY", "SINGLE", "TRIG"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Segment read-back retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    /// Attempts per segment before degrading to a NaN waveform
    pub attempts: u32,
    /// Backoff between attempts
    pub backoff_ms: u64,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 50,
        }
    }
}

/// Waveform recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Transport address (host:port for SCPI over TCP)
    pub resource: String,
    /// Recorded channel
    pub channel: ChannelConfig,
    /// Trigger setup
    pub trigger: TriggerConfig,
    /// Timebase in seconds per division
    pub time_per_div_s: f64,
    /// Expected points per segment, used when the recorder cannot report it
    pub points_per_trace: usize,
    /// Acquisition mode
    pub acquire_mode: AcquireMode,
    /// Arming protocol
    pub arm: ArmConfig,
    /// Read-back retries
    pub read: ReadConfig,
    /// Delay between acquisition complete and waveform read
    pub post_trigger_delay_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            resource: "127.0.0.1:5555".to_string(),
            channel: ChannelConfig::default(),
            trigger: TriggerConfig::default(),
            time_per_div_s: 2e-6,
            points_per_trace: 10_000,
            acquire_mode: AcquireMode::HighRes,
            arm: ArmConfig::default(),
            read: ReadConfig::default(),
            post_trigger_delay_ms: 1,
        }
    }
}

impl RecorderConfig {
    /// Number of recorder-side averages folded into every acquisition.
    pub fn hardware_averages(&self) -> u32 {
        match self.acquire_mode {
            AcquireMode::Average { count } => count,
            _ => 1,
        }
    }
}

/// Register addresses of the computation device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMap {
    /// Key input register
    pub key: u32,
    /// Data input register
    pub input: u32,
    /// Result register
    pub output: u32,
    /// Start flag / busy register
    pub go: u32,
    /// Reset register
    pub reset: u32,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            key: 0x08,
            input: 0x09,
            output: 0x0a,
            go: 0x05,
            reset: 0x07,
        }
    }
}

/// Computation device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Program (bitstream) handed to the device binding on connect
    pub program: Option<PathBuf>,
    /// Register addresses
    pub registers: RegisterMap,
    /// Width of input, key and output blocks in bytes
    pub block_bytes: usize,
    /// Device registers expect reversed byte order
    pub reverse_bytes: bool,
    /// Interval between busy-register polls
    pub busy_poll_interval_ms: u64,
    /// Busy polls before declaring a computation timeout
    pub max_busy_polls: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            program: None,
            registers: RegisterMap::default(),
            block_bytes: 16,
            reverse_bytes: true,
            busy_poll_interval_ms: 1,
            max_busy_polls: 1000,
        }
    }
}

/// What to do with a trace whose recorder never armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmFailurePolicy {
    /// Count the trace as skipped and continue with the next one
    Skip,
    /// Abort the whole run
    Abort,
}

/// How the segments of one logical trace are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentCombine {
    /// Element-wise mean of all segments
    Mean,
    /// Keep each segment as its own trace (sharing metadata)
    Retain,
}

/// Per-trace input generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Fresh random input per trace
    Random,
    /// The same input for every trace
    Fixed,
    /// Alternate fixed (even traces) and random (odd traces) inputs
    Interleaved,
}

/// Capture policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Number of logical traces to capture
    pub n_traces: usize,
    /// Policy on arm failure
    pub arm_failure_policy: ArmFailurePolicy,
    /// Hardware segments per logical trace
    pub segment_count: usize,
    /// Trigger/capture repeats per segment, averaged in software
    pub repeat_count: usize,
    /// Segment combination
    pub segment_combine: SegmentCombine,
    /// Input generation mode
    pub inputs: InputMode,
    /// Hex input used by `fixed` and `interleaved`
    pub fixed_input: Option<String>,
    /// Hex key, `None` leaves the key register untouched
    pub key: Option<String>,
    /// RNG seed for reproducible inputs
    pub seed: Option<u64>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            n_traces: 2000,
            arm_failure_policy: ArmFailurePolicy::Skip,
            segment_count: 1,
            repeat_count: 1,
            segment_combine: SegmentCombine::Mean,
            inputs: InputMode::Random,
            fixed_input: None,
            key: Some("10A58869D74BE5A374CF867CFB473859".to_string()),
            seed: None,
        }
    }
}

/// Artifact output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for artifacts
    pub output_dir: PathBuf,
    /// Batch capacity
    pub traces_per_file: usize,
    /// Artifact file name prefix
    pub file_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            traces_per_file: 100_000,
            file_prefix: "traces".to_string(),
        }
    }
}

/// Reference sample the traces are aligned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceMode {
    /// Median of all per-trace event indices
    Median,
    /// A fixed sample index
    Fixed(usize),
}

/// Offline alignment parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Leading samples assumed quiescent; the first half feeds the threshold
    pub baseline_prefix: usize,
    /// Moving-average kernel for the activity signal
    pub smooth_kernel: usize,
    /// Threshold in standard deviations above the baseline activity
    pub threshold_sigma: f64,
    /// Samples added on both sides of the detected window
    pub margin: usize,
    /// Perform per-trace realignment
    pub align: bool,
    /// Reference index selection
    pub reference: ReferenceMode,
    /// Baseline sub-window `[start, end)` relative to the cropped window
    pub baseline_window: (usize, usize),
    /// Subtract a slow moving-average trend
    pub detrend: bool,
    /// Divide each trace by its standard deviation
    pub normalize: bool,
    /// Final smoothing kernel (1 disables)
    pub final_smooth_kernel: usize,
    /// Floor for the baseline activity deviation
    pub sigma_floor: f64,
    /// Standard deviation at or below which a processed trace counts as constant
    pub variance_epsilon: f64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            baseline_prefix: 150,
            smooth_kernel: 11,
            threshold_sigma: 3.0,
            margin: 50,
            align: true,
            reference: ReferenceMode::Median,
            baseline_window: (0, 20),
            detrend: true,
            normalize: true,
            final_smooth_kernel: 3,
            sigma_floor: 1e-9,
            variance_epsilon: 1e-8,
        }
    }
}

/// Convert a millisecond setting into a `Duration`.
pub(crate) fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

impl RunConfig {
    /// Load configuration from `config/trace_daq.toml` and environment variables
    ///
    /// Environment variables override file values with prefix `TRACE_DAQ_`.
    /// Example: `TRACE_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> DaqResult<Self> {
        Self::load_from("config/trace_daq.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        Ok(Figment::from(Serialized::defaults(RunConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TRACE_DAQ_").split("__"))
            .extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> DaqResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let acq = &self.acquisition;
        if acq.n_traces == 0 {
            return invalid("n_traces must be at least 1".into());
        }
        if acq.segment_count == 0 || acq.repeat_count == 0 {
            return invalid("segment_count and repeat_count must be at least 1".into());
        }
        if self.storage.traces_per_file == 0 {
            return invalid("traces_per_file must be at least 1".into());
        }

        let rec = &self.recorder;
        if rec.points_per_trace == 0 {
            return invalid("points_per_trace must be at least 1".into());
        }
        if rec.arm.accepted_states.is_empty() {
            return invalid("accepted_states must list at least one armed token".into());
        }
        if rec.arm.retries == 0 || rec.read.attempts == 0 {
            return invalid("arm retries and read attempts must be at least 1".into());
        }
        if let AcquireMode::Average { count } = rec.acquire_mode {
            if count == 0 {
                return invalid("hardware average count must be at least 1".into());
            }
        }

        let dev = &self.device;
        if dev.max_busy_polls == 0 {
            return invalid("max_busy_polls must be at least 1".into());
        }
        if dev.block_bytes == 0 {
            return invalid("block_bytes must be at least 1".into());
        }
        for (name, value) in [("fixed_input", &acq.fixed_input), ("key", &acq.key)] {
            if let Some(hex) = value {
                let bytes = parse_hex(hex)
                    .map_err(|e| DaqError::Configuration(format!("{name}: {e}")))?;
                if bytes.len() > dev.block_bytes {
                    return invalid(format!(
                        "{name} is {} bytes, device blocks are {} bytes",
                        bytes.len(),
                        dev.block_bytes
                    ));
                }
            }
        }
        if acq.inputs != InputMode::Random && acq.fixed_input.is_none() {
            return invalid("fixed and interleaved input modes require fixed_input".into());
        }

        let (a, b) = self.alignment.baseline_window;
        if a > b {
            return invalid(format!("baseline_window start {a} exceeds end {b}"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recorder.arm.retries, 3);
        assert_eq!(config.storage.traces_per_file, 100_000);
        assert_eq!(config.alignment.reference, ReferenceMode::Median);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = RunConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_counts_rejected() {
        let mut config = RunConfig::default();
        config.acquisition.segment_count = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.device.max_busy_polls = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.recorder.arm.accepted_states.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_key_wider_than_block_rejected() {
        let mut config = RunConfig::default();
        config.device.block_bytes = 4;
        assert!(config.validate().is_err());

        config.acquisition.key = Some("0102".to_string());
        assert!(config.validate().is_ok());

        config.acquisition.key = Some("zz".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fixed_mode_needs_input() {
        let mut config = RunConfig::default();
        config.acquisition.inputs = InputMode::Fixed;
        assert!(config.validate().is_err());
        config.acquisition.fixed_input = Some("00112233".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[acquisition]
n_traces = 42
arm_failure_policy = "abort"

[recorder]
acquire_mode = {{ type = "average", count = 16 }}

[alignment]
reference = {{ fixed = 120 }}
baseline_window = [5, 25]
"#
        )
        .unwrap();

        let config = RunConfig::load_from(file.path()).unwrap();
        assert_eq!(config.acquisition.n_traces, 42);
        assert_eq!(config.acquisition.arm_failure_policy, ArmFailurePolicy::Abort);
        assert_eq!(config.recorder.hardware_averages(), 16);
        assert_eq!(config.alignment.reference, ReferenceMode::Fixed(120));
        assert_eq!(config.alignment.baseline_window, (5, 25));
        // untouched sections keep their defaults
        assert_eq!(config.device.registers.go, 0x05);
    }
}
