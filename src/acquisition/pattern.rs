//! Per-trace input generation.
//!
//! Every logical trace is driven by one input block and an optional key block.
//! Inputs are random, fixed, or interleaved fixed-vs-random (even traces fixed,
//! odd traces random). An absent key leaves the device key register untouched and
//! is stored as an empty byte string.

use crate::config::{AcquisitionConfig, InputMode};
use crate::error::{DaqError, DaqResult};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Input and key for one logical trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceIo {
    /// Input block written to the device
    pub input: Vec<u8>,
    /// Key block, `None` when the key register is not written
    pub key: Option<Vec<u8>>,
}

/// Decode a hex string (whitespace and an optional `0x` prefix are ignored).
pub fn parse_hex(hex: &str) -> Result<Vec<u8>, String> {
    let cleaned: String = hex
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if !cleaned.is_ascii() {
        return Err(format!("non-hex characters in '{hex}'"));
    }
    if cleaned.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{hex}'"));
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&cleaned[i..i + 2], 16)
                .map_err(|_| format!("invalid hex digits '{}'", &cleaned[i..i + 2]))
        })
        .collect()
}

/// Left-pad `bytes` with zeros to `width`.
fn pad_to(mut bytes: Vec<u8>, width: usize) -> Vec<u8> {
    if bytes.len() < width {
        let mut padded = vec![0u8; width - bytes.len()];
        padded.append(&mut bytes);
        padded
    } else {
        bytes
    }
}

/// Produces the `TraceIo` of every logical trace of a run.
pub struct InputGenerator {
    mode: InputMode,
    fixed: Vec<u8>,
    key: Option<Vec<u8>>,
    block_bytes: usize,
    rng: StdRng,
}

impl InputGenerator {
    /// Build a generator from the acquisition settings and the device block width.
    pub fn new(cfg: &AcquisitionConfig, block_bytes: usize) -> DaqResult<Self> {
        let decode = |name: &str, hex: &str| {
            parse_hex(hex)
                .map(|b| pad_to(b, block_bytes))
                .map_err(|e| DaqError::Configuration(format!("{name}: {e}")))
        };

        let fixed = match &cfg.fixed_input {
            Some(hex) => decode("fixed_input", hex)?,
            None if cfg.inputs == InputMode::Random => vec![0u8; block_bytes],
            None => {
                return Err(DaqError::Configuration(
                    "fixed_input is required for fixed and interleaved inputs".into(),
                ))
            }
        };
        let key = cfg.key.as_deref().map(|hex| decode("key", hex)).transpose()?;
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            mode: cfg.inputs,
            fixed,
            key,
            block_bytes,
            rng,
        })
    }

    /// Input and key for logical trace `index`.
    pub fn next_io(&mut self, index: usize) -> TraceIo {
        let use_fixed = match self.mode {
            InputMode::Fixed => true,
            InputMode::Random => false,
            InputMode::Interleaved => index % 2 == 0,
        };
        let input = if use_fixed {
            self.fixed.clone()
        } else {
            let mut block = vec![0u8; self.block_bytes];
            self.rng.fill_bytes(&mut block);
            block
        };
        TraceIo {
            input,
            key: self.key.clone(),
        }
    }
}
