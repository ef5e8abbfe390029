//! Offline alignment of captured traces.
//!
//! The pipeline is a chain of pure functions over a `TraceSet`:
//!
//! 1. `detect_window` finds where the monitored computation is active
//! 2. `locate_event` and `reference_index` pick a common event sample
//! 3. `align` rotates each trace onto it and the window is re-centered
//! 4. `normalize` crops and scales every trace
//! 5. `filter` drops traces that came out non-finite or flat
//!
//! `AlignmentEngine::process` runs the whole chain and returns an `AlignedDataset`.

pub mod dsp;
pub mod engine;
pub mod event;
pub mod filter;
pub mod normalize;
pub mod window;

pub use engine::{AlignedDataset, AlignmentEngine};
pub use event::{align, locate_event, reference_index};
pub use filter::{filter, is_usable};
pub use normalize::{normalize, normalize_trace};
pub use window::{activity_signal, detect_window, AlignmentWindow};
