//! Capture side of the pipeline.
//!
//! `InstrumentController` and `ComputationDriver` wrap the two hardware handles with
//! bounded retry and polling protocols; `AcquisitionOrchestrator` runs the per-trace
//! state machine on top of them and hands finished traces to the `TraceStore`.

pub mod controller;
pub mod driver;
pub mod orchestrator;
pub mod pattern;

pub use controller::{InstrumentController, SegmentRead};
pub use driver::ComputationDriver;
pub use orchestrator::{AcquisitionOrchestrator, OutputCheck, RunOutcome, RunSummary};
pub use pattern::{InputGenerator, TraceIo};
