//! Per-trace event location and realignment.

use super::dsp::finite_or_zero;
use super::window::AlignmentWindow;
use crate::config::ReferenceMode;

/// Sample index of the sharpest edge of `trace` inside `window`.
///
/// Candidates are samples `j` in `[start + 1, end)`, scored by `|x[j] - x[j - 1]|`;
/// the first maximum wins. A window too narrow to hold a difference yields its
/// start. The result always lies inside the window (clamped to the trace).
pub fn locate_event(trace: &[f32], window: AlignmentWindow) -> usize {
    let end = window.end.min(trace.len());
    let start = window.start.min(end);
    let fallback = start.min(trace.len().saturating_sub(1));
    if end <= start + 1 {
        return fallback;
    }

    let mut best = start + 1;
    let mut best_score = f64::NEG_INFINITY;
    for j in start + 1..end {
        let score = (finite_or_zero(trace[j]) - finite_or_zero(trace[j - 1])).abs();
        if score > best_score {
            best = j;
            best_score = score;
        }
    }
    best
}

/// Common reference index for a set of event indices.
///
/// The median rounds down for an even count. `None` when there are no events and
/// the reference is not fixed.
pub fn reference_index(events: &[usize], mode: ReferenceMode) -> Option<usize> {
    match mode {
        ReferenceMode::Fixed(index) => Some(index),
        ReferenceMode::Median => {
            if events.is_empty() {
                return None;
            }
            let mut sorted = events.to_vec();
            sorted.sort_unstable();
            let mid = sorted.len() / 2;
            Some(if sorted.len() % 2 == 0 {
                (sorted[mid - 1] + sorted[mid]) / 2
            } else {
                sorted[mid]
            })
        }
    }
}

/// Circularly shift each trace so that its event lands on `reference`.
pub fn align(traces: &[Vec<f32>], events: &[usize], reference: usize) -> Vec<Vec<f32>> {
    traces
        .iter()
        .zip(events)
        .map(|(trace, &event)| {
            let mut shifted = trace.clone();
            let n = shifted.len();
            if n > 0 {
                let shift = (reference % n + n - event % n) % n;
                shifted.rotate_right(shift);
            }
            shifted
        })
        .collect()
}
