//! Active-window detection.
//!
//! The activity signal is the mean absolute first difference across all traces,
//! smoothed with a short moving average. Difference `j` (between samples `j` and
//! `j + 1`) is attributed to sample `j + 1`, the first sample that shows the change.
//! The first half of the baseline prefix is taken as quiescent; samples whose
//! smoothed activity exceeds `mean + k * std` of that prefix are active.

use super::dsp::{abs_diff, mean, moving_average, std_dev};
use crate::config::AlignmentConfig;
use serde::{Deserialize, Serialize};

/// Half-open sample interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentWindow {
    /// First sample in the window
    pub start: usize,
    /// One past the last sample in the window
    pub end: usize,
}

impl AlignmentWindow {
    /// Window covering a whole trace of `len` samples.
    pub fn full(len: usize) -> Self {
        Self { start: 0, end: len }
    }

    /// Number of samples in the window.
    pub fn width(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Whether `index` lies inside the window.
    pub fn contains(&self, index: usize) -> bool {
        (self.start..self.end).contains(&index)
    }

    /// Re-center a window of the same width on `reference`, clamped to `len`.
    ///
    /// If clamping at the end would shorten the window it is shifted left instead.
    pub fn recenter(&self, reference: usize, len: usize) -> Self {
        let width = self.width();
        let mut start = reference.saturating_sub(width / 2);
        let end = (start + width).min(len);
        if end - start.min(end) < width && start > 0 {
            start = end.saturating_sub(width);
        }
        Self {
            start: start.min(end),
            end,
        }
    }
}

/// Mean absolute first difference across traces, smoothed with `kernel`.
pub fn activity_signal(traces: &[Vec<f32>], kernel: usize) -> Vec<f64> {
    let len = traces.first().map_or(0, Vec::len);
    let mut sum = vec![0.0; len.saturating_sub(1)];
    for trace in traces {
        for (acc, d) in sum.iter_mut().zip(abs_diff(trace)) {
            *acc += d;
        }
    }
    let n = traces.len().max(1) as f64;
    let averaged: Vec<f64> = sum.into_iter().map(|v| v / n).collect();
    moving_average(&averaged, kernel)
}

/// Detect the window in which the monitored computation is active.
///
/// Returns the full trace when no sample exceeds the threshold (or when the
/// traces are too short to have an activity signal).
pub fn detect_window(traces: &[Vec<f32>], cfg: &AlignmentConfig) -> AlignmentWindow {
    let len = traces.first().map_or(0, Vec::len);
    let activity = activity_signal(traces, cfg.smooth_kernel);
    if activity.is_empty() {
        return AlignmentWindow::full(len);
    }

    let prefix_end = (cfg.baseline_prefix / 2).max(1).min(activity.len());
    let baseline = &activity[..prefix_end];
    let mu = mean(baseline);
    let sigma = std_dev(baseline).max(cfg.sigma_floor);
    let threshold = mu + cfg.threshold_sigma * sigma;

    let mut active = activity
        .iter()
        .enumerate()
        .filter(|(_, a)| **a > threshold)
        .map(|(j, _)| j);
    let Some(first) = active.next() else {
        tracing::debug!(threshold, "No activity above threshold, using full trace");
        return AlignmentWindow::full(len);
    };
    let last = active.last().unwrap_or(first);

    // difference j belongs to sample j + 1
    let window = AlignmentWindow {
        start: (first + 1).saturating_sub(cfg.margin),
        end: (last + 2 + cfg.margin).min(len),
    };
    tracing::debug!(
        start = window.start,
        end = window.end,
        threshold,
        "Active window detected"
    );
    window
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(prefix: usize, kernel: usize, margin: usize) -> AlignmentConfig {
        AlignmentConfig {
            baseline_prefix: prefix,
            smooth_kernel: kernel,
            margin,
            ..Default::default()
        }
    }

    fn step(len: usize, at: usize) -> Vec<f32> {
        (0..len).map(|i| if i >= at { 1.0 } else { 0.0 }).collect()
    }

    #[test]
    fn step_at_four_with_unit_margin() {
        let traces = vec![step(8, 4); 3];
        let window = detect_window(&traces, &cfg(6, 1, 1));
        assert_eq!(window, AlignmentWindow { start: 3, end: 6 });
    }

    #[test]
    fn window_contains_step_plus_margin() {
        let traces: Vec<Vec<f32>> = (0..4).map(|_| step(200, 120)).collect();
        let window = detect_window(&traces, &cfg(100, 5, 10));
        assert!(window.start <= 120 - 10);
        assert!(window.end >= 121 + 10);
        assert!(window.end <= 200);
    }

    #[test]
    fn flat_traces_give_full_window() {
        let traces = vec![vec![0.5f32; 50]; 3];
        assert_eq!(detect_window(&traces, &cfg(20, 3, 5)), AlignmentWindow::full(50));
    }

    #[test]
    fn margin_is_clamped_to_bounds() {
        let traces = vec![step(10, 1); 2];
        let c = cfg(1, 1, 100);
        let window = detect_window(&traces, &c);
        // the only activity is the baseline itself, nothing exceeds its own mean
        assert_eq!(window, AlignmentWindow::full(10));

        let traces = vec![step(10, 8); 2];
        let window = detect_window(&traces, &c);
        assert_eq!(window, AlignmentWindow { start: 0, end: 10 });
    }

    #[test]
    fn short_traces_fall_back_to_full() {
        assert_eq!(detect_window(&[vec![1.0]], &cfg(6, 1, 1)), AlignmentWindow::full(1));
        assert_eq!(detect_window(&[], &cfg(6, 1, 1)), AlignmentWindow::full(0));
    }

    #[test]
    fn recenter_keeps_width_and_shifts_left_at_the_end() {
        let w = AlignmentWindow { start: 10, end: 30 };
        assert_eq!(w.recenter(50, 100), AlignmentWindow { start: 40, end: 60 });
        assert_eq!(w.recenter(5, 100), AlignmentWindow { start: 0, end: 20 });
        assert_eq!(w.recenter(95, 100), AlignmentWindow { start: 80, end: 100 });
    }

    #[test]
    fn recenter_on_short_trace_clamps() {
        let w = AlignmentWindow { start: 0, end: 20 };
        let r = w.recenter(5, 10);
        assert_eq!(r, AlignmentWindow { start: 0, end: 10 });
    }
}
