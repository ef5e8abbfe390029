//! Crop, baseline removal, detrending, scaling and final smoothing.

use super::dsp::{mean, moving_average, std_dev};
use super::window::AlignmentWindow;
use crate::config::AlignmentConfig;

/// Fraction of the window length used as the detrending kernel.
const DETREND_FRACTION: f64 = 0.05;
/// Smallest detrending kernel.
const MIN_DETREND_KERNEL: usize = 3;

/// Detrending kernel width for a window of `len` samples.
pub fn detrend_kernel(len: usize) -> usize {
    ((len as f64 * DETREND_FRACTION) as usize).max(MIN_DETREND_KERNEL)
}

/// Process one trace: crop to `window`, subtract the baseline mean, then
/// optionally detrend, scale to unit deviation, and smooth.
///
/// The baseline is the mean over `baseline` (relative to the cropped window);
/// when that sub-window is empty after clamping the full-window mean is used.
/// A zero deviation scales by 1.0, so constant traces stay constant instead of
/// dividing by zero.
pub fn normalize_trace(
    trace: &[f32],
    window: AlignmentWindow,
    baseline: (usize, usize),
    cfg: &AlignmentConfig,
) -> Vec<f32> {
    let end = window.end.min(trace.len());
    let start = window.start.min(end);
    let mut x: Vec<f64> = trace[start..end].iter().map(|&v| f64::from(v)).collect();

    let b_end = baseline.1.min(x.len());
    let b_start = baseline.0;
    let offset = if b_end > b_start {
        mean(&x[b_start..b_end])
    } else {
        mean(&x)
    };
    x.iter_mut().for_each(|v| *v -= offset);

    if cfg.detrend {
        let slow = moving_average(&x, detrend_kernel(x.len()));
        x.iter_mut().zip(slow).for_each(|(v, s)| *v -= s);
    }

    if cfg.normalize {
        let sd = std_dev(&x);
        let scale = if sd == 0.0 { 1.0 } else { sd };
        x.iter_mut().for_each(|v| *v /= scale);
    }

    if cfg.final_smooth_kernel > 1 {
        x = moving_average(&x, cfg.final_smooth_kernel);
    }

    x.into_iter().map(|v| v as f32).collect()
}

/// Apply `normalize_trace` to every trace.
pub fn normalize(
    traces: &[Vec<f32>],
    window: AlignmentWindow,
    baseline: (usize, usize),
    cfg: &AlignmentConfig,
) -> Vec<Vec<f32>> {
    traces
        .iter()
        .map(|t| normalize_trace(t, window, baseline, cfg))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> AlignmentConfig {
        AlignmentConfig {
            detrend: false,
            normalize: true,
            final_smooth_kernel: 1,
            ..Default::default()
        }
    }

    fn mean32(x: &[f32]) -> f64 {
        x.iter().map(|&v| f64::from(v)).sum::<f64>() / x.len() as f64
    }

    fn std32(x: &[f32]) -> f64 {
        let m = mean32(x);
        (x.iter().map(|&v| (f64::from(v) - m).powi(2)).sum::<f64>() / x.len() as f64).sqrt()
    }

    #[test]
    fn kernel_width_is_five_percent_with_floor() {
        assert_eq!(detrend_kernel(10), 3);
        assert_eq!(detrend_kernel(200), 10);
        assert_eq!(detrend_kernel(1000), 50);
    }

    #[test]
    fn crop_and_unit_deviation() {
        let trace: Vec<f32> = (0..40).map(|i| (i as f32 * 0.7).sin() + 5.0).collect();
        let out = normalize_trace(&trace, AlignmentWindow { start: 5, end: 35 }, (0, 30), &plain());
        assert_eq!(out.len(), 30);
        assert!(mean32(&out).abs() < 1e-5);
        assert!((std32(&out) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn baseline_subwindow_mean_is_removed() {
        let mut trace = vec![2.0f32; 10];
        trace.extend(vec![6.0f32; 10]);
        let cfg = AlignmentConfig {
            normalize: false,
            ..plain()
        };
        let out = normalize_trace(&trace, AlignmentWindow::full(20), (0, 10), &cfg);
        assert!(mean32(&out[..10]).abs() < 1e-6);
        assert!((out[15] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn degenerate_baseline_uses_full_window() {
        let trace = vec![1.0f32, 3.0, 1.0, 3.0];
        let cfg = AlignmentConfig {
            normalize: false,
            ..plain()
        };
        let out = normalize_trace(&trace, AlignmentWindow::full(4), (10, 20), &cfg);
        assert_eq!(out, vec![-1.0, 1.0, -1.0, 1.0]);
    }

    #[test]
    fn constant_trace_does_not_divide_by_zero() {
        let trace = vec![3.0f32; 16];
        let out = normalize_trace(&trace, AlignmentWindow::full(16), (0, 4), &AlignmentConfig::default());
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn detrend_removes_slow_ramp() {
        let trace: Vec<f32> = (0..260).map(|i| i as f32 * 0.01).collect();
        let cfg = AlignmentConfig {
            detrend: true,
            normalize: false,
            final_smooth_kernel: 1,
            ..Default::default()
        };
        let out = normalize_trace(&trace, AlignmentWindow::full(260), (0, 20), &cfg);
        // interior samples of a linear ramp cancel against their centered average
        assert_eq!(detrend_kernel(260), 13);
        assert!(out[20..240].iter().all(|v| v.abs() < 1e-4));
    }
}
