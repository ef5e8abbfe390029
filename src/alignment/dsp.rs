//! Small signal-processing helpers shared by the alignment stages.

/// Centered moving average with zero padding, same length as the input.
///
/// Output sample `i` is the sum of `x[i + off + 1 - k ..= i + off]` divided by `k`,
/// with `off = (k - 1) / 2` and out-of-range samples counting as zero. Even kernels
/// lean one sample towards the past. `k <= 1` returns the input unchanged.
pub fn moving_average(x: &[f64], k: usize) -> Vec<f64> {
    if k <= 1 || x.is_empty() {
        return x.to_vec();
    }
    let n = x.len();
    let off = (k - 1) / 2;

    // prefix[i] = sum of x[..i]
    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0.0);
    for &v in x {
        prefix.push(prefix[prefix.len() - 1] + v);
    }

    (0..n)
        .map(|i| {
            let hi = (i + off + 1).min(n);
            let lo = (i + off + 1).saturating_sub(k).min(hi);
            (prefix[hi] - prefix[lo]) / k as f64
        })
        .collect()
}

/// Absolute first difference, non-finite samples read as zero.
///
/// `d[j] = |x[j + 1] - x[j]|`, so the output is one sample shorter than the input.
pub fn abs_diff(x: &[f32]) -> Vec<f64> {
    x.windows(2)
        .map(|w| (finite_or_zero(w[1]) - finite_or_zero(w[0])).abs())
        .collect()
}

/// `v` as f64, or zero when `v` is NaN or infinite.
pub fn finite_or_zero(v: f32) -> f64 {
    if v.is_finite() {
        f64::from(v)
    } else {
        0.0
    }
}

/// Arithmetic mean, zero for an empty slice.
pub fn mean(x: &[f64]) -> f64 {
    if x.is_empty() {
        0.0
    } else {
        x.iter().sum::<f64>() / x.len() as f64
    }
}

/// Population standard deviation, zero for an empty slice.
pub fn std_dev(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let m = mean(x);
    (x.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / x.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-12)
    }

    #[test]
    fn odd_kernel_is_centered() {
        let x = [0.0, 3.0, 0.0, 0.0, 6.0];
        let y = moving_average(&x, 3);
        assert!(close(&y, &[1.0, 1.0, 1.0, 2.0, 2.0]));
    }

    #[test]
    fn even_kernel_leans_to_the_past() {
        let x = [4.0, 0.0, 0.0, 8.0];
        let y = moving_average(&x, 2);
        // out[i] = (x[i-1] + x[i]) / 2
        assert!(close(&y, &[2.0, 2.0, 0.0, 4.0]));
    }

    #[test]
    fn kernel_longer_than_signal_keeps_length() {
        let y = moving_average(&[3.0, 3.0], 5);
        assert_eq!(y.len(), 2);
        assert!(close(&y, &[1.2, 1.2]));
    }

    #[test]
    fn unit_kernel_is_identity() {
        let x = [1.0, -2.0, 5.0];
        assert_eq!(moving_average(&x, 1), x.to_vec());
    }

    #[test]
    fn abs_diff_ignores_non_finite() {
        let d = abs_diff(&[1.0, f32::NAN, 3.0, f32::INFINITY]);
        assert!(close(&d, &[1.0, 3.0, 3.0]));
    }

    #[test]
    fn population_statistics() {
        let x = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&x) - 5.0).abs() < 1e-12);
        assert!((std_dev(&x) - 2.0).abs() < 1e-12);
        assert_eq!(std_dev(&[]), 0.0);
    }
}
