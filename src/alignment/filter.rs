//! Removal of unusable traces after processing.

use super::dsp::std_dev;
use crate::storage::TraceSet;

/// A processed trace is kept only if every sample is finite and its standard
/// deviation exceeds `epsilon`.
pub fn is_usable(trace: &[f32], epsilon: f64) -> bool {
    if trace.iter().any(|v| !v.is_finite()) {
        return false;
    }
    let x: Vec<f64> = trace.iter().map(|&v| f64::from(v)).collect();
    std_dev(&x) > epsilon
}

/// Drop unusable traces from `set`, removing the same rows from every metadata
/// array. Relative order of the remaining rows is preserved. Returns the number of
/// traces dropped.
pub fn filter(set: &mut TraceSet, epsilon: f64) -> usize {
    let keep: Vec<bool> = set.waves.iter().map(|w| is_usable(w, epsilon)).collect();
    let dropped = keep.iter().filter(|k| !**k).count();
    if dropped == 0 {
        return 0;
    }

    fn retain<T>(column: &mut Vec<T>, keep: &[bool]) {
        let mut row = 0;
        column.retain(|_| {
            let kept = keep.get(row).copied().unwrap_or(false);
            row += 1;
            kept
        });
    }

    retain(&mut set.waves, &keep);
    retain(&mut set.inputs, &keep);
    retain(&mut set.keys, &keep);
    retain(&mut set.outputs, &keep);
    retain(&mut set.activity_counts, &keep);
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RawTrace;

    fn set_of(waves: Vec<Vec<f32>>) -> TraceSet {
        let mut set = TraceSet::default();
        for (i, wave) in waves.into_iter().enumerate() {
            set.push(RawTrace {
                wave,
                input: vec![i as u8],
                key: vec![0xaa],
                output: vec![i as u8 + 100],
                activity_count: Some(i as u64),
            })
            .unwrap();
        }
        set
    }

    #[test]
    fn drops_nan_and_constant_rows_with_metadata() {
        let mut set = set_of(vec![
            vec![0.0, 1.0, -1.0],
            vec![f32::NAN, 1.0, 0.0],
            vec![2.0, 2.0, 2.0],
            vec![1.0, -1.0, 0.5],
            vec![0.0, f32::INFINITY, 0.0],
        ]);

        assert_eq!(filter(&mut set, 1e-8), 3);
        assert_eq!(set.len(), 2);
        assert!(set.is_consistent());
        assert_eq!(set.inputs, vec![vec![0], vec![3]]);
        assert_eq!(set.outputs, vec![vec![100], vec![103]]);
        assert_eq!(set.activity_counts, vec![Some(0), Some(3)]);
    }

    #[test]
    fn clean_set_is_untouched() {
        let mut set = set_of(vec![vec![0.0, 1.0], vec![1.0, 0.0]]);
        let before = set.clone();
        assert_eq!(filter(&mut set, 1e-8), 0);
        assert_eq!(set, before);
    }

    #[test]
    fn near_constant_counts_as_constant() {
        assert!(!is_usable(&[1.0, 1.0 + 1e-9, 1.0], 1e-8));
        assert!(is_usable(&[1.0, 1.1, 1.0], 1e-8));
    }
}
