//! Summary statistics over pixel samples.

use serde::{Deserialize, Serialize};

/// Mean, median and population standard deviation of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation (divides by `count`, not `count - 1`)
    pub std_dev: f64,
    pub count: usize,
}

impl SampleStats {
    /// Compute statistics from a sample, ignoring non-finite values.
    ///
    /// Returns `None` when no finite values remain.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let mut values: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
        if values.is_empty() {
            return None;
        }

        let (mean, std_dev) = mean_and_std(&values)?;
        let median = median_in_place(&mut values);

        Some(Self {
            mean,
            median,
            std_dev,
            count: values.len(),
        })
    }
}

/// Two-pass mean and population standard deviation.
///
/// Returns `None` for an empty slice.
pub fn mean_and_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

/// Median of a non-empty slice. Reorders the slice.
fn median_in_place(values: &mut [f64]) -> f64 {
    let mid = values.len() / 2;
    let (_, upper, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = *upper;
    if values.len() % 2 == 1 {
        return upper;
    }
    // Even count: average with the largest value of the lower half
    let lower = values[..mid]
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    0.5 * (lower + upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_odd_sample() {
        let stats = SampleStats::from_samples(&[3.0, 1.0, 2.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.0);
        assert_relative_eq!(stats.median, 2.0);
        assert_relative_eq!(stats.std_dev, (2.0f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_eq!(stats.count, 3);
    }

    #[test]
    fn test_even_sample_median_averages_middle_pair() {
        let stats = SampleStats::from_samples(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.mean, 2.5);
    }

    #[test]
    fn test_constant_sample_has_zero_spread() {
        let (mean, std) = mean_and_std(&[7.5; 10]).unwrap();
        assert_relative_eq!(mean, 7.5);
        assert_eq!(std, 0.0);
    }

    #[test]
    fn test_non_finite_values_are_ignored() {
        let stats = SampleStats::from_samples(&[1.0, f64::NAN, 3.0, f64::INFINITY]).unwrap();
        assert_eq!(stats.count, 2);
        assert_relative_eq!(stats.mean, 2.0);
    }

    #[test]
    fn test_empty_sample() {
        assert!(SampleStats::from_samples(&[]).is_none());
        assert!(SampleStats::from_samples(&[f64::NAN]).is_none());
        assert!(mean_and_std(&[]).is_none());
    }
}
