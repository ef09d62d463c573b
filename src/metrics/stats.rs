//! Running statistics (Welford) and error summaries.

use crate::model::ErrorStats;

/// Single-pass mean / population variance / extrema.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningStats {
    count: usize,
    mean: f64,
    m2: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningStats {
    pub fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.sum_sq += value * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.mean }
    }

    /// Population variance (divides by n).
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn std(&self) -> f64 {
        self.variance().max(0.0).sqrt()
    }

    pub fn rmse(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum_sq / self.count as f64).sqrt()
        }
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.min }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.max }
    }
}

/// Median of a slice; 0.0 when empty. NaNs sort last.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Full error summary; all zeros for an empty slice.
pub fn error_stats(values: &[f64]) -> ErrorStats {
    let mut stats = RunningStats::new();
    for &v in values {
        stats.push(v);
    }
    ErrorStats {
        rmse: stats.rmse(),
        mean: stats.mean(),
        median: median(values),
        std: stats.std(),
        min: stats.min(),
        max: stats.max(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_population_std() {
        let mut stats = RunningStats::new();
        for v in [80.0, 120.0, 100.0] {
            stats.push(v);
        }
        assert_relative_eq!(stats.mean(), 100.0);
        assert_relative_eq!(stats.min(), 80.0);
        assert_relative_eq!(stats.max(), 120.0);
        assert_relative_eq!(stats.std(), 16.3299, epsilon = 1e-3);
    }

    #[test]
    fn test_empty_is_zero() {
        let stats = RunningStats::new();
        assert_eq!(stats.mean(), 0.0);
        assert_eq!(stats.std(), 0.0);
        assert_eq!(stats.min(), 0.0);
        assert_eq!(stats.max(), 0.0);
        assert_eq!(error_stats(&[]), ErrorStats::default());
    }

    #[test]
    fn test_error_stats() {
        let s = error_stats(&[3.0, 4.0, 1.0, 2.0]);
        assert_relative_eq!(s.mean, 2.5);
        assert_relative_eq!(s.median, 2.5);
        assert_relative_eq!(s.rmse, (30.0f64 / 4.0).sqrt());
        assert_relative_eq!(s.min, 1.0);
        assert_relative_eq!(s.max, 4.0);
    }
}
