//! Precision-recall sweep over scored binary labels.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrPoint {
    pub threshold: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl PrPoint {
    fn zero() -> Self {
        Self {
            threshold: 0.0,
            precision: 0.0,
            recall: 0.0,
            f1: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrCurveData {
    pub label: String,
    /// One point per threshold, in ascending threshold order.
    pub points: Vec<PrPoint>,
    pub auc: f64,
    /// Point with the highest F1 (first one on ties).
    pub optimal: PrPoint,
}

#[derive(Debug, Clone)]
pub struct PrCurveCalculator {
    num_thresholds: usize,
}

impl Default for PrCurveCalculator {
    fn default() -> Self {
        Self { num_thresholds: 100 }
    }
}

impl PrCurveCalculator {
    pub fn new(num_thresholds: usize) -> Self {
        Self {
            num_thresholds: num_thresholds.max(1),
        }
    }

    /// Sweep thresholds linearly between the min and max score; a sample is
    /// predicted positive when `score >= threshold`.
    pub fn calculate(&self, label: &str, scores: &[f64], labels: &[bool]) -> PrCurveData {
        if scores.is_empty() || scores.len() != labels.len() {
            if scores.len() != labels.len() {
                warn!(
                    scores = scores.len(),
                    labels = labels.len(),
                    "PR input length mismatch"
                );
            }
            return PrCurveData {
                label: label.to_string(),
                points: vec![PrPoint::zero()],
                auc: 0.0,
                optimal: PrPoint::zero(),
            };
        }

        let lo = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let steps = self.num_thresholds;

        let points: Vec<PrPoint> = (0..steps)
            .map(|i| {
                let threshold = if steps == 1 {
                    lo
                } else {
                    lo + (hi - lo) * i as f64 / (steps - 1) as f64
                };
                evaluate(threshold, scores, labels)
            })
            .collect();

        let mut optimal = points[0];
        for p in &points[1..] {
            if p.f1 > optimal.f1 {
                optimal = *p;
            }
        }

        PrCurveData {
            label: label.to_string(),
            auc: area_under_curve(&points),
            points,
            optimal,
        }
    }
}

fn evaluate(threshold: f64, scores: &[f64], labels: &[bool]) -> PrPoint {
    let (mut tp, mut fp, mut fn_) = (0usize, 0usize, 0usize);
    for (&s, &positive) in scores.iter().zip(labels) {
        match (s >= threshold, positive) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => {}
        }
    }
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };
    PrPoint {
        threshold,
        precision,
        recall,
        f1,
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

/// Trapezoidal area of precision over recall, extended flat to recall 0.
/// Zero-recall points have no true positives and are left out.
fn area_under_curve(points: &[PrPoint]) -> f64 {
    let mut curve: Vec<(f64, f64)> = points
        .iter()
        .filter(|p| p.recall > 0.0)
        .map(|p| (p.recall, p.precision))
        .collect();
    curve.sort_by(|a, b| a.0.total_cmp(&b.0).then(b.1.total_cmp(&a.1)));

    let Some(&(r0, p0)) = curve.first() else {
        return 0.0;
    };
    let mut area = r0 * p0;
    for w in curve.windows(2) {
        let (r_a, p_a) = w[0];
        let (r_b, p_b) = w[1];
        area += (r_b - r_a) * (p_a + p_b) / 2.0;
    }
    area.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_perfect_separation() {
        let scores = [0.9, 0.8, 0.95, 0.1, 0.2, 0.05];
        let labels = [true, true, true, false, false, false];
        let curve = PrCurveCalculator::default().calculate("loop", &scores, &labels);
        assert_eq!(curve.points.len(), 100);
        assert_relative_eq!(curve.auc, 1.0, epsilon = 1e-9);
        assert_relative_eq!(curve.optimal.f1, 1.0, epsilon = 1e-9);
        assert!(curve.optimal.threshold > 0.2 && curve.optimal.threshold <= 0.8);
    }

    #[test]
    fn test_two_samples_all_recall_one() {
        // Any threshold up to 0.9 keeps the positive, so the curve is a
        // recall-1 column and the area comes from the flat extension.
        let curve = PrCurveCalculator::default().calculate("pair", &[0.1, 0.9], &[false, true]);
        assert!(curve.points.iter().all(|p| p.recall == 1.0 || p.recall == 0.0));
        assert_relative_eq!(curve.auc, 1.0, epsilon = 1e-9);
        assert_relative_eq!(curve.optimal.f1, 1.0, epsilon = 1e-9);
        assert_relative_eq!(curve.points[0].precision, 0.5);
    }

    #[test]
    fn test_empty_and_mismatched_input() {
        let calc = PrCurveCalculator::default();
        for curve in [
            calc.calculate("a", &[], &[]),
            calc.calculate("b", &[0.5, 0.2], &[true]),
        ] {
            assert_eq!(curve.points, vec![PrPoint::zero()]);
            assert_eq!(curve.auc, 0.0);
            assert_eq!(curve.optimal.f1, 0.0);
        }
    }

    #[test]
    fn test_lowest_threshold_predicts_everything() {
        let scores = [0.1, 0.4, 0.6, 0.9];
        let labels = [false, true, false, true];
        let curve = PrCurveCalculator::new(10).calculate("x", &scores, &labels);
        let first = curve.points[0];
        assert_relative_eq!(first.threshold, 0.1);
        assert_relative_eq!(first.recall, 1.0);
        assert_relative_eq!(first.precision, 0.5);
        assert!(curve.auc > 0.0 && curve.auc <= 1.0);
    }

    #[test]
    fn test_no_positives() {
        let curve = PrCurveCalculator::new(5).calculate("neg", &[0.1, 0.2], &[false, false]);
        assert!(curve.points.iter().all(|p| p.recall == 0.0 && p.f1 == 0.0));
        assert_eq!(curve.auc, 0.0);
    }
}
