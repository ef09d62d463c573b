//! Metrics rebuilt from persisted frame results.

use anyhow::Result;
use tracing::{debug, info};

use crate::metrics::{MetricsCalculator, PrCurveCalculator, PrCurveData, TrajectoryEvaluator};
use crate::model::{AlgorithmMetrics, AlgorithmRun, FrameResult};
use crate::storage::ResultStore;

pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Pages of frame results, fetched lazily in storage order.
struct FramePages<'a> {
    store: &'a dyn ResultStore,
    experiment_id: &'a str,
    storage_key: String,
    page_size: usize,
    offset: usize,
    total: Option<usize>,
}

impl<'a> FramePages<'a> {
    fn new(store: &'a dyn ResultStore, run: &'a AlgorithmRun, page_size: usize) -> Self {
        Self {
            store,
            experiment_id: &run.experiment_id,
            storage_key: run.storage_key(),
            page_size: page_size.max(1),
            offset: 0,
            total: None,
        }
    }
}

impl Iterator for FramePages<'_> {
    type Item = Result<Vec<FrameResult>>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.total, Some(total) if self.offset >= total) {
            return None;
        }
        let page = self.store.get_frame_results(
            self.experiment_id,
            &self.storage_key,
            self.offset,
            self.page_size,
        );
        match page {
            Ok((frames, total)) => {
                self.total = Some(total);
                if frames.is_empty() {
                    return None;
                }
                self.offset += frames.len();
                Some(Ok(frames))
            }
            Err(e) => {
                // Stop after reporting the error.
                self.total = Some(0);
                Some(Err(e))
            }
        }
    }
}

/// Recompute one run's metrics and overwrite the stored value.
///
/// Frames are folded in storage order and scored with the trajectory
/// settings recorded in the stored metrics, so the result equals the metrics
/// produced while the run was live. `calculator` only supplies the settings
/// for a run that has no stored metrics yet.
pub fn recompute_run(
    store: &dyn ResultStore,
    calculator: &MetricsCalculator,
    run: &AlgorithmRun,
    page_size: usize,
) -> Result<AlgorithmMetrics> {
    let evaluator = match store.get_algorithm_result(&run.experiment_id, &run.storage_key())? {
        Some(previous) => TrajectoryEvaluator::new(previous.trajectory_config),
        None => calculator.evaluator().clone(),
    };

    let mut acc = calculator.accumulator(run.clone());
    for page in FramePages::new(store, run, page_size) {
        for frame in &page? {
            acc.push(frame);
        }
        debug!(run = %run, seen = acc.frames_seen(), "Recompute page folded");
    }
    let metrics = acc.finish(&evaluator);
    store.save_algorithm_result(&metrics)?;
    info!(run = %run, frames = metrics.total_frames, "Metrics recomputed");
    Ok(metrics)
}

/// How well estimator confidence predicts frame success over one run's
/// stored frames. Frames without an estimator result are skipped.
pub fn confidence_curve(
    store: &dyn ResultStore,
    curves: &PrCurveCalculator,
    run: &AlgorithmRun,
    page_size: usize,
) -> Result<PrCurveData> {
    let mut scores = Vec::new();
    let mut labels = Vec::new();
    for page in FramePages::new(store, run, page_size) {
        for frame in page? {
            if let Some(estimate) = &frame.estimator_result {
                scores.push(estimate.confidence);
                labels.push(frame.is_success());
            }
        }
    }
    Ok(curves.calculate(&run.algorithm_key(), &scores, &labels))
}

/// Recompute every run stored for an experiment.
pub fn recompute_experiment(
    store: &dyn ResultStore,
    calculator: &MetricsCalculator,
    experiment_id: &str,
    page_size: usize,
) -> Result<Vec<AlgorithmMetrics>> {
    store
        .list_runs(experiment_id)?
        .iter()
        .map(|run| recompute_run(store, calculator, run, page_size))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::pose;
    use crate::metrics::TrajectoryConfig;
    use crate::model::FrameStatus;
    use crate::storage::MemoryStore;
    use crate::storage::test_support::{frames, run};
    use nalgebra::{Matrix3, Vector3};

    /// Estimated positions at half the ground-truth scale.
    fn half_scale_frames(n: usize) -> Vec<FrameResult> {
        frames(n)
            .into_iter()
            .map(|f| {
                let theta = f.frame_id as f64 * 0.2;
                let centre = Vector3::new(theta.cos(), theta.sin(), 0.05 * theta);
                let gt = pose::from_rt(&Matrix3::identity(), &centre);
                let est = pose::from_rt(&Matrix3::identity(), &(centre * 0.5));
                f.with_poses(Some(est), Some(gt))
            })
            .collect()
    }

    #[test]
    fn test_recompute_matches_batch_for_any_page_size() {
        let store = MemoryStore::new();
        let calc = MetricsCalculator::default();
        let r = run(0);
        let stored = frames(23);
        store.save_run(&r).unwrap();
        store.append_frame_results(&r, &stored).unwrap();

        let expected = calc.calculate_algorithm_metrics(r.clone(), &stored);
        for page_size in [1, 5, 23, 100] {
            assert_eq!(recompute_run(&store, &calc, &r, page_size).unwrap(), expected);
        }
        assert_eq!(
            store.get_algorithm_result("exp-1", &r.storage_key()).unwrap(),
            Some(expected)
        );
    }

    #[test]
    fn test_recompute_experiment_covers_all_runs() {
        let store = MemoryStore::new();
        let calc = MetricsCalculator::default();
        for idx in 0..3 {
            let r = run(idx);
            store.save_run(&r).unwrap();
            store.append_frame_results(&r, &frames(4 + idx)).unwrap();
        }
        let all = recompute_experiment(&store, &calc, "exp-1", 2).unwrap();
        let totals: Vec<usize> = all.iter().map(|m| m.total_frames).collect();
        assert_eq!(totals, vec![4, 5, 6]);
    }

    #[test]
    fn test_recompute_empty_run() {
        let store = MemoryStore::new();
        let calc = MetricsCalculator::default();
        let r = run(0);
        store.save_run(&r).unwrap();
        let metrics = recompute_run(&store, &calc, &r, 10).unwrap();
        assert_eq!(metrics, AlgorithmMetrics::empty(r));
    }

    #[test]
    fn test_recompute_reuses_stored_trajectory_settings() {
        let store = MemoryStore::new();
        let live_calc = MetricsCalculator::new(TrajectoryEvaluator::new(TrajectoryConfig {
            with_scale: true,
            rpe_delta: 2,
            ..Default::default()
        }));
        let r = run(0);
        let stored = half_scale_frames(20);
        store.save_run(&r).unwrap();
        store.append_frame_results(&r, &stored).unwrap();
        let live = live_calc.calculate_algorithm_metrics(r.clone(), &stored);
        store.save_algorithm_result(&live).unwrap();

        let recomputed = recompute_run(&store, &MetricsCalculator::default(), &r, 6).unwrap();
        assert_eq!(recomputed, live);
        assert!(recomputed.trajectory_config.with_scale);
        assert_eq!(recomputed.trajectory_config.rpe_delta, 2);

        let rigid = MetricsCalculator::default().calculate_algorithm_metrics(r, &stored);
        assert_ne!(rigid.trajectory, live.trajectory);
    }

    #[test]
    fn test_confidence_curve_separates_rejected_estimates() {
        let store = MemoryStore::new();
        let r = run(0);
        let mut stored = frames(12);
        for (i, frame) in stored.iter_mut().enumerate() {
            match frame.estimator_result.as_mut() {
                Some(estimate) => estimate.confidence = 0.6 + 0.03 * i as f64,
                // Pose rejected after estimation.
                None => {
                    let mut estimate = stored_estimate();
                    estimate.confidence = 0.1 + 0.01 * i as f64;
                    frame.estimator_result = Some(estimate);
                    frame.status = FrameStatus::InvalidPose;
                }
            }
        }
        stored.push(FrameResult::failure(12, 12.0, FrameStatus::ProcessingError, "io"));
        store.save_run(&r).unwrap();
        store.append_frame_results(&r, &stored).unwrap();

        let curve = confidence_curve(&store, &PrCurveCalculator::new(50), &r, 5).unwrap();
        assert_eq!(curve.label, r.algorithm_key());
        assert!((curve.auc - 1.0).abs() < 1e-9);
        assert!((curve.optimal.f1 - 1.0).abs() < 1e-9);
        assert!(curve.optimal.threshold > 0.21 && curve.optimal.threshold <= 0.6);
    }

    fn stored_estimate() -> crate::model::EstimatorResult {
        frames(1).remove(0).estimator_result.unwrap()
    }
}
