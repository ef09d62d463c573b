//! Folding frame results into [`AlgorithmMetrics`].
//!
//! Every entry point, batch or streaming, drives the same
//! [`MetricsAccumulator`], so the two paths agree exactly for the same
//! frame order.

use std::collections::BTreeMap;

use nalgebra::Matrix4;
use tracing::debug;

use crate::model::{
    AlgorithmMetrics, AlgorithmRun, FrameResult, MatchingMetrics, RansacMetrics,
};

use super::stats::RunningStats;
use super::trajectory::TrajectoryEvaluator;

/// Confidence above which an estimator run counts as converged.
pub const CONVERGENCE_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Default)]
struct MatchingAccumulator {
    keypoints: RunningStats,
    matches: RunningStats,
    inliers: RunningStats,
    inlier_ratio: RunningStats,
    matching_time: RunningStats,
}

impl MatchingAccumulator {
    fn push(&mut self, frame: &FrameResult) {
        let keypoints = frame
            .features
            .as_ref()
            .map(|f| (f.num_keypoints_a + f.num_keypoints_b) as f64 / 2.0)
            .unwrap_or(0.0);
        let ratio = if frame.num_matches > 0 {
            frame.num_inliers as f64 / frame.num_matches as f64
        } else {
            0.0
        };
        self.keypoints.push(keypoints);
        self.matches.push(frame.num_matches as f64);
        self.inliers.push(frame.num_inliers as f64);
        self.inlier_ratio.push(ratio);
        self.matching_time
            .push(frame.matches.as_ref().map(|m| m.matching_time_ms).unwrap_or(0.0));
    }

    fn finish(&self) -> MatchingMetrics {
        MatchingMetrics {
            avg_num_keypoints: self.keypoints.mean(),
            avg_num_matches: self.matches.mean(),
            avg_num_inliers: self.inliers.mean(),
            avg_inlier_ratio: self.inlier_ratio.mean(),
            avg_matching_time_ms: self.matching_time.mean(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RansacAccumulator {
    frames: usize,
    iterations: RunningStats,
    inlier_ratio: RunningStats,
    confidence: RunningStats,
    estimation_time: RunningStats,
    converged: usize,
}

impl RansacAccumulator {
    fn push(&mut self, frame: &FrameResult) {
        self.frames += 1;
        let Some(est) = frame.estimator_result.as_ref().filter(|_| frame.is_success()) else {
            return;
        };
        self.iterations.push(est.iterations as f64);
        self.inlier_ratio.push(est.inlier_ratio());
        self.confidence.push(est.confidence);
        self.estimation_time.push(est.estimation_time_ms);
        if est.confidence > CONVERGENCE_CONFIDENCE {
            self.converged += 1;
        }
    }

    fn finish(&self) -> RansacMetrics {
        let n = self.iterations.count();
        if n == 0 {
            return RansacMetrics::default();
        }
        RansacMetrics {
            avg_iterations: self.iterations.mean(),
            std_iterations: self.iterations.std(),
            min_iterations: self.iterations.min(),
            max_iterations: self.iterations.max(),
            avg_inlier_ratio: self.inlier_ratio.mean(),
            avg_confidence: self.confidence.mean(),
            convergence_rate: self.converged as f64 / n as f64,
            success_rate: n as f64 / self.frames as f64,
            avg_estimation_time_ms: self.estimation_time.mean(),
        }
    }
}

/// Incremental aggregation state for one run.
#[derive(Debug, Clone)]
pub struct MetricsAccumulator {
    run: AlgorithmRun,
    total_frames: usize,
    successful_frames: usize,
    failure_reasons: BTreeMap<String, usize>,
    processing_time_ms: f64,
    matching: MatchingAccumulator,
    ransac: RansacAccumulator,
    ground_truth: Vec<Option<Matrix4<f64>>>,
    estimated: Vec<Option<Matrix4<f64>>>,
}

impl MetricsAccumulator {
    pub fn new(run: AlgorithmRun) -> Self {
        Self {
            run,
            total_frames: 0,
            successful_frames: 0,
            failure_reasons: BTreeMap::new(),
            processing_time_ms: 0.0,
            matching: MatchingAccumulator::default(),
            ransac: RansacAccumulator::default(),
            ground_truth: Vec::new(),
            estimated: Vec::new(),
        }
    }

    pub fn push(&mut self, frame: &FrameResult) {
        self.total_frames += 1;
        if frame.is_success() {
            self.successful_frames += 1;
        } else {
            *self
                .failure_reasons
                .entry(frame.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        self.processing_time_ms += frame.processing_time_ms;
        self.matching.push(frame);
        self.ransac.push(frame);

        if let (Some(gt), Some(est)) = (frame.ground_truth_pose, frame.estimated_pose) {
            self.ground_truth.push(Some(gt));
            self.estimated.push(Some(est));
        }
    }

    pub fn frames_seen(&self) -> usize {
        self.total_frames
    }

    pub fn finish(self, evaluator: &TrajectoryEvaluator) -> AlgorithmMetrics {
        if self.total_frames == 0 {
            return AlgorithmMetrics {
                trajectory_config: evaluator.config().clone(),
                ..AlgorithmMetrics::empty(self.run)
            };
        }

        let n = self.total_frames as f64;
        let total_time_s = self.processing_time_ms / 1000.0;
        let fps = if total_time_s > 0.0 { n / total_time_s } else { 0.0 };

        AlgorithmMetrics {
            algorithm_key: self.run.algorithm_key(),
            trajectory: evaluator.compute_metrics(&self.ground_truth, &self.estimated),
            matching: self.matching.finish(),
            ransac: self.ransac.finish(),
            avg_frame_time_ms: self.processing_time_ms / n,
            total_time_s,
            fps,
            success_rate: self.successful_frames as f64 / n,
            total_frames: self.total_frames,
            successful_frames: self.successful_frames,
            failed_frames: self.total_frames - self.successful_frames,
            failure_reasons: self.failure_reasons,
            trajectory_config: evaluator.config().clone(),
            run: self.run,
        }
    }
}

/// Entry points for computing run metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCalculator {
    evaluator: TrajectoryEvaluator,
}

impl MetricsCalculator {
    pub fn new(evaluator: TrajectoryEvaluator) -> Self {
        Self { evaluator }
    }

    pub fn evaluator(&self) -> &TrajectoryEvaluator {
        &self.evaluator
    }

    pub fn accumulator(&self, run: AlgorithmRun) -> MetricsAccumulator {
        MetricsAccumulator::new(run)
    }

    pub fn finish(&self, acc: MetricsAccumulator) -> AlgorithmMetrics {
        acc.finish(&self.evaluator)
    }

    pub fn calculate_algorithm_metrics(
        &self,
        run: AlgorithmRun,
        frames: &[FrameResult],
    ) -> AlgorithmMetrics {
        let mut acc = MetricsAccumulator::new(run);
        for frame in frames {
            acc.push(frame);
        }
        acc.finish(&self.evaluator)
    }

    /// Same result as [`Self::calculate_algorithm_metrics`] without holding
    /// every frame in memory. `total_frames` only feeds progress logging.
    pub fn calculate_algorithm_metrics_streaming<I>(
        &self,
        run: AlgorithmRun,
        frames: I,
        total_frames: Option<usize>,
    ) -> AlgorithmMetrics
    where
        I: IntoIterator<Item = FrameResult>,
    {
        let mut acc = MetricsAccumulator::new(run);
        for frame in frames {
            acc.push(&frame);
            let seen = acc.frames_seen();
            if seen % 500 == 0 {
                debug!(seen, total = ?total_frames, "Streaming metrics progress");
            }
        }
        acc.finish(&self.evaluator)
    }
}

pub fn compute_ransac_metrics(frames: &[FrameResult]) -> RansacMetrics {
    let mut acc = RansacAccumulator::default();
    for frame in frames {
        acc.push(frame);
    }
    acc.finish()
}

pub fn compute_matching_metrics(frames: &[FrameResult]) -> MatchingMetrics {
    let mut acc = MatchingAccumulator::default();
    for frame in frames {
        acc.push(frame);
    }
    acc.finish()
}
