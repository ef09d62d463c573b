//! Aggregate metric records derived from frame results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::AlgorithmRun;
use crate::metrics::TrajectoryConfig;

/// Summary statistics over a set of errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub rmse: f64,
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Absolute and relative trajectory error for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryMetrics {
    pub ate: ErrorStats,
    pub rpe: ErrorStats,
    /// Ground-truth path length in meters.
    pub trajectory_length: f64,
    pub num_valid_poses: usize,
    /// Scale of the alignment applied to the estimate (1.0 when unaligned).
    pub alignment_scale: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchingMetrics {
    pub avg_num_keypoints: f64,
    pub avg_num_matches: f64,
    pub avg_num_inliers: f64,
    pub avg_inlier_ratio: f64,
    pub avg_matching_time_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RansacMetrics {
    pub avg_iterations: f64,
    pub std_iterations: f64,
    pub min_iterations: f64,
    pub max_iterations: f64,
    pub avg_inlier_ratio: f64,
    pub avg_confidence: f64,
    /// Fraction of successful frames whose confidence exceeds 0.5.
    pub convergence_rate: f64,
    /// Successful frames over all frames.
    pub success_rate: f64,
    pub avg_estimation_time_ms: f64,
}

/// Final metrics for one [`AlgorithmRun`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmMetrics {
    pub run: AlgorithmRun,
    pub algorithm_key: String,
    pub trajectory: Option<TrajectoryMetrics>,
    pub matching: MatchingMetrics,
    pub ransac: RansacMetrics,
    pub avg_frame_time_ms: f64,
    pub total_time_s: f64,
    pub fps: f64,
    pub success_rate: f64,
    pub total_frames: usize,
    pub successful_frames: usize,
    pub failed_frames: usize,
    pub failure_reasons: BTreeMap<String, usize>,
    /// Settings the trajectory metrics were scored with; recompute reuses them.
    #[serde(default)]
    pub trajectory_config: TrajectoryConfig,
}

impl AlgorithmMetrics {
    /// Zeroed metrics for a run that produced no frames.
    pub fn empty(run: AlgorithmRun) -> Self {
        Self {
            algorithm_key: run.algorithm_key(),
            run,
            trajectory: None,
            matching: MatchingMetrics::default(),
            ransac: RansacMetrics::default(),
            avg_frame_time_ms: 0.0,
            total_time_s: 0.0,
            fps: 0.0,
            success_rate: 0.0,
            total_frames: 0,
            successful_frames: 0,
            failed_frames: 0,
            failure_reasons: BTreeMap::new(),
            trajectory_config: TrajectoryConfig::default(),
        }
    }
}
