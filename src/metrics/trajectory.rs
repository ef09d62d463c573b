//! Trajectory scoring: ATE / RPE after closed-form alignment.

use nalgebra::{Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::geometry::align_points;
use crate::geometry::pose::{self, RIGID_TOLERANCE};
use crate::model::TrajectoryMetrics;

use super::stats::error_stats;

/// Alignment and RPE settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    /// Align the estimate onto ground truth before scoring.
    pub align: bool,
    /// Estimate a similarity (with scale) rather than a rigid alignment.
    pub with_scale: bool,
    /// Frame offset for relative pose error.
    pub rpe_delta: usize,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            align: true,
            with_scale: false,
            rpe_delta: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrajectoryEvaluator {
    config: TrajectoryConfig,
}

impl TrajectoryEvaluator {
    pub fn new(config: TrajectoryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrajectoryConfig {
        &self.config
    }

    /// Score `estimated` against `ground_truth`, index by index.
    ///
    /// Indices where either pose is missing or not a valid rigid transform
    /// are skipped. Returns `None` with fewer than two usable pairs or when
    /// the result is not finite.
    pub fn compute_metrics(
        &self,
        ground_truth: &[Option<Matrix4<f64>>],
        estimated: &[Option<Matrix4<f64>>],
    ) -> Option<TrajectoryMetrics> {
        let (gt, est): (Vec<Matrix4<f64>>, Vec<Matrix4<f64>>) = ground_truth
            .iter()
            .zip(estimated.iter())
            .filter_map(|(g, e)| match (g, e) {
                (Some(g), Some(e))
                    if pose::is_valid_rigid_transform(g, RIGID_TOLERANCE)
                        && pose::is_valid_rigid_transform(e, RIGID_TOLERANCE) =>
                {
                    Some((*g, *e))
                }
                _ => None,
            })
            .unzip();

        if gt.len() < 2 {
            debug!(valid = gt.len(), "Not enough valid pose pairs for trajectory metrics");
            return None;
        }

        let (aligned, scale) = self.align(&gt, &est);

        let ate: Vec<f64> = gt
            .iter()
            .zip(aligned.iter())
            .map(|(g, e)| (pose::position(g) - pose::position(e)).norm())
            .collect();

        let delta = self.config.rpe_delta.max(1);
        let rpe: Vec<f64> = (0..gt.len().saturating_sub(delta))
            .map(|i| {
                let gt_rel = pose::relative(&gt[i], &gt[i + delta]);
                let est_rel = pose::relative(&aligned[i], &aligned[i + delta]);
                let err = pose::rigid_inverse(&gt_rel) * est_rel;
                pose::position(&err).norm()
            })
            .collect();

        let trajectory_length: f64 = gt
            .windows(2)
            .map(|w| (pose::position(&w[1]) - pose::position(&w[0])).norm())
            .sum();

        let metrics = TrajectoryMetrics {
            ate: error_stats(&ate),
            rpe: error_stats(&rpe),
            trajectory_length,
            num_valid_poses: gt.len(),
            alignment_scale: scale,
        };

        if !is_finite(&metrics) {
            warn!("Trajectory metrics are not finite, discarding");
            return None;
        }
        Some(metrics)
    }

    /// Aligned estimate and the applied scale. Falls back to the raw
    /// estimate when alignment is disabled or degenerate.
    fn align(&self, gt: &[Matrix4<f64>], est: &[Matrix4<f64>]) -> (Vec<Matrix4<f64>>, f64) {
        if !self.config.align {
            return (est.to_vec(), 1.0);
        }
        let src: Vec<Vector3<f64>> = est.iter().map(pose::position).collect();
        let dst: Vec<Vector3<f64>> = gt.iter().map(pose::position).collect();
        match align_points(&src, &dst, self.config.with_scale) {
            Some(sim3) => {
                let aligned = est.iter().map(|p| sim3.transform_pose(p)).collect();
                (aligned, sim3.scale)
            }
            None => {
                warn!(poses = est.len(), "Trajectory alignment failed, scoring unaligned");
                (est.to_vec(), 1.0)
            }
        }
    }
}

fn is_finite(m: &TrajectoryMetrics) -> bool {
    let stats = [&m.ate, &m.rpe];
    stats.iter().all(|s| {
        [s.rmse, s.mean, s.median, s.std, s.min, s.max]
            .iter()
            .all(|v| v.is_finite())
    }) && m.trajectory_length.is_finite()
        && m.alignment_scale.is_finite()
}
