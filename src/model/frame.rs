//! Per-frame processing outcome.

use std::fmt;

use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};

/// Outcome tag of one frame pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameStatus {
    Success,
    InsufficientFeatures,
    InsufficientMatches,
    EstimationFailed,
    InvalidPose,
    ProcessingError,
}

impl FrameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameStatus::Success => "SUCCESS",
            FrameStatus::InsufficientFeatures => "INSUFFICIENT_FEATURES",
            FrameStatus::InsufficientMatches => "INSUFFICIENT_MATCHES",
            FrameStatus::EstimationFailed => "ESTIMATION_FAILED",
            FrameStatus::InvalidPose => "INVALID_POSE",
            FrameStatus::ProcessingError => "PROCESSING_ERROR",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FrameStatus::Success)
    }
}

impl fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keypoint counts on both images of the pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub num_keypoints_a: usize,
    pub num_keypoints_b: usize,
    pub extraction_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub num_matches: usize,
    pub mean_distance: f64,
    pub matching_time_ms: f64,
}

/// What the robust estimator reported for one frame pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorResult {
    pub inlier_mask: Vec<bool>,
    pub rotation: Matrix3<f64>,
    /// Unit-norm direction for monocular estimation.
    pub translation: Vector3<f64>,
    pub iterations: u32,
    pub confidence: f64,
    pub estimation_time_ms: f64,
}

impl EstimatorResult {
    pub fn num_inliers(&self) -> usize {
        self.inlier_mask.iter().filter(|m| **m).count()
    }

    pub fn inlier_ratio(&self) -> f64 {
        if self.inlier_mask.is_empty() {
            0.0
        } else {
            self.num_inliers() as f64 / self.inlier_mask.len() as f64
        }
    }
}

/// Relative-motion error against ground truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseError {
    pub rotation_error_deg: f64,
    /// Angle between estimated and true translation directions.
    pub translation_error_deg: f64,
}

/// Outcome of processing one frame pair.
///
/// Use [`FrameResult::success`] / [`FrameResult::failure`] to build values:
/// a `SUCCESS` frame always carries an estimator result and every other
/// status carries an error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    pub frame_id: usize,
    pub timestamp: f64,
    pub features: Option<FeatureSummary>,
    pub matches: Option<MatchSummary>,
    pub estimator_result: Option<EstimatorResult>,
    pub num_matches: usize,
    pub num_inliers: usize,
    pub estimated_pose: Option<Matrix4<f64>>,
    pub ground_truth_pose: Option<Matrix4<f64>>,
    pub processing_time_ms: f64,
    pub status: FrameStatus,
    pub pose_error: Option<PoseError>,
    pub reprojection_errors: Option<Vec<f64>>,
    pub error: Option<String>,
}

impl FrameResult {
    pub fn success(frame_id: usize, timestamp: f64, estimator_result: EstimatorResult) -> Self {
        let num_inliers = estimator_result.num_inliers();
        let num_matches = estimator_result.inlier_mask.len();
        Self {
            frame_id,
            timestamp,
            features: None,
            matches: None,
            estimator_result: Some(estimator_result),
            num_matches,
            num_inliers,
            estimated_pose: None,
            ground_truth_pose: None,
            processing_time_ms: 0.0,
            status: FrameStatus::Success,
            pose_error: None,
            reprojection_errors: None,
            error: None,
        }
    }

    /// Failed frame. `status` must not be `Success`; a success tag is
    /// downgraded to `ProcessingError` to keep the invariant.
    pub fn failure(
        frame_id: usize,
        timestamp: f64,
        status: FrameStatus,
        error: impl Into<String>,
    ) -> Self {
        let status = if status.is_success() {
            FrameStatus::ProcessingError
        } else {
            status
        };
        Self {
            frame_id,
            timestamp,
            features: None,
            matches: None,
            estimator_result: None,
            num_matches: 0,
            num_inliers: 0,
            estimated_pose: None,
            ground_truth_pose: None,
            processing_time_ms: 0.0,
            status,
            pose_error: None,
            reprojection_errors: None,
            error: Some(error.into()),
        }
    }

    pub fn with_features(mut self, features: FeatureSummary) -> Self {
        self.features = Some(features);
        self
    }

    pub fn with_matches(mut self, matches: MatchSummary) -> Self {
        self.num_matches = matches.num_matches;
        self.matches = Some(matches);
        self
    }

    pub fn with_poses(
        mut self,
        estimated: Option<Matrix4<f64>>,
        ground_truth: Option<Matrix4<f64>>,
    ) -> Self {
        self.estimated_pose = estimated;
        self.ground_truth_pose = ground_truth;
        self
    }

    pub fn with_processing_time(mut self, ms: f64) -> Self {
        self.processing_time_ms = ms;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the status/payload invariant holds.
    pub fn is_consistent(&self) -> bool {
        if self.is_success() {
            self.estimator_result.is_some()
        } else {
            self.error.is_some()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator(mask: Vec<bool>) -> EstimatorResult {
        EstimatorResult {
            inlier_mask: mask,
            rotation: Matrix3::identity(),
            translation: Vector3::z(),
            iterations: 42,
            confidence: 0.9,
            estimation_time_ms: 1.0,
        }
    }

    #[test]
    fn test_success_counts_inliers() {
        let frame = FrameResult::success(3, 0.1, estimator(vec![true, false, true, true]));
        assert_eq!(frame.num_matches, 4);
        assert_eq!(frame.num_inliers, 3);
        assert!(frame.is_consistent());
    }

    #[test]
    fn test_failure_never_claims_success() {
        let frame = FrameResult::failure(1, 0.0, FrameStatus::Success, "boom");
        assert_eq!(frame.status, FrameStatus::ProcessingError);
        assert!(frame.is_consistent());
        assert!(frame.estimator_result.is_none());
    }

    #[test]
    fn test_status_serializes_as_tag() {
        let json = serde_json::to_string(&FrameStatus::InsufficientMatches).unwrap();
        assert_eq!(json, "\"INSUFFICIENT_MATCHES\"");
    }
}
