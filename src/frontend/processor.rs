//! Frame-pair processing: extract, match, estimate, chain poses.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use image::GrayImage;
use nalgebra::{Matrix3, Matrix4};
use tracing::{debug, trace};

use super::{FeatureExtractor, FeatureMatcher, Features, FrontendConfig, PoseEstimator};
use crate::dataset::FrameRef;
use crate::geometry::pose::{self, RIGID_TOLERANCE};
use crate::model::{FeatureSummary, FrameResult, FrameStatus, MatchSummary, PoseError};

/// Turns two consecutive frames into one [`FrameResult`].
///
/// An `Err` means the pair could not be processed at all; the caller
/// records it as a `PROCESSING_ERROR` frame.
pub trait FrameProcessor: Send {
    fn process_frame_pair(&mut self, a: &FrameRef, b: &FrameRef) -> Result<FrameResult>;
}

pub type ImageLoader = Box<dyn Fn(&Path) -> Result<GrayImage> + Send>;

pub fn load_gray_image(path: &Path) -> Result<GrayImage> {
    let img = image::open(path).with_context(|| format!("Failed to read image {:?}", path))?;
    Ok(img.to_luma8())
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

pub struct VisualOdometryProcessor {
    extractor: Box<dyn FeatureExtractor>,
    matcher: Box<dyn FeatureMatcher>,
    estimator: Box<dyn PoseEstimator>,
    intrinsics: Matrix3<f64>,
    min_features: usize,
    min_matches: usize,
    load_image: ImageLoader,
    /// Features of the last `b` frame, reused as the next `a`.
    cached: Option<(usize, Features)>,
    /// Chained camera-to-world estimate of the last processed frame.
    last_pose: Option<(usize, Matrix4<f64>)>,
}

impl VisualOdometryProcessor {
    pub fn new(
        extractor: Box<dyn FeatureExtractor>,
        matcher: Box<dyn FeatureMatcher>,
        estimator: Box<dyn PoseEstimator>,
        intrinsics: Matrix3<f64>,
        config: &FrontendConfig,
    ) -> Self {
        Self {
            extractor,
            matcher,
            estimator,
            intrinsics,
            min_features: config.min_features,
            min_matches: config.min_matches,
            load_image: Box::new(load_gray_image),
            cached: None,
            last_pose: None,
        }
    }

    pub fn with_image_loader(mut self, loader: ImageLoader) -> Self {
        self.load_image = loader;
        self
    }

    fn features_for(&mut self, frame: &FrameRef) -> Result<Features> {
        if let Some((idx, features)) = self.cached.take() {
            if idx == frame.index {
                return Ok(features);
            }
        }
        let image = (self.load_image)(&frame.image_path)?;
        self.extractor
            .extract(&image)
            .with_context(|| format!("Feature extraction failed on frame {}", frame.index))
    }

    /// Pose of `a` to chain from: the last estimate if it belongs to `a`,
    /// else ground truth, else the origin.
    fn anchor_pose(&self, a: &FrameRef) -> Matrix4<f64> {
        match self.last_pose {
            Some((idx, pose)) if idx == a.index => pose,
            _ => a.ground_truth.unwrap_or_else(Matrix4::identity),
        }
    }
}

impl FrameProcessor for VisualOdometryProcessor {
    fn process_frame_pair(&mut self, a: &FrameRef, b: &FrameRef) -> Result<FrameResult> {
        let start = Instant::now();
        let anchor = self.anchor_pose(a);
        // Until the pair succeeds, b keeps a's pose.
        self.last_pose = Some((b.index, anchor));

        let t_extract = Instant::now();
        let features_a = self.features_for(a)?;
        let image_b = (self.load_image)(&b.image_path)?;
        let features_b = self
            .extractor
            .extract(&image_b)
            .with_context(|| format!("Feature extraction failed on frame {}", b.index))?;
        let feature_summary = FeatureSummary {
            num_keypoints_a: features_a.len(),
            num_keypoints_b: features_b.len(),
            extraction_time_ms: elapsed_ms(t_extract),
        };

        let fail = |status: FrameStatus, msg: String, start: Instant| {
            FrameResult::failure(b.index, b.timestamp, status, msg)
                .with_poses(None, b.ground_truth)
                .with_processing_time(elapsed_ms(start))
        };

        if features_a.len() < self.min_features || features_b.len() < self.min_features {
            let msg = format!(
                "{} / {} keypoints, need {}",
                features_a.len(),
                features_b.len(),
                self.min_features
            );
            self.cached = Some((b.index, features_b));
            return Ok(fail(FrameStatus::InsufficientFeatures, msg, start)
                .with_features(feature_summary));
        }

        let t_match = Instant::now();
        let matches = self.matcher.match_features(&features_a, &features_b)?;
        let mean_distance = if matches.is_empty() {
            0.0
        } else {
            matches.iter().map(|m| m.distance as f64).sum::<f64>() / matches.len() as f64
        };
        let match_summary = MatchSummary {
            num_matches: matches.len(),
            mean_distance,
            matching_time_ms: elapsed_ms(t_match),
        };

        if matches.len() < self.min_matches {
            let msg = format!("{} matches, need {}", matches.len(), self.min_matches);
            self.cached = Some((b.index, features_b));
            return Ok(fail(FrameStatus::InsufficientMatches, msg, start)
                .with_features(feature_summary)
                .with_matches(match_summary));
        }

        let estimate = self.estimator.estimate(
            &features_a.keypoints,
            &features_b.keypoints,
            &matches,
            &self.intrinsics,
        );
        self.cached = Some((b.index, features_b));
        let est = match estimate {
            Ok(est) => est,
            Err(e) => {
                return Ok(fail(FrameStatus::EstimationFailed, format!("{:#}", e), start)
                    .with_features(feature_summary)
                    .with_matches(match_summary));
            }
        };

        // Estimator motion maps a-frame points into b: x_b = R x_a + t.
        let motion = pose::from_rt(&est.rotation, &est.translation);
        if !pose::is_valid_rigid_transform(&motion, RIGID_TOLERANCE) {
            return Ok(fail(
                FrameStatus::InvalidPose,
                "estimated rotation is not a proper rotation".to_string(),
                start,
            )
            .with_features(feature_summary)
            .with_matches(match_summary));
        }

        let gt_rel = match (a.ground_truth, b.ground_truth) {
            (Some(ga), Some(gb)) => Some(pose::relative(&ga, &gb)),
            _ => None,
        };
        // Monocular translation is up to scale; borrow the metric scale
        // from ground truth when available.
        let scale = gt_rel
            .map(|g| pose::position(&g).norm())
            .unwrap_or(1.0);
        let mut est_rel = pose::rigid_inverse(&motion);
        let t_scaled = pose::position(&est_rel) * scale;
        est_rel.fixed_view_mut::<3, 1>(0, 3).copy_from(&t_scaled);

        let pose_b = anchor * est_rel;
        self.last_pose = Some((b.index, pose_b));

        let pose_error = gt_rel.map(|g| PoseError {
            rotation_error_deg: pose::rotation_angle_deg(
                &(pose::rotation(&g).transpose() * pose::rotation(&est_rel)),
            ),
            translation_error_deg: pose::direction_angle_deg(
                &pose::position(&g),
                &pose::position(&est_rel),
            ),
        });

        trace!(
            frame = b.index,
            inliers = est.num_inliers(),
            matches = matches.len(),
            "Pose estimated"
        );

        let mut result = FrameResult::success(b.index, b.timestamp, est)
            .with_features(feature_summary)
            .with_matches(match_summary)
            .with_poses(Some(pose_b), b.ground_truth)
            .with_processing_time(elapsed_ms(start));
        result.pose_error = pose_error;
        if let Some(err) = &result.pose_error {
            debug!(
                frame = b.index,
                rot_err = err.rotation_error_deg,
                trans_err = err.translation_error_deg,
                "Frame pose error"
            );
        }
        Ok(result)
    }
}
