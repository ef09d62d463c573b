//! Visual-odometry frontend: feature extraction, matching, robust pose
//! estimation, and the frame-pair processor built from them.

pub mod factory;
pub mod matcher;
#[cfg(feature = "opencv")]
pub mod opencv_backend;
pub mod processor;

use anyhow::Result;
use image::GrayImage;
use nalgebra::{Matrix3, Point2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{EstimatorResult, EstimatorType, FeatureType};

pub use factory::{DefaultProcessorFactory, ProcessorFactory, create_estimator, create_extractor, create_matcher};
pub use matcher::{BruteForceMatcher, DistanceNorm};
pub use processor::{FrameProcessor, VisualOdometryProcessor};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrontendError {
    #[error("{0} extraction needs the `opencv` backend, which this build does not include")]
    ExtractorUnavailable(FeatureType),
    #[error("{0} estimation needs the `opencv` backend, which this build does not include")]
    EstimatorUnavailable(EstimatorType),
}

/// Descriptor matrix, one row per keypoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptors {
    Binary(Vec<Vec<u8>>),
    Float(Vec<Vec<f32>>),
}

impl Descriptors {
    pub fn len(&self) -> usize {
        match self {
            Descriptors::Binary(d) => d.len(),
            Descriptors::Float(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub keypoints: Vec<Point2<f64>>,
    pub descriptors: Descriptors,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Correspondence between keypoint `query` of the first image and `train`
/// of the second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub query: usize,
    pub train: usize,
    pub distance: f32,
}

pub trait FeatureExtractor: Send {
    fn extract(&mut self, image: &GrayImage) -> Result<Features>;
}

pub trait FeatureMatcher: Send {
    fn match_features(&self, a: &Features, b: &Features) -> Result<Vec<Match>>;
}

pub trait PoseEstimator: Send {
    /// Fit relative motion from `matches` between `points1` and `points2`.
    /// The inlier mask has one entry per match.
    fn estimate(
        &mut self,
        points1: &[Point2<f64>],
        points2: &[Point2<f64>],
        matches: &[Match],
        intrinsics: &Matrix3<f64>,
    ) -> Result<EstimatorResult>;
}

/// Frontend tuning shared by every algorithm combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub max_features: usize,
    /// Lowe ratio between best and second-best descriptor distance.
    pub ratio_test: f32,
    /// Reprojection threshold in pixels.
    pub ransac_threshold: f64,
    pub ransac_confidence: f64,
    pub max_iterations: u32,
    pub min_features: usize,
    pub min_matches: usize,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            max_features: 2000,
            ratio_test: 0.75,
            ransac_threshold: 1.0,
            ransac_confidence: 0.999,
            max_iterations: 1000,
            min_features: 8,
            min_matches: 8,
        }
    }
}

/// Iterations needed to draw one all-inlier sample with `probability`.
pub fn adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: usize) -> u32 {
    if inlier_ratio <= 0.0 {
        return u32::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_denom = (1.0 - w_n).ln();
    if log_denom.abs() < 1e-10 {
        return 1;
    }
    let k = (1.0 - probability).ln() / log_denom;
    if k >= u32::MAX as f64 {
        u32::MAX
    } else {
        (k.ceil() as u32).max(1)
    }
}

/// Probability that `iterations` samples contained an all-inlier one.
pub fn sampling_confidence(inlier_ratio: f64, iterations: u32, sample_size: usize) -> f64 {
    if inlier_ratio <= 0.0 || iterations == 0 {
        return 0.0;
    }
    let w_n = inlier_ratio.min(1.0).powi(sample_size as i32);
    1.0 - (1.0 - w_n).powf(iterations as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_iterations() {
        assert_eq!(adaptive_iterations(1.0, 0.99, 5), 1);
        assert_eq!(adaptive_iterations(0.0, 0.99, 5), u32::MAX);
        // 0.5^5 = 1/32, ln(0.01) / ln(31/32) ~ 145.1
        assert_eq!(adaptive_iterations(0.5, 0.99, 5), 146);
    }

    #[test]
    fn test_sampling_confidence_matches_target() {
        let iters = adaptive_iterations(0.6, 0.99, 5);
        let conf = sampling_confidence(0.6, iters, 5);
        assert!(conf >= 0.99 && conf < 1.0);
        assert_eq!(sampling_confidence(0.0, 100, 5), 0.0);
    }
}
