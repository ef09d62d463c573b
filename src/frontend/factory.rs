//! Resolve algorithm identifiers into concrete frontend components.

use anyhow::Result;
use tracing::debug;

use super::matcher::{BruteForceMatcher, DistanceNorm};
use super::processor::{FrameProcessor, VisualOdometryProcessor};
use super::{FeatureExtractor, FeatureMatcher, FrontendConfig, PoseEstimator};
use crate::dataset::Sequence;
use crate::model::{AlgorithmRun, EstimatorType, FeatureType};

#[cfg(feature = "opencv")]
pub fn create_extractor(
    feature_type: FeatureType,
    config: &FrontendConfig,
) -> Result<Box<dyn FeatureExtractor>> {
    Ok(Box::new(super::opencv_backend::OpenCvExtractor::new(
        feature_type,
        config,
    )?))
}

#[cfg(not(feature = "opencv"))]
pub fn create_extractor(
    feature_type: FeatureType,
    _config: &FrontendConfig,
) -> Result<Box<dyn FeatureExtractor>> {
    Err(super::FrontendError::ExtractorUnavailable(feature_type).into())
}

pub fn create_matcher(feature_type: FeatureType, config: &FrontendConfig) -> Box<dyn FeatureMatcher> {
    let norm = if feature_type.has_binary_descriptors() {
        DistanceNorm::Hamming
    } else {
        DistanceNorm::L2
    };
    Box::new(BruteForceMatcher::new(norm, config.ratio_test))
}

#[cfg(feature = "opencv")]
pub fn create_estimator(
    estimator_type: EstimatorType,
    config: &FrontendConfig,
) -> Result<Box<dyn PoseEstimator>> {
    Ok(Box::new(super::opencv_backend::EssentialMatrixEstimator::new(
        estimator_type,
        config,
    )))
}

#[cfg(not(feature = "opencv"))]
pub fn create_estimator(
    estimator_type: EstimatorType,
    _config: &FrontendConfig,
) -> Result<Box<dyn PoseEstimator>> {
    Err(super::FrontendError::EstimatorUnavailable(estimator_type).into())
}

/// Builds the frame processor for one run.
pub trait ProcessorFactory: Send + Sync {
    fn create(&self, run: &AlgorithmRun, sequence: &dyn Sequence) -> Result<Box<dyn FrameProcessor>>;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultProcessorFactory {
    config: FrontendConfig,
}

impl DefaultProcessorFactory {
    pub fn new(config: FrontendConfig) -> Self {
        Self { config }
    }
}

impl ProcessorFactory for DefaultProcessorFactory {
    fn create(&self, run: &AlgorithmRun, sequence: &dyn Sequence) -> Result<Box<dyn FrameProcessor>> {
        debug!(run = %run, "Building frame processor");
        let extractor = create_extractor(run.feature_type, &self.config)?;
        let matcher = create_matcher(run.feature_type, &self.config);
        let estimator = create_estimator(run.estimator_type, &self.config)?;
        Ok(Box::new(VisualOdometryProcessor::new(
            extractor,
            matcher,
            estimator,
            sequence.intrinsics(),
            &self.config,
        )))
    }
}
