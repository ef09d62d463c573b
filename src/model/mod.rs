//! Data model shared by the frontend, the metrics engine and storage.

pub mod frame;
pub mod metrics;
pub mod run;

pub use frame::{
    EstimatorResult, FeatureSummary, FrameResult, FrameStatus, MatchSummary, PoseError,
};
pub use metrics::{AlgorithmMetrics, ErrorStats, MatchingMetrics, RansacMetrics, TrajectoryMetrics};
pub use run::{AlgorithmRun, EstimatorType, FeatureType};
