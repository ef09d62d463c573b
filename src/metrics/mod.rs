//! Metrics engine: per-run aggregation, trajectory scoring, PR curves.

pub mod calculator;
pub mod pr_curve;
pub mod stats;
pub mod trajectory;

pub use calculator::{
    MetricsAccumulator, MetricsCalculator, compute_matching_metrics, compute_ransac_metrics,
};
pub use pr_curve::{PrCurveCalculator, PrCurveData, PrPoint};
pub use trajectory::{TrajectoryConfig, TrajectoryEvaluator};
