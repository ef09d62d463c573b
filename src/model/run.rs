//! Algorithm families and the run identity they combine into.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Feature detector/descriptor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeatureType {
    Orb,
    Sift,
    Akaze,
    Brisk,
}

impl FeatureType {
    pub const ALL: [FeatureType; 4] = [
        FeatureType::Orb,
        FeatureType::Sift,
        FeatureType::Akaze,
        FeatureType::Brisk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::Orb => "ORB",
            FeatureType::Sift => "SIFT",
            FeatureType::Akaze => "AKAZE",
            FeatureType::Brisk => "BRISK",
        }
    }

    /// Binary descriptors are compared with Hamming distance, float ones with L2.
    pub fn has_binary_descriptors(&self) -> bool {
        !matches!(self, FeatureType::Sift)
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ORB" => Ok(FeatureType::Orb),
            "SIFT" => Ok(FeatureType::Sift),
            "AKAZE" => Ok(FeatureType::Akaze),
            "BRISK" => Ok(FeatureType::Brisk),
            other => bail!("unknown feature type '{}'", other),
        }
    }
}

/// Robust estimator used to fit the essential matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EstimatorType {
    Ransac,
    Lmeds,
    Magsac,
    Prosac,
    UsacDefault,
}

impl EstimatorType {
    pub const ALL: [EstimatorType; 5] = [
        EstimatorType::Ransac,
        EstimatorType::Lmeds,
        EstimatorType::Magsac,
        EstimatorType::Prosac,
        EstimatorType::UsacDefault,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EstimatorType::Ransac => "RANSAC",
            EstimatorType::Lmeds => "LMEDS",
            EstimatorType::Magsac => "MAGSAC",
            EstimatorType::Prosac => "PROSAC",
            EstimatorType::UsacDefault => "USAC_DEFAULT",
        }
    }
}

impl fmt::Display for EstimatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EstimatorType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "RANSAC" => Ok(EstimatorType::Ransac),
            "LMEDS" => Ok(EstimatorType::Lmeds),
            "MAGSAC" => Ok(EstimatorType::Magsac),
            "PROSAC" => Ok(EstimatorType::Prosac),
            "USAC_DEFAULT" | "USAC" => Ok(EstimatorType::UsacDefault),
            other => bail!("unknown estimator type '{}'", other),
        }
    }
}

/// One concrete evaluation unit: (feature, estimator, sequence, repeat index)
/// inside an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlgorithmRun {
    pub experiment_id: String,
    pub feature_type: FeatureType,
    pub estimator_type: EstimatorType,
    pub sequence: String,
    pub run_index: usize,
}

impl AlgorithmRun {
    pub fn new(
        experiment_id: impl Into<String>,
        feature_type: FeatureType,
        estimator_type: EstimatorType,
        sequence: impl Into<String>,
        run_index: usize,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            feature_type,
            estimator_type,
            sequence: sequence.into(),
            run_index,
        }
    }

    /// Key shared by all repeats of the same configuration on a sequence.
    pub fn algorithm_key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.feature_type, self.estimator_type, self.sequence
        )
    }

    /// Key under which this particular repeat's results are stored.
    pub fn storage_key(&self) -> String {
        format!("{}_run{}", self.algorithm_key(), self.run_index)
    }
}

impl fmt::Display for AlgorithmRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (run {})", self.algorithm_key(), self.run_index)
    }
}
