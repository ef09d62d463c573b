//! Experiments: algorithm grids expanded into runs, and their outcomes.

pub mod manager;
pub mod recompute;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::DatasetKind;
use crate::model::{AlgorithmMetrics, AlgorithmRun, EstimatorType, FeatureType};
use crate::tasks::TaskStatus;

pub use manager::ExperimentManager;
pub use recompute::{recompute_experiment, recompute_run};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub kind: DatasetKind,
    pub root: PathBuf,
    pub sequences: Vec<String>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            kind: DatasetKind::Euroc,
            root: PathBuf::from("data/euroc"),
            sequences: vec!["MH_01_easy".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub name: String,
    pub dataset: DatasetConfig,
    pub feature_types: Vec<FeatureType>,
    pub estimator_types: Vec<EstimatorType>,
    /// Repeats per (feature, estimator, sequence) combination.
    pub num_runs: usize,
    /// Runs executed concurrently.
    pub parallel_jobs: usize,
    /// Use every n-th frame of the sequence.
    pub frame_step: usize,
    /// Cap on frames taken from the sequence after stepping.
    pub max_frames: Option<usize>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "benchmark".to_string(),
            dataset: DatasetConfig::default(),
            feature_types: vec![FeatureType::Orb],
            estimator_types: vec![EstimatorType::Ransac],
            num_runs: 1,
            parallel_jobs: 1,
            frame_step: 1,
            max_frames: None,
        }
    }
}

impl ExperimentConfig {
    /// Feature × estimator × sequence × run index, in that nesting order.
    pub fn expand_runs(&self, experiment_id: &str) -> Vec<AlgorithmRun> {
        let mut runs = Vec::new();
        for &feature in &self.feature_types {
            for &estimator in &self.estimator_types {
                for sequence in &self.dataset.sequences {
                    for run_index in 0..self.num_runs {
                        runs.push(AlgorithmRun::new(
                            experiment_id,
                            feature,
                            estimator,
                            sequence.as_str(),
                            run_index,
                        ));
                    }
                }
            }
        }
        runs
    }

    /// Sequence indices a run visits.
    pub fn frame_indices(&self, sequence_len: usize) -> Vec<usize> {
        let indices = (0..sequence_len).step_by(self.frame_step.max(1));
        match self.max_frames {
            Some(max) => indices.take(max).collect(),
            None => indices.collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub config: ExperimentConfig,
    pub runs: Vec<AlgorithmRun>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
}

impl ExperimentStatus {
    /// Aggregate status of an experiment's run tasks.
    ///
    /// Any unfinished task keeps the experiment RUNNING (PENDING if none has
    /// started). Once all are terminal: FAILED when something failed and
    /// nothing completed, COMPLETED when nothing was cancelled, else PARTIAL.
    pub fn from_task_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        let (mut pending, mut running, mut completed, mut failed, mut cancelled) = (0, 0, 0, 0, 0);
        for status in statuses {
            match status {
                TaskStatus::Pending => pending += 1,
                TaskStatus::Running => running += 1,
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed => failed += 1,
                TaskStatus::Cancelled => cancelled += 1,
            }
        }
        let finished = completed + failed + cancelled;
        if running == 0 && finished == 0 {
            ExperimentStatus::Pending
        } else if running > 0 || pending > 0 {
            ExperimentStatus::Running
        } else if failed > 0 && completed == 0 {
            ExperimentStatus::Failed
        } else if cancelled == 0 {
            ExperimentStatus::Completed
        } else {
            ExperimentStatus::Partial
        }
    }
}

/// Result of one run inside an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run: AlgorithmRun,
    pub task_id: String,
    pub status: TaskStatus,
    pub metrics: Option<AlgorithmMetrics>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentOutcome {
    pub experiment_id: String,
    pub status: ExperimentStatus,
    pub runs: Vec<RunOutcome>,
}

impl ExperimentOutcome {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExperimentError {
    #[error("experiment '{0}' not found")]
    NotFound(String),
    #[error("run {0} cancelled")]
    Cancelled(String),
}
