//! Benchmark settings loaded from YAML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::events::DEFAULT_SUBSCRIBER_CAPACITY;
use crate::experiment::ExperimentConfig;
use crate::frontend::FrontendConfig;
use crate::metrics::TrajectoryConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub threads: usize,
    pub queue_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            queue_timeout_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub subscriber_capacity: usize,
    pub heartbeat_ms: u64,
    /// `host:port` of a TCP broker. Events stay in-process when unset.
    pub broker: Option<String>,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            heartbeat_ms: 15_000,
            broker: None,
        }
    }
}

impl EventConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Terminal tasks older than this are pruned.
    pub retention_secs: u64,
    pub prune_interval_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            retention_secs: 24 * 3600,
            prune_interval_secs: 300,
        }
    }
}

impl TaskConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs.min(i64::MAX as u64) as i64)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the JSON store. Results are kept in memory when unset.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub experiment: ExperimentConfig,
    pub frontend: FrontendConfig,
    pub trajectory: TrajectoryConfig,
    pub workers: WorkerConfig,
    pub events: EventConfig,
    pub tasks: TaskConfig,
    pub storage: StorageConfig,
}

impl BenchmarkConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        Self::from_yaml(&text).with_context(|| format!("Invalid config {:?}", path))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: BenchmarkConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let exp = &self.experiment;
        if exp.feature_types.is_empty() || exp.estimator_types.is_empty() {
            bail!("experiment needs at least one feature type and one estimator type");
        }
        if exp.dataset.sequences.is_empty() {
            bail!("experiment needs at least one sequence");
        }
        if exp.num_runs == 0 || exp.parallel_jobs == 0 {
            bail!("num_runs and parallel_jobs must be positive");
        }
        if self.trajectory.rpe_delta == 0 {
            bail!("trajectory.rpe_delta must be positive");
        }
        if self.events.subscriber_capacity == 0 {
            bail!("events.subscriber_capacity must be positive");
        }
        Ok(())
    }
}
