//! Persistence of runs, frame results and final metrics.

pub mod json;
pub mod memory;

use anyhow::{Result, bail};

use crate::model::{AlgorithmMetrics, AlgorithmRun, FrameResult};

pub use json::JsonStore;
pub use memory::MemoryStore;

/// Storage backend shared by the experiment manager and recompute.
///
/// Frame results and metrics are addressed by experiment id and
/// [`AlgorithmRun::storage_key`].
pub trait ResultStore: Send + Sync {
    /// Register a run. Any frame results stored for it earlier are discarded.
    fn save_run(&self, run: &AlgorithmRun) -> Result<()>;

    fn list_runs(&self, experiment_id: &str) -> Result<Vec<AlgorithmRun>>;

    fn append_frame_results(&self, run: &AlgorithmRun, frames: &[FrameResult]) -> Result<()>;

    /// One page of frame results plus the total stored for the run.
    fn get_frame_results(
        &self,
        experiment_id: &str,
        storage_key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<FrameResult>, usize)>;

    /// Store metrics, replacing any previous value for the same run.
    fn save_algorithm_result(&self, metrics: &AlgorithmMetrics) -> Result<()>;

    fn get_algorithm_result(
        &self,
        experiment_id: &str,
        storage_key: &str,
    ) -> Result<Option<AlgorithmMetrics>>;
}

/// Reject identifiers that could escape a storage directory.
pub(crate) fn check_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.contains(&['/', '\\'][..])
        || key.contains("..")
        || key.starts_with('.')
    {
        bail!("invalid storage key '{}'", key);
    }
    Ok(())
}
