use std::collections::HashMap;

use anyhow::Result;
use parking_lot::Mutex;

use super::ResultStore;
use crate::model::{AlgorithmMetrics, AlgorithmRun, FrameResult};

#[derive(Default)]
struct ExperimentData {
    runs: Vec<AlgorithmRun>,
    frames: HashMap<String, Vec<FrameResult>>,
    metrics: HashMap<String, AlgorithmMetrics>,
}

/// Process-local store, used in tests and for throwaway runs.
#[derive(Default)]
pub struct MemoryStore {
    experiments: Mutex<HashMap<String, ExperimentData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultStore for MemoryStore {
    fn save_run(&self, run: &AlgorithmRun) -> Result<()> {
        let mut experiments = self.experiments.lock();
        let data = experiments.entry(run.experiment_id.clone()).or_default();
        if !data.runs.contains(run) {
            data.runs.push(run.clone());
        }
        data.frames.insert(run.storage_key(), Vec::new());
        Ok(())
    }

    fn list_runs(&self, experiment_id: &str) -> Result<Vec<AlgorithmRun>> {
        Ok(self
            .experiments
            .lock()
            .get(experiment_id)
            .map(|d| d.runs.clone())
            .unwrap_or_default())
    }

    fn append_frame_results(&self, run: &AlgorithmRun, frames: &[FrameResult]) -> Result<()> {
        self.experiments
            .lock()
            .entry(run.experiment_id.clone())
            .or_default()
            .frames
            .entry(run.storage_key())
            .or_default()
            .extend_from_slice(frames);
        Ok(())
    }

    fn get_frame_results(
        &self,
        experiment_id: &str,
        storage_key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<FrameResult>, usize)> {
        let experiments = self.experiments.lock();
        let Some(frames) = experiments
            .get(experiment_id)
            .and_then(|d| d.frames.get(storage_key))
        else {
            return Ok((Vec::new(), 0));
        };
        let page = frames.iter().skip(offset).take(limit).cloned().collect();
        Ok((page, frames.len()))
    }

    fn save_algorithm_result(&self, metrics: &AlgorithmMetrics) -> Result<()> {
        self.experiments
            .lock()
            .entry(metrics.run.experiment_id.clone())
            .or_default()
            .metrics
            .insert(metrics.run.storage_key(), metrics.clone());
        Ok(())
    }

    fn get_algorithm_result(
        &self,
        experiment_id: &str,
        storage_key: &str,
    ) -> Result<Option<AlgorithmMetrics>> {
        Ok(self
            .experiments
            .lock()
            .get(experiment_id)
            .and_then(|d| d.metrics.get(storage_key).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{frames, run};

    #[test]
    fn test_paging_and_reset() {
        let store = MemoryStore::new();
        let r = run(0);
        store.save_run(&r).unwrap();
        store.append_frame_results(&r, &frames(5)).unwrap();
        store.append_frame_results(&r, &frames(2)).unwrap();

        let (page, total) = store.get_frame_results("exp-1", &r.storage_key(), 4, 10).unwrap();
        assert_eq!(total, 7);
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].frame_id, 4);

        store.save_run(&r).unwrap();
        let (_, total) = store.get_frame_results("exp-1", &r.storage_key(), 0, 10).unwrap();
        assert_eq!(total, 0);
        assert_eq!(store.list_runs("exp-1").unwrap(), vec![r]);
        assert!(store.list_runs("other").unwrap().is_empty());
    }
}
