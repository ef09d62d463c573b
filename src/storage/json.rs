//! Directory-backed store.
//!
//! Layout under the root, one directory per experiment:
//! `runs.json`, `<storage_key>.frames.jsonl` (one frame per line) and
//! `<storage_key>.metrics.json`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::debug;

use super::{ResultStore, check_key};
use crate::model::{AlgorithmMetrics, AlgorithmRun, FrameResult};

pub struct JsonStore {
    root: PathBuf,
    // Serializes read-modify-write of runs.json and appends.
    write_lock: Mutex<()>,
}

impl JsonStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create store root {}", root.display()))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn experiment_dir(&self, experiment_id: &str) -> Result<PathBuf> {
        check_key(experiment_id)?;
        Ok(self.root.join(experiment_id))
    }

    fn frames_path(&self, experiment_id: &str, storage_key: &str) -> Result<PathBuf> {
        check_key(storage_key)?;
        Ok(self
            .experiment_dir(experiment_id)?
            .join(format!("{}.frames.jsonl", storage_key)))
    }

    fn metrics_path(&self, experiment_id: &str, storage_key: &str) -> Result<PathBuf> {
        check_key(storage_key)?;
        Ok(self
            .experiment_dir(experiment_id)?
            .join(format!("{}.metrics.json", storage_key)))
    }

    fn runs_path(&self, experiment_id: &str) -> Result<PathBuf> {
        Ok(self.experiment_dir(experiment_id)?.join("runs.json"))
    }

    fn read_runs(&self, experiment_id: &str) -> Result<Vec<AlgorithmRun>> {
        let path = self.runs_path(experiment_id)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).with_context(|| format!("Failed to open {:?}", path))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse {:?}", path))
    }
}

/// Write via a temporary file and rename so readers never see a partial file.
fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp).with_context(|| format!("Failed to create {:?}", tmp))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {:?} into place", path))
}

impl ResultStore for JsonStore {
    fn save_run(&self, run: &AlgorithmRun) -> Result<()> {
        let _guard = self.write_lock.lock();
        let dir = self.experiment_dir(&run.experiment_id)?;
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;

        let mut runs = self.read_runs(&run.experiment_id)?;
        if !runs.contains(run) {
            runs.push(run.clone());
            write_json_atomic(&self.runs_path(&run.experiment_id)?, &runs)?;
        }

        let frames = self.frames_path(&run.experiment_id, &run.storage_key())?;
        File::create(&frames).with_context(|| format!("Failed to reset {:?}", frames))?;
        Ok(())
    }

    fn list_runs(&self, experiment_id: &str) -> Result<Vec<AlgorithmRun>> {
        self.read_runs(experiment_id)
    }

    fn append_frame_results(&self, run: &AlgorithmRun, frames: &[FrameResult]) -> Result<()> {
        let _guard = self.write_lock.lock();
        let path = self.frames_path(&run.experiment_id, &run.storage_key())?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        let mut writer = BufWriter::new(file);
        for frame in frames {
            serde_json::to_writer(&mut writer, frame)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        debug!(key = %run.storage_key(), count = frames.len(), "Appended frame results");
        Ok(())
    }

    fn get_frame_results(
        &self,
        experiment_id: &str,
        storage_key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<FrameResult>, usize)> {
        let path = self.frames_path(experiment_id, storage_key)?;
        if !path.exists() {
            return Ok((Vec::new(), 0));
        }
        let file = File::open(&path).with_context(|| format!("Failed to open {:?}", path))?;

        let mut page = Vec::new();
        let mut total = 0;
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if total >= offset && page.len() < limit {
                let frame: FrameResult = serde_json::from_str(&line)
                    .with_context(|| format!("Bad frame record on line {} of {:?}", i + 1, path))?;
                page.push(frame);
            }
            total += 1;
        }
        Ok((page, total))
    }

    fn save_algorithm_result(&self, metrics: &AlgorithmMetrics) -> Result<()> {
        let _guard = self.write_lock.lock();
        let path = self.metrics_path(&metrics.run.experiment_id, &metrics.run.storage_key())?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        write_json_atomic(&path, metrics)
    }

    fn get_algorithm_result(
        &self,
        experiment_id: &str,
        storage_key: &str,
    ) -> Result<Option<AlgorithmMetrics>> {
        let path = self.metrics_path(experiment_id, storage_key)?;
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path).with_context(|| format!("Failed to open {:?}", path))?;
        let metrics = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(Some(metrics))
    }
}
