//! Expands experiments into runs and executes them against the frontend.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use crossbeam_channel::unbounded;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Experiment, ExperimentConfig, ExperimentError, ExperimentOutcome, ExperimentStatus, RunOutcome,
};
use crate::context::BenchmarkContext;
use crate::dataset::{DatasetLoader, SequenceLoader};
use crate::events::{Event, EventType};
use crate::frontend::ProcessorFactory;
use crate::metrics::{MetricsCalculator, TrajectoryEvaluator};
use crate::model::{AlgorithmMetrics, AlgorithmRun, FrameResult, FrameStatus};
use crate::tasks::worker_pool::panic_message;
use crate::tasks::{CancellationToken, TaskStatus, TaskUpdate, WorkerPool};

/// Frame results buffered before each store append.
pub const DEFAULT_BATCH_SIZE: usize = 100;

pub struct ExperimentManager {
    ctx: Arc<BenchmarkContext>,
    factory: Arc<dyn ProcessorFactory>,
    /// Overrides the loader derived from each experiment's dataset config.
    loader: Option<Arc<dyn SequenceLoader>>,
    calculator: MetricsCalculator,
    batch_size: usize,
}

impl ExperimentManager {
    pub fn new(ctx: Arc<BenchmarkContext>, factory: Arc<dyn ProcessorFactory>) -> Self {
        let evaluator = TrajectoryEvaluator::new(ctx.config().trajectory.clone());
        Self {
            ctx,
            factory,
            loader: None,
            calculator: MetricsCalculator::new(evaluator),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_sequence_loader(mut self, loader: Arc<dyn SequenceLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn context(&self) -> &Arc<BenchmarkContext> {
        &self.ctx
    }

    pub fn calculator(&self) -> &MetricsCalculator {
        &self.calculator
    }

    pub fn create_experiment(&self, config: ExperimentConfig) -> Experiment {
        let id = Uuid::new_v4().to_string();
        let experiment = Experiment {
            runs: config.expand_runs(&id),
            name: config.name.clone(),
            id,
            config,
            created_at: Utc::now(),
        };
        info!(
            experiment_id = %experiment.id,
            name = %experiment.name,
            runs = experiment.runs.len(),
            "Experiment created"
        );
        self.ctx.insert_experiment(experiment.clone());
        experiment
    }

    pub fn get_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        self.ctx
            .get_experiment(experiment_id)
            .ok_or_else(|| ExperimentError::NotFound(experiment_id.to_string()).into())
    }

    fn loader_for(&self, config: &ExperimentConfig) -> Arc<dyn SequenceLoader> {
        match &self.loader {
            Some(loader) => Arc::clone(loader),
            None => Arc::new(DatasetLoader::new(config.dataset.kind, &config.dataset.root)),
        }
    }

    /// Process every frame pair of one run and store its metrics.
    ///
    /// Per-frame failures become failed frame results; only setup errors,
    /// storage errors and cancellation end the run early.
    pub fn run_algorithm(
        &self,
        run: &AlgorithmRun,
        cancel: &CancellationToken,
        progress: &dyn Fn(usize, usize),
    ) -> Result<AlgorithmMetrics> {
        let experiment = self.get_experiment(&run.experiment_id)?;
        let config = &experiment.config;

        let sequence = self
            .loader_for(config)
            .load(&run.sequence)
            .with_context(|| format!("Failed to load sequence '{}'", run.sequence))?;
        let mut processor = self
            .factory
            .create(run, sequence.as_ref())
            .with_context(|| format!("Failed to build processor for {}", run))?;

        let store = self.ctx.store();
        store.save_run(run)?;

        let indices = config.frame_indices(sequence.len());
        let total = indices.len().saturating_sub(1);
        info!(run = %run, frames = total, "Run started");

        let mut acc = self.calculator.accumulator(run.clone());
        let mut batch: Vec<FrameResult> = Vec::with_capacity(self.batch_size);

        for (step, pair) in indices.windows(2).enumerate() {
            if cancel.is_cancelled() {
                if !batch.is_empty() {
                    store.append_frame_results(run, &batch)?;
                }
                info!(run = %run, processed = step, "Run cancelled");
                return Err(ExperimentError::Cancelled(run.storage_key()).into());
            }

            let a = sequence
                .frame(pair[0])
                .with_context(|| format!("Frame {} missing from '{}'", pair[0], run.sequence))?;
            let b = sequence
                .frame(pair[1])
                .with_context(|| format!("Frame {} missing from '{}'", pair[1], run.sequence))?;

            let start = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| processor.process_frame_pair(&a, &b)));
            let frame = match outcome {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => {
                    debug!(run = %run, frame = b.index, "Frame processing failed: {:#}", e);
                    processing_error(&b, format!("{:#}", e), start)
                }
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    warn!(run = %run, frame = b.index, "Frame processor panicked: {}", msg);
                    processing_error(&b, format!("panic: {}", msg), start)
                }
            };

            acc.push(&frame);
            batch.push(frame);
            if batch.len() >= self.batch_size {
                store.append_frame_results(run, &batch)?;
                batch.clear();
            }
            progress(step + 1, total);
        }
        if !batch.is_empty() {
            store.append_frame_results(run, &batch)?;
        }

        let metrics = self.calculator.finish(acc);
        store.save_algorithm_result(&metrics)?;
        info!(
            run = %run,
            success_rate = metrics.success_rate,
            ate_rmse = metrics.trajectory.as_ref().map(|t| t.ate.rmse),
            "Run finished"
        );
        self.ctx.events().publish(Event::new(
            EventType::RunCompleted,
            json!({
                "experiment_id": run.experiment_id,
                "algorithm_key": run.algorithm_key(),
                "storage_key": run.storage_key(),
                "run_index": run.run_index,
                "success_rate": metrics.success_rate,
                "total_frames": metrics.total_frames,
                "ate_rmse": metrics.trajectory.as_ref().map(|t| t.ate.rmse),
            }),
        ));
        Ok(metrics)
    }

    /// Run every run of an experiment, `parallel_jobs` at a time.
    ///
    /// Each run gets its own task linked to the experiment. A failed run
    /// never stops its siblings. `progress` receives (finished, total) runs.
    pub fn run_experiment(
        &self,
        experiment_id: &str,
        cancel: &CancellationToken,
        progress: &(dyn Fn(usize, usize) + Sync),
    ) -> Result<ExperimentOutcome> {
        let experiment = self.get_experiment(experiment_id)?;
        let registry = self.ctx.registry();
        let total = experiment.runs.len();

        let (work_tx, work_rx) = unbounded::<(usize, AlgorithmRun, String)>();
        for (idx, run) in experiment.runs.iter().enumerate() {
            let task = registry.create_task(format!("Run {}", run), Some(experiment_id));
            work_tx
                .send((idx, run.clone(), task.id))
                .context("run queue closed")?;
        }
        drop(work_tx);

        let workers = experiment.config.parallel_jobs.clamp(1, total.max(1));
        info!(experiment_id, runs = total, workers, "Experiment started");

        let finished = AtomicUsize::new(0);
        let (out_tx, out_rx) = unbounded::<(usize, RunOutcome)>();
        thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let out_tx = out_tx.clone();
                let finished = &finished;
                scope.spawn(move || {
                    while let Ok((idx, run, task_id)) = work_rx.recv() {
                        let outcome = self.execute_run(run, task_id, cancel);
                        let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                        progress(done, total);
                        if out_tx.send((idx, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(out_tx);

        let mut runs: Vec<(usize, RunOutcome)> = out_rx.iter().collect();
        runs.sort_by_key(|(idx, _)| *idx);
        let runs: Vec<RunOutcome> = runs.into_iter().map(|(_, r)| r).collect();

        let status = if total == 0 {
            // Nothing to run is trivially finished.
            ExperimentStatus::Completed
        } else {
            ExperimentStatus::from_task_statuses(runs.iter().map(|r| r.status))
        };
        let outcome = ExperimentOutcome {
            experiment_id: experiment_id.to_string(),
            status,
            runs,
        };
        info!(
            experiment_id,
            status = ?outcome.status,
            completed = outcome.count(TaskStatus::Completed),
            failed = outcome.count(TaskStatus::Failed),
            cancelled = outcome.count(TaskStatus::Cancelled),
            "Experiment finished"
        );
        self.ctx.events().publish(Event::new(
            EventType::ExperimentCompleted,
            json!({
                "experiment_id": experiment_id,
                "name": experiment.name,
                "status": outcome.status,
                "total_runs": total,
                "completed": outcome.count(TaskStatus::Completed),
                "failed": outcome.count(TaskStatus::Failed),
                "cancelled": outcome.count(TaskStatus::Cancelled),
            }),
        ));
        Ok(outcome)
    }

    /// Drive one run through its task lifecycle.
    fn execute_run(&self, run: AlgorithmRun, task_id: String, cancel: &CancellationToken) -> RunOutcome {
        let registry = self.ctx.registry();
        let outcome = |status: TaskStatus, metrics: Option<AlgorithmMetrics>, error: Option<String>| {
            RunOutcome {
                run: run.clone(),
                task_id: task_id.clone(),
                status,
                metrics,
                error,
            }
        };

        if cancel.is_cancelled() {
            registry.cancel_task(&task_id);
        }
        if let Err(e) = registry.start_task(&task_id) {
            debug!(task_id = %task_id, "Run not started: {}", e);
            let status = registry
                .get_task(&task_id)
                .map(|t| t.status)
                .unwrap_or(TaskStatus::Cancelled);
            return outcome(status, None, Some(e.to_string()));
        }
        let Some(token) = registry.cancellation_token(&task_id) else {
            return outcome(TaskStatus::Failed, None, Some("task disappeared".to_string()));
        };

        let report_every = |total: usize| (total / 100).max(1);
        let on_progress = |i: usize, total: usize| {
            if cancel.is_cancelled() {
                registry.cancel_task(&task_id);
                return;
            }
            if i == total || i % report_every(total) == 0 {
                let update = TaskUpdate::progress(i as f64 / total.max(1) as f64)
                    .with_message(format!("frame {}/{}", i, total))
                    .with_steps(i, total);
                if let Err(e) = registry.update_task(&task_id, update) {
                    debug!(task_id = %task_id, "Progress update ignored: {}", e);
                }
            }
        };

        let result = catch_unwind(AssertUnwindSafe(|| {
            self.run_algorithm(&run, &token, &on_progress)
        }));
        match result {
            Ok(Ok(metrics)) => {
                let summary = json!({
                    "storage_key": run.storage_key(),
                    "success_rate": metrics.success_rate,
                    "total_frames": metrics.total_frames,
                    "ate_rmse": metrics.trajectory.as_ref().map(|t| t.ate.rmse),
                });
                match registry.complete_task(&task_id, Some(summary)) {
                    Ok(_) => outcome(TaskStatus::Completed, Some(metrics), None),
                    Err(e) => {
                        // Cancelled while the last frames were processed.
                        let status = registry
                            .get_task(&task_id)
                            .map(|t| t.status)
                            .unwrap_or(TaskStatus::Cancelled);
                        outcome(status, Some(metrics), Some(e.to_string()))
                    }
                }
            }
            Ok(Err(e)) => {
                if let Some(ExperimentError::Cancelled(_)) = e.downcast_ref::<ExperimentError>() {
                    registry.cancel_task(&task_id);
                    return outcome(TaskStatus::Cancelled, None, Some(e.to_string()));
                }
                let msg = format!("{:#}", e);
                warn!(run = %run, "Run failed: {}", msg);
                registry.fail_task(&task_id, msg.clone()).ok();
                outcome(TaskStatus::Failed, None, Some(msg))
            }
            Err(panic) => {
                let msg = format!("panic: {}", panic_message(panic.as_ref()));
                warn!(run = %run, "Run panicked: {}", msg);
                registry.fail_task(&task_id, msg.clone()).ok();
                outcome(TaskStatus::Failed, None, Some(msg))
            }
        }
    }

    /// Queue `run_experiment` on the worker pool. Returns the job's task id.
    pub fn submit_experiment(self: &Arc<Self>, pool: &WorkerPool, experiment_id: &str) -> Result<String> {
        let experiment = self.get_experiment(experiment_id)?;
        let manager = Arc::clone(self);
        let id = experiment.id.clone();
        pool.submit(&format!("Experiment {}", experiment.name), None, move |job| {
            let outcome = manager.run_experiment(&id, job.cancellation_token(), &|done, total| {
                job.report_progress(
                    done as f64 / total.max(1) as f64,
                    format!("{}/{} runs finished", done, total),
                );
            })?;
            Ok(serde_json::to_value(&outcome)?)
        })
    }

    /// Aggregate status of the run tasks linked to an experiment.
    pub fn experiment_status(&self, experiment_id: &str) -> Option<ExperimentStatus> {
        let experiment = self.ctx.get_experiment(experiment_id)?;
        if experiment.runs.is_empty() {
            return Some(ExperimentStatus::Completed);
        }
        let tasks = self.ctx.registry().list_tasks(Some(experiment_id));
        Some(ExperimentStatus::from_task_statuses(tasks.iter().map(|t| t.status)))
    }
}

fn processing_error(frame: &crate::dataset::FrameRef, msg: String, start: Instant) -> FrameResult {
    FrameResult::failure(frame.index, frame.timestamp, FrameStatus::ProcessingError, msg)
        .with_poses(None, frame.ground_truth)
        .with_processing_time(start.elapsed().as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BenchmarkConfig;
    use crate::dataset::{FrameListSequence, FrameRef, Sequence};
    use crate::frontend::FrameProcessor;
    use crate::model::{EstimatorResult, EstimatorType, FeatureType};
    use anyhow::bail;
    use nalgebra::{Matrix3, Matrix4, Vector3};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn pose_at(i: usize) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m[(0, 3)] = i as f64 * 0.1;
        m
    }

    struct Loader {
        frames: usize,
    }

    impl SequenceLoader for Loader {
        fn load(&self, sequence: &str) -> Result<Box<dyn Sequence>> {
            if sequence == "missing" {
                bail!("no such sequence");
            }
            let frames = (0..self.frames)
                .map(|i| FrameRef {
                    index: i,
                    timestamp: i as f64 * 0.05,
                    image_path: format!("{}.png", i).into(),
                    ground_truth: Some(pose_at(i)),
                })
                .collect();
            Ok(Box::new(FrameListSequence::new(sequence, frames, Matrix3::identity())))
        }
    }

    /// Succeeds with the ground-truth motion, except for scripted frames.
    struct Scripted {
        fail_on: Option<usize>,
        panic_on: Option<usize>,
        delay: Duration,
    }

    impl FrameProcessor for Scripted {
        fn process_frame_pair(&mut self, _a: &FrameRef, b: &FrameRef) -> Result<FrameResult> {
            thread::sleep(self.delay);
            if Some(b.index) == self.fail_on {
                bail!("decode error");
            }
            if Some(b.index) == self.panic_on {
                panic!("scripted panic");
            }
            let est = EstimatorResult {
                inlier_mask: vec![true; 10],
                rotation: Matrix3::identity(),
                translation: Vector3::x(),
                iterations: 50,
                confidence: 0.99,
                estimation_time_ms: 1.0,
            };
            Ok(FrameResult::success(b.index, b.timestamp, est)
                .with_poses(b.ground_truth, b.ground_truth)
                .with_processing_time(2.0))
        }
    }

    struct Factory {
        fail_on: Option<usize>,
        panic_on: Option<usize>,
        delay: Duration,
        broken_feature: Option<FeatureType>,
    }

    impl Default for Factory {
        fn default() -> Self {
            Self {
                fail_on: None,
                panic_on: None,
                delay: Duration::ZERO,
                broken_feature: None,
            }
        }
    }

    impl ProcessorFactory for Factory {
        fn create(&self, run: &AlgorithmRun, _seq: &dyn Sequence) -> Result<Box<dyn FrameProcessor>> {
            if Some(run.feature_type) == self.broken_feature {
                bail!("extractor unavailable");
            }
            Ok(Box::new(Scripted {
                fail_on: self.fail_on,
                panic_on: self.panic_on,
                delay: self.delay,
            }))
        }
    }

    fn manager(factory: Factory, frames: usize) -> ExperimentManager {
        let ctx = Arc::new(BenchmarkContext::in_memory(BenchmarkConfig::default()));
        ExperimentManager::new(ctx, Arc::new(factory))
            .with_sequence_loader(Arc::new(Loader { frames }))
            .with_batch_size(4)
    }

    fn config(features: Vec<FeatureType>, parallel_jobs: usize) -> ExperimentConfig {
        let mut config = ExperimentConfig {
            feature_types: features,
            estimator_types: vec![EstimatorType::Ransac],
            parallel_jobs,
            ..Default::default()
        };
        config.dataset.sequences = vec!["seq".to_string()];
        config
    }

    #[test]
    fn test_run_algorithm_converts_frame_errors() {
        let mgr = manager(
            Factory {
                fail_on: Some(3),
                panic_on: Some(5),
                ..Default::default()
            },
            10,
        );
        let exp = mgr.create_experiment(config(vec![FeatureType::Orb], 1));
        let run = &exp.runs[0];
        let calls = Mutex::new(Vec::new());

        let metrics = mgr
            .run_algorithm(run, &CancellationToken::new(), &|i, n| calls.lock().push((i, n)))
            .unwrap();

        assert_eq!(metrics.total_frames, 9);
        assert_eq!(metrics.failed_frames, 2);
        assert_eq!(metrics.failure_reasons.get("PROCESSING_ERROR"), Some(&2));
        assert!(metrics.trajectory.is_some());
        assert_eq!(calls.lock().len(), 9);
        assert_eq!(calls.lock().last(), Some(&(9, 9)));

        let store = mgr.context().store();
        let (frames, total) = store
            .get_frame_results(&exp.id, &run.storage_key(), 0, 100)
            .unwrap();
        assert_eq!(total, 9);
        assert!(frames[4].error.as_deref().unwrap().contains("scripted panic"));
        let saved = store
            .get_algorithm_result(&exp.id, &run.storage_key())
            .unwrap()
            .unwrap();
        assert_eq!(saved, metrics);
    }

    #[test]
    fn test_run_algorithm_stops_when_cancelled() {
        let mgr = manager(Factory::default(), 10);
        let exp = mgr.create_experiment(config(vec![FeatureType::Orb], 1));
        let token = CancellationToken::new();
        let err = mgr
            .run_algorithm(&exp.runs[0], &token, &|i, _| {
                if i == 3 {
                    token.cancel();
                }
            })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExperimentError>(),
            Some(ExperimentError::Cancelled(_))
        ));
        let (_, stored) = mgr
            .context()
            .store()
            .get_frame_results(&exp.id, &exp.runs[0].storage_key(), 0, 100)
            .unwrap();
        assert_eq!(stored, 3);
    }

    #[test]
    fn test_run_experiment_isolates_failed_runs() {
        let mgr = manager(
            Factory {
                broken_feature: Some(FeatureType::Sift),
                ..Default::default()
            },
            6,
        );
        let exp = mgr.create_experiment(config(vec![FeatureType::Orb, FeatureType::Sift], 2));
        let sub = mgr.context().events().subscribe();
        let finished = Mutex::new(Vec::new());

        let outcome = mgr
            .run_experiment(&exp.id, &CancellationToken::new(), &|d, t| finished.lock().push((d, t)))
            .unwrap();

        assert_eq!(outcome.status, ExperimentStatus::Completed);
        assert_eq!(outcome.runs[0].status, TaskStatus::Completed);
        assert_eq!(outcome.runs[1].status, TaskStatus::Failed);
        assert!(outcome.runs[1].error.as_deref().unwrap().contains("extractor unavailable"));
        let mut seen = finished.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![(1, 2), (2, 2)]);

        let tasks = mgr.context().registry().list_tasks(Some(&exp.id));
        assert_eq!(tasks.len(), 2);
        assert_eq!(mgr.experiment_status(&exp.id), Some(ExperimentStatus::Completed));

        let events = sub.drain();
        assert!(events.iter().any(|e| e.event_type == EventType::RunCompleted));
        assert_eq!(events.last().unwrap().event_type, EventType::ExperimentCompleted);
    }

    #[test]
    fn test_empty_grid_completes_immediately() {
        let mgr = manager(Factory::default(), 4);
        let exp = mgr.create_experiment(config(Vec::new(), 2));
        assert!(exp.runs.is_empty());
        let sub = mgr.context().events().subscribe();

        let outcome = mgr
            .run_experiment(&exp.id, &CancellationToken::new(), &|_, _| {})
            .unwrap();

        assert_eq!(outcome.status, ExperimentStatus::Completed);
        assert!(outcome.runs.is_empty());
        assert_eq!(mgr.experiment_status(&exp.id), Some(ExperimentStatus::Completed));
        let done = sub.drain().pop().unwrap();
        assert_eq!(done.event_type, EventType::ExperimentCompleted);
        assert_eq!(done.data["status"], "COMPLETED");
        assert_eq!(done.data["total_runs"], 0);
    }

    #[test]
    fn test_all_runs_failing_is_failed() {
        let mgr = manager(
            Factory {
                broken_feature: Some(FeatureType::Orb),
                ..Default::default()
            },
            4,
        );
        let exp = mgr.create_experiment(config(vec![FeatureType::Orb], 1));
        let outcome = mgr
            .run_experiment(&exp.id, &CancellationToken::new(), &|_, _| {})
            .unwrap();
        assert_eq!(outcome.status, ExperimentStatus::Failed);
        let task = mgr.context().registry().get_task(&outcome.runs[0].task_id).unwrap();
        assert!(task.error_details.is_some());
    }

    #[test]
    fn test_cancelled_experiment_is_partial() {
        let mgr = manager(Factory::default(), 4);
        let mut cfg = config(vec![FeatureType::Orb], 1);
        cfg.num_runs = 3;
        let exp = mgr.create_experiment(cfg);
        let cancel = CancellationToken::new();
        let outcome = mgr
            .run_experiment(&exp.id, &cancel, &|done, _| {
                if done == 1 {
                    cancel.cancel();
                }
            })
            .unwrap();
        assert_eq!(outcome.runs[0].status, TaskStatus::Completed);
        assert_eq!(outcome.runs[1].status, TaskStatus::Cancelled);
        assert_eq!(outcome.runs[2].status, TaskStatus::Cancelled);
        assert_eq!(outcome.status, ExperimentStatus::Partial);
    }

    #[test]
    fn test_submit_experiment_on_pool() {
        let mgr = Arc::new(manager(Factory::default(), 5));
        let exp = mgr.create_experiment(config(vec![FeatureType::Orb, FeatureType::Akaze], 2));
        let pool = WorkerPool::new(1, Arc::clone(mgr.context().registry())).unwrap();

        assert_eq!(mgr.experiment_status(&exp.id), Some(ExperimentStatus::Pending));
        let task_id = mgr.submit_experiment(&pool, &exp.id).unwrap();
        let result = pool.results().recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(result.task_id, task_id);
        assert_eq!(result.status, TaskStatus::Completed);

        let outcome: ExperimentOutcome = serde_json::from_value(result.result.unwrap()).unwrap();
        assert_eq!(outcome.status, ExperimentStatus::Completed);
        assert_eq!(outcome.runs.len(), 2);
        let task = mgr.context().registry().get_task(&task_id).unwrap();
        assert_eq!(task.progress, 1.0);

        assert!(mgr.submit_experiment(&pool, "nope").is_err());
        assert_eq!(mgr.experiment_status("nope"), None);
    }

    #[test]
    fn test_missing_sequence_fails_run() {
        let mgr = manager(Factory::default(), 4);
        let mut cfg = config(vec![FeatureType::Orb], 1);
        cfg.dataset.sequences = vec!["missing".to_string()];
        let exp = mgr.create_experiment(cfg);
        let err = mgr
            .run_algorithm(&exp.runs[0], &CancellationToken::new(), &|_, _| {})
            .unwrap_err();
        assert!(format!("{:#}", err).contains("no such sequence"));
    }
}
