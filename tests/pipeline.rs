//! End-to-end: experiment grid on a synthetic sequence, executed through the
//! worker pool, persisted to a JSON store and recomputed from disk.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use nalgebra::{Matrix3, Matrix4, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vslam_bench::config::BenchmarkConfig;
use vslam_bench::context::BenchmarkContext;
use vslam_bench::dataset::{FrameListSequence, FrameRef, Sequence, SequenceLoader};
use vslam_bench::events::{Event, EventStream, EventType, LocalEventBus, StreamFrame};
use vslam_bench::experiment::recompute::recompute_run;
use vslam_bench::experiment::{ExperimentManager, ExperimentOutcome, ExperimentStatus};
use vslam_bench::frontend::{FrameProcessor, ProcessorFactory};
use vslam_bench::model::{
    AlgorithmRun, EstimatorResult, EstimatorType, FeatureSummary, FeatureType, FrameResult,
    FrameStatus, MatchSummary,
};
use vslam_bench::storage::{JsonStore, ResultStore};
use vslam_bench::tasks::{TaskStatus, WorkerPool};

const FRAMES: usize = 40;

fn circle_pose(i: usize) -> Matrix4<f64> {
    let theta = i as f64 * 0.05;
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 1>(0, 3)
        .copy_from(&Vector3::new(theta.cos() * 2.0, theta.sin() * 2.0, 0.1 * theta));
    m
}

struct SyntheticLoader;

impl SequenceLoader for SyntheticLoader {
    fn load(&self, sequence: &str) -> Result<Box<dyn Sequence>> {
        let frames = (0..FRAMES)
            .map(|i| FrameRef {
                index: i,
                timestamp: i as f64 / 20.0,
                image_path: format!("{}/{:04}.png", sequence, i).into(),
                ground_truth: Some(circle_pose(i)),
            })
            .collect();
        Ok(Box::new(FrameListSequence::new(
            sequence,
            frames,
            Matrix3::new(458.0, 0.0, 367.0, 0.0, 457.0, 248.0, 0.0, 0.0, 1.0),
        )))
    }
}

/// Noisy odometry with scripted failures.
struct NoisyProcessor {
    rng: StdRng,
    delay: Duration,
}

impl FrameProcessor for NoisyProcessor {
    fn process_frame_pair(&mut self, _a: &FrameRef, b: &FrameRef) -> Result<FrameResult> {
        thread::sleep(self.delay);
        if b.index % 11 == 0 {
            bail!("corrupt image {:?}", b.image_path);
        }
        let keypoints = self.rng.gen_range(300..900);
        let features = FeatureSummary {
            num_keypoints_a: keypoints,
            num_keypoints_b: keypoints + self.rng.gen_range(0..50),
            extraction_time_ms: self.rng.gen_range(2.0..6.0),
        };
        if b.index % 7 == 0 {
            return Ok(FrameResult::failure(
                b.index,
                b.timestamp,
                FrameStatus::InsufficientMatches,
                "3 matches, need 8",
            )
            .with_features(features)
            .with_poses(None, b.ground_truth)
            .with_processing_time(self.rng.gen_range(5.0..10.0)));
        }

        let matches = self.rng.gen_range(60..200);
        let inliers = self.rng.gen_range(20..matches);
        let mut inlier_mask = vec![false; matches];
        inlier_mask[..inliers].iter_mut().for_each(|m| *m = true);
        let estimator = EstimatorResult {
            inlier_mask,
            rotation: Matrix3::identity(),
            translation: Vector3::x(),
            iterations: self.rng.gen_range(30..400),
            confidence: self.rng.gen_range(0.3..1.0),
            estimation_time_ms: self.rng.gen_range(0.5..3.0),
        };

        let gt = b.ground_truth.unwrap_or_else(Matrix4::identity);
        let mut est = gt;
        for r in 0..3 {
            est[(r, 3)] += self.rng.gen_range(-0.02..0.02);
        }
        Ok(FrameResult::success(b.index, b.timestamp, estimator)
            .with_features(features)
            .with_matches(MatchSummary {
                num_matches: matches,
                mean_distance: self.rng.gen_range(20.0..60.0),
                matching_time_ms: self.rng.gen_range(1.0..4.0),
            })
            .with_poses(Some(est), b.ground_truth)
            .with_processing_time(self.rng.gen_range(10.0..30.0)))
    }
}

struct NoisyFactory {
    delay: Duration,
}

impl ProcessorFactory for NoisyFactory {
    fn create(&self, run: &AlgorithmRun, _sequence: &dyn Sequence) -> Result<Box<dyn FrameProcessor>> {
        let seed = run.run_index as u64 * 31 + run.feature_type as u64 * 7 + run.estimator_type as u64;
        Ok(Box::new(NoisyProcessor {
            rng: StdRng::seed_from_u64(seed),
            delay: self.delay,
        }))
    }
}

fn setup(store: Arc<dyn ResultStore>, delay: Duration) -> (Arc<BenchmarkContext>, Arc<ExperimentManager>) {
    let mut config = BenchmarkConfig::default();
    let exp = &mut config.experiment;
    exp.name = "synthetic-grid".to_string();
    exp.feature_types = vec![FeatureType::Orb, FeatureType::Sift];
    exp.estimator_types = vec![EstimatorType::Ransac, EstimatorType::Magsac];
    exp.dataset.sequences = vec!["synthetic".to_string()];
    exp.num_runs = 2;
    exp.parallel_jobs = 3;
    exp.max_frames = Some(30);

    let bus = Arc::new(LocalEventBus::new(4096));
    let ctx = Arc::new(BenchmarkContext::new(config, bus, store));
    let manager = ExperimentManager::new(Arc::clone(&ctx), Arc::new(NoisyFactory { delay }))
        .with_sequence_loader(Arc::new(SyntheticLoader))
        .with_batch_size(8);
    (ctx, Arc::new(manager))
}

#[test]
fn experiment_end_to_end_and_recompute_matches_live() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonStore::open(dir.path()).unwrap());
    let (ctx, manager) = setup(store.clone(), Duration::ZERO);
    let mut stream = EventStream::new(Arc::clone(ctx.events()), Duration::from_millis(50));

    let experiment = manager.create_experiment(ctx.config().experiment.clone());
    assert_eq!(experiment.runs.len(), 8);

    let pool = WorkerPool::new(2, Arc::clone(ctx.registry())).unwrap();
    let task_id = manager.submit_experiment(&pool, &experiment.id).unwrap();
    let result = pool.results().recv_timeout(Duration::from_secs(60)).unwrap();
    assert_eq!(result.task_id, task_id);
    assert_eq!(result.status, TaskStatus::Completed, "{:?}", result.error);

    let outcome: ExperimentOutcome = serde_json::from_value(result.result.unwrap()).unwrap();
    assert_eq!(outcome.status, ExperimentStatus::Completed);
    assert_eq!(outcome.count(TaskStatus::Completed), 8);
    assert_eq!(manager.experiment_status(&experiment.id), Some(ExperimentStatus::Completed));

    for run_outcome in &outcome.runs {
        let run = &run_outcome.run;
        let live = store
            .get_algorithm_result(&experiment.id, &run.storage_key())
            .unwrap()
            .unwrap();
        assert_eq!(run_outcome.metrics.as_ref(), Some(&live));
        assert_eq!(live.total_frames, 29);
        assert_eq!(live.total_frames, live.successful_frames + live.failed_frames);
        assert_eq!(live.failure_reasons.get("PROCESSING_ERROR"), Some(&2));
        assert_eq!(live.failure_reasons.get("INSUFFICIENT_MATCHES"), Some(&4));
        let trajectory = live.trajectory.as_ref().unwrap();
        assert!(trajectory.ate.rmse < 0.05);
        assert!(trajectory.trajectory_length > 0.0);

        let recomputed = recompute_run(store.as_ref(), manager.calculator(), run, 7).unwrap();
        assert_eq!(recomputed, live);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut run_completed = 0;
    let mut experiment_completed = false;
    while !experiment_completed && Instant::now() < deadline {
        match stream.next() {
            Some(StreamFrame::Data(json)) => {
                let event = Event::from_slice(json.as_bytes()).unwrap();
                match event.event_type {
                    EventType::RunCompleted => run_completed += 1,
                    EventType::ExperimentCompleted => experiment_completed = true,
                    _ => {}
                }
            }
            Some(StreamFrame::Heartbeat) => {}
            None => break,
        }
    }
    assert!(experiment_completed);
    assert_eq!(run_completed, 8);
}

#[test]
fn cancelling_submitted_experiment_leaves_it_partial() {
    let store = Arc::new(vslam_bench::storage::MemoryStore::new());
    let (ctx, manager) = setup(store, Duration::from_millis(5));
    let mut config = ctx.config().experiment.clone();
    config.parallel_jobs = 1;
    let experiment = manager.create_experiment(config);

    let pool = WorkerPool::new(1, Arc::clone(ctx.registry())).unwrap();
    let task_id = manager.submit_experiment(&pool, &experiment.id).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        let running = ctx
            .registry()
            .list_tasks(Some(&experiment.id))
            .iter()
            .any(|t| t.status == TaskStatus::Running);
        if running {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(ctx.registry().cancel_task(&task_id));

    let result = pool.results().recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(result.status, TaskStatus::Cancelled);

    let tasks = ctx.registry().list_tasks(Some(&experiment.id));
    assert_eq!(tasks.len(), 8);
    assert!(tasks.iter().all(|t| t.status.is_terminal()));
    assert!(tasks.iter().any(|t| t.status == TaskStatus::Cancelled));
    assert_eq!(manager.experiment_status(&experiment.id), Some(ExperimentStatus::Partial));
    assert!(!ctx.registry().cancel_task(&task_id));
}
