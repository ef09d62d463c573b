//! Fixed pool of worker threads executing registry-tracked jobs.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::registry::{CancellationToken, TaskRegistry, TaskStatus, TaskUpdate};

/// Default receive timeout so idle workers notice the stop flag.
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle a running job uses to report progress and poll for cancellation.
pub struct JobContext {
    task_id: String,
    cancel: CancellationToken,
    registry: Arc<TaskRegistry>,
}

impl JobContext {
    pub fn new(task_id: String, cancel: CancellationToken, registry: Arc<TaskRegistry>) -> Self {
        Self {
            task_id,
            cancel,
            registry,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Best-effort progress report; rejected updates are only logged.
    pub fn report_progress(&self, progress: f64, message: impl Into<String>) {
        let update = TaskUpdate::progress(progress.clamp(0.0, 1.0)).with_message(message);
        if let Err(e) = self.registry.update_task(&self.task_id, update) {
            debug!(task_id = %self.task_id, "Progress update ignored: {}", e);
        }
    }

    pub fn log(&self, line: impl Into<String>) {
        if let Err(e) = self.registry.update_task(&self.task_id, TaskUpdate::log(line)) {
            debug!(task_id = %self.task_id, "Log line dropped: {}", e);
        }
    }
}

pub type Job = Box<dyn FnOnce(&JobContext) -> Result<Value> + Send + 'static>;

/// Outcome of one job, always emitted on the results channel.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

enum WorkItem {
    Job { task_id: String, job: Job },
    Shutdown,
}

pub struct WorkerPool {
    registry: Arc<TaskRegistry>,
    sender: Sender<WorkItem>,
    results: Receiver<JobResult>,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(num_workers: usize, registry: Arc<TaskRegistry>) -> Result<Self> {
        Self::with_timeout(num_workers, registry, DEFAULT_QUEUE_TIMEOUT)
    }

    pub fn with_timeout(
        num_workers: usize,
        registry: Arc<TaskRegistry>,
        queue_timeout: Duration,
    ) -> Result<Self> {
        let (sender, receiver) = unbounded::<WorkItem>();
        let (result_tx, results) = unbounded::<JobResult>();
        let running = Arc::new(AtomicBool::new(true));

        let mut handles = Vec::with_capacity(num_workers.max(1));
        for idx in 0..num_workers.max(1) {
            let receiver = receiver.clone();
            let result_tx = result_tx.clone();
            let registry = Arc::clone(&registry);
            let running = Arc::clone(&running);
            let handle = thread::Builder::new()
                .name(format!("worker-{}", idx))
                .spawn(move || {
                    worker_loop(idx, receiver, result_tx, registry, running, queue_timeout)
                })
                .context("Failed to spawn worker thread")?;
            handles.push(handle);
        }
        info!(workers = handles.len(), "Worker pool started");

        Ok(Self {
            registry,
            sender,
            results,
            running,
            handles: Mutex::new(handles),
        })
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Create a task for `job` and queue it. Returns the task id.
    pub fn submit<F>(&self, description: &str, experiment_id: Option<&str>, job: F) -> Result<String>
    where
        F: FnOnce(&JobContext) -> Result<Value> + Send + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            bail!("worker pool is shut down");
        }
        let task = self.registry.create_task(description, experiment_id);
        if let Err(e) = self.submit_existing(&task.id, job) {
            // Shut down between the check and the enqueue.
            self.registry.fail_task(&task.id, format!("{:#}", e)).ok();
            return Err(e);
        }
        Ok(task.id)
    }

    /// Queue a job for a task that already exists in the registry.
    pub fn submit_existing<F>(&self, task_id: &str, job: F) -> Result<()>
    where
        F: FnOnce(&JobContext) -> Result<Value> + Send + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            bail!("worker pool is shut down");
        }
        self.sender
            .send(WorkItem::Job {
                task_id: task_id.to_string(),
                job: Box::new(job),
            })
            .map_err(|_| anyhow!("worker queue closed"))
    }

    pub fn results(&self) -> &Receiver<JobResult> {
        &self.results
    }

    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Stop all workers after their current job and wait for them.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.handles.lock();
        for _ in 0..handles.len() {
            self.sender.send(WorkItem::Shutdown).ok();
        }
        for handle in handles.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread panicked during shutdown");
            }
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    idx: usize,
    receiver: Receiver<WorkItem>,
    results: Sender<JobResult>,
    registry: Arc<TaskRegistry>,
    running: Arc<AtomicBool>,
    queue_timeout: Duration,
) {
    debug!(worker = idx, "Worker started");
    loop {
        match receiver.recv_timeout(queue_timeout) {
            Ok(WorkItem::Job { task_id, job }) => {
                let outcome = run_job(&task_id, job, &registry);
                if results.send(outcome).is_err() {
                    debug!(worker = idx, "Result receiver dropped");
                }
            }
            Ok(WorkItem::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(worker = idx, "Worker stopped");
}

fn run_job(task_id: &str, job: Job, registry: &Arc<TaskRegistry>) -> JobResult {
    let Some(cancel) = registry.cancellation_token(task_id) else {
        return JobResult {
            task_id: task_id.to_string(),
            status: TaskStatus::Failed,
            result: None,
            error: Some("task not found".to_string()),
        };
    };

    if let Err(e) = registry.start_task(task_id) {
        // Cancelled while queued.
        let status = registry
            .get_task(task_id)
            .map(|t| t.status)
            .unwrap_or(TaskStatus::Failed);
        debug!(task_id, "Skipping job: {}", e);
        return JobResult {
            task_id: task_id.to_string(),
            status,
            result: None,
            error: Some(e.to_string()),
        };
    }

    let ctx = JobContext::new(task_id.to_string(), cancel.clone(), Arc::clone(registry));
    let outcome = catch_unwind(AssertUnwindSafe(|| job(&ctx)));

    let (status, result, error) = match outcome {
        _ if cancel.is_cancelled() => (TaskStatus::Cancelled, None, None),
        Ok(Ok(value)) => {
            if let Err(e) = registry.complete_task(task_id, Some(value.clone())) {
                warn!(task_id, "Could not mark task completed: {}", e);
            }
            (TaskStatus::Completed, Some(value), None)
        }
        Ok(Err(e)) => {
            let msg = format!("{:#}", e);
            error!(task_id, "Job failed: {}", msg);
            registry.fail_task(task_id, msg.clone()).ok();
            (TaskStatus::Failed, None, Some(msg))
        }
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            error!(task_id, "Job panicked: {}", msg);
            registry.fail_task(task_id, format!("panic: {}", msg)).ok();
            (TaskStatus::Failed, None, Some(msg))
        }
    };

    if status == TaskStatus::Cancelled {
        // A job may have finished its work before noticing the flag.
        registry.cancel_task(task_id);
    }

    JobResult {
        task_id: task_id.to_string(),
        status,
        result,
        error,
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool(workers: usize) -> WorkerPool {
        WorkerPool::with_timeout(
            workers,
            Arc::new(TaskRegistry::default()),
            Duration::from_millis(50),
        )
        .unwrap()
    }

    fn next_result(pool: &WorkerPool) -> JobResult {
        pool.results().recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_job_completes_with_result() {
        let pool = pool(2);
        let id = pool
            .submit("sum", None, |ctx| {
                ctx.report_progress(0.5, "halfway");
                Ok(json!({"sum": 3}))
            })
            .unwrap();
        let res = next_result(&pool);
        assert_eq!(res.task_id, id);
        assert_eq!(res.status, TaskStatus::Completed);
        assert_eq!(res.result, Some(json!({"sum": 3})));

        let task = pool.registry().get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!({"sum": 3})));
    }

    #[test]
    fn test_survives_panicking_and_failing_jobs() {
        let pool = pool(1);
        let panicking = pool
            .submit("boom", None, |_| -> Result<Value> { panic!("kaboom") })
            .unwrap();
        let failing = pool
            .submit("fail", None, |_| anyhow::bail!("dataset missing"))
            .unwrap();
        let ok = pool.submit("ok", None, |_| Ok(Value::Null)).unwrap();

        let mut results: Vec<JobResult> = (0..3).map(|_| next_result(&pool)).collect();
        results.sort_by_key(|r| {
            [&panicking, &failing, &ok]
                .iter()
                .position(|id| **id == r.task_id)
        });
        assert_eq!(results[0].status, TaskStatus::Failed);
        assert!(results[0].error.as_deref().unwrap().contains("kaboom"));
        assert_eq!(results[1].status, TaskStatus::Failed);
        assert!(results[1].error.as_deref().unwrap().contains("dataset missing"));
        assert_eq!(results[2].status, TaskStatus::Completed);

        let task = pool.registry().get_task(&failing).unwrap();
        assert_eq!(task.error_details.as_deref(), Some("dataset missing"));
    }

    #[test]
    fn test_cancelled_job_reports_cancelled() {
        let pool = pool(1);
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let id = pool
            .submit("long", None, move |ctx| {
                started_tx.send(()).ok();
                while !ctx.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(Value::Null)
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(pool.registry().cancel_task(&id));

        let res = next_result(&pool);
        assert_eq!(res.status, TaskStatus::Cancelled);
        assert_eq!(
            pool.registry().get_task(&id).unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn test_shutdown_rejects_new_jobs() {
        let pool = pool(2);
        pool.shutdown();
        assert!(pool.submit("late", None, |_| Ok(Value::Null)).is_err());
        assert!(pool.registry().list_tasks(None).is_empty());
    }
}
