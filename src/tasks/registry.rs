//! Task table and lifecycle state machine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::events::{Event, EventBus, EventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Legal moves of the state machine. Staying put is allowed for
    /// non-terminal states so progress updates can restate the status.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Pending | Running | Cancelled | Failed) => true,
            (Running, Running | Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TaskError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("task {id} is {status} and can no longer change")]
    Terminal { id: String, status: TaskStatus },
    #[error("invalid task transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("progress {0} outside [0, 1]")]
    InvalidProgress(f64),
    #[error("progress may not decrease ({current} -> {requested})")]
    ProgressRegression { current: f64, requested: f64 },
}

/// Cooperative cancellation flag shared between the registry and a job.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub message: String,
    pub current_step: Option<usize>,
    pub total_steps: Option<usize>,
    pub experiment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_details: Option<String>,
    pub result: Option<serde_json::Value>,
    pub logs: Vec<String>,
}

/// Partial update applied by [`TaskRegistry::update_task`].
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub current_step: Option<usize>,
    pub total_steps: Option<usize>,
    pub error_details: Option<String>,
    pub result: Option<serde_json::Value>,
    pub log: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn log(line: impl Into<String>) -> Self {
        Self {
            log: Some(line.into()),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_steps(mut self, current: usize, total: usize) -> Self {
        self.current_step = Some(current);
        self.total_steps = Some(total);
        self
    }

    fn is_log_only(&self) -> bool {
        self.status.is_none()
            && self.progress.is_none()
            && self.message.is_none()
            && self.current_step.is_none()
            && self.total_steps.is_none()
            && self.error_details.is_none()
            && self.result.is_none()
    }
}

struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
}

/// Thread-safe task table. Events are published after the table lock is
/// released.
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    events: Option<Arc<dyn EventBus>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TaskRegistry {
    pub fn new(events: Option<Arc<dyn EventBus>>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn create_task(&self, description: impl Into<String>, experiment_id: Option<&str>) -> Task {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            message: String::new(),
            current_step: None,
            total_steps: None,
            experiment_id: experiment_id.map(str::to_string),
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_details: None,
            result: None,
            logs: Vec::new(),
        };
        debug!(task_id = %task.id, description = %task.description, "Task created");
        self.tasks.lock().insert(
            task.id.clone(),
            TaskEntry {
                task: task.clone(),
                cancel: CancellationToken::new(),
            },
        );
        task
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().get(task_id).map(|e| e.task.clone())
    }

    /// Tasks ordered by creation time, optionally limited to one experiment.
    pub fn list_tasks(&self, experiment_id: Option<&str>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|e| experiment_id.is_none() || e.task.experiment_id.as_deref() == experiment_id)
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn cancellation_token(&self, task_id: &str) -> Option<CancellationToken> {
        self.tasks.lock().get(task_id).map(|e| e.cancel.clone())
    }

    pub fn update_task(&self, task_id: &str, update: TaskUpdate) -> Result<Task, TaskError> {
        let (snapshot, event) = {
            let mut tasks = self.tasks.lock();
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
            let task = &mut entry.task;

            if task.status.is_terminal() {
                if update.is_log_only() {
                    if let Some(line) = update.log {
                        task.logs.push(line);
                    }
                    return Ok(task.clone());
                }
                return Err(TaskError::Terminal {
                    id: task_id.to_string(),
                    status: task.status,
                });
            }

            if let Some(p) = update.progress {
                if !(0.0..=1.0).contains(&p) {
                    return Err(TaskError::InvalidProgress(p));
                }
                if p < task.progress {
                    return Err(TaskError::ProgressRegression {
                        current: task.progress,
                        requested: p,
                    });
                }
            }
            if let Some(next) = update.status {
                if !task.status.can_transition_to(next) {
                    return Err(TaskError::InvalidTransition {
                        from: task.status,
                        to: next,
                    });
                }
            }

            let previous = task.status;
            let now = Utc::now();
            if let Some(p) = update.progress {
                task.progress = p;
            }
            if let Some(m) = update.message {
                task.message = m;
            }
            if update.current_step.is_some() {
                task.current_step = update.current_step;
            }
            if update.total_steps.is_some() {
                task.total_steps = update.total_steps;
            }
            if update.error_details.is_some() {
                task.error_details = update.error_details;
            }
            if update.result.is_some() {
                task.result = update.result;
            }
            if let Some(line) = update.log {
                task.logs.push(line);
            }
            if let Some(next) = update.status {
                task.status = next;
                if next == TaskStatus::Completed {
                    task.progress = 1.0;
                }
                if next.is_terminal() {
                    task.completed_at = Some(now);
                    if next == TaskStatus::Cancelled {
                        entry.cancel.cancel();
                    }
                }
            }
            task.updated_at = now;

            let event_type = match task.status {
                TaskStatus::Completed if previous != TaskStatus::Completed => {
                    EventType::TaskCompleted
                }
                TaskStatus::Failed => EventType::TaskFailed,
                TaskStatus::Cancelled => EventType::TaskCancelled,
                _ => EventType::TaskProgress,
            };
            (task.clone(), Event::new(event_type, task_event_data(task)))
        };

        if snapshot.status.is_terminal() {
            info!(task_id, status = %snapshot.status, "Task finished");
        }
        self.publish(event);
        Ok(snapshot)
    }

    pub fn start_task(&self, task_id: &str) -> Result<Task, TaskError> {
        self.update_task(task_id, TaskUpdate::status(TaskStatus::Running))
    }

    pub fn complete_task(
        &self,
        task_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Task, TaskError> {
        self.update_task(
            task_id,
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                result,
                ..Default::default()
            },
        )
    }

    pub fn fail_task(&self, task_id: &str, error: impl Into<String>) -> Result<Task, TaskError> {
        let error = error.into();
        self.update_task(
            task_id,
            TaskUpdate {
                status: Some(TaskStatus::Failed),
                message: Some(error.clone()),
                error_details: Some(error),
                ..Default::default()
            },
        )
    }

    /// Request cancellation. Returns `false` for unknown or already
    /// finished tasks, which are left untouched.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let event = {
            let mut tasks = self.tasks.lock();
            let Some(entry) = tasks.get_mut(task_id) else {
                return false;
            };
            if entry.task.status.is_terminal() {
                return false;
            }
            entry.cancel.cancel();
            let now = Utc::now();
            entry.task.status = TaskStatus::Cancelled;
            entry.task.message = "Cancelled".to_string();
            entry.task.updated_at = now;
            entry.task.completed_at = Some(now);
            Event::new(EventType::TaskCancelled, task_event_data(&entry.task))
        };
        info!(task_id, "Task cancelled");
        self.publish(event);
        true
    }

    /// Drop terminal tasks that finished more than `max_age` ago.
    pub fn prune_terminal(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, e| match e.task.completed_at {
            Some(done) if e.task.status.is_terminal() => done > cutoff,
            _ => true,
        });
        let removed = before - tasks.len();
        if removed > 0 {
            debug!(removed, "Pruned terminal tasks");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

fn task_event_data(task: &Task) -> serde_json::Value {
    json!({
        "task_id": task.id,
        "experiment_id": task.experiment_id,
        "status": task.status,
        "progress": task.progress,
        "message": task.message,
        "current_step": task.current_step,
        "total_steps": task.total_steps,
        "error": task.error_details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LocalEventBus;

    fn registry_with_bus() -> (TaskRegistry, Arc<LocalEventBus>) {
        let bus = Arc::new(LocalEventBus::default());
        let registry = TaskRegistry::new(Some(bus.clone() as Arc<dyn EventBus>));
        (registry, bus)
    }

    #[test]
    fn test_lifecycle_publishes_events() {
        let (registry, bus) = registry_with_bus();
        let sub = bus.subscribe();
        let task = registry.create_task("run", Some("exp-1"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0.0);

        registry.start_task(&task.id).unwrap();
        registry
            .update_task(&task.id, TaskUpdate::progress(0.4).with_steps(4, 10))
            .unwrap();
        let done = registry.complete_task(&task.id, Some(json!({"ok": true}))).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 1.0);
        assert!(done.completed_at.is_some());

        let types: Vec<_> = sub.drain().into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::TaskProgress,
                EventType::TaskProgress,
                EventType::TaskCompleted
            ]
        );
    }

    #[test]
    fn test_progress_validation() {
        let registry = TaskRegistry::default();
        let id = registry.create_task("t", None).id;
        registry.start_task(&id).unwrap();
        assert_eq!(
            registry.update_task(&id, TaskUpdate::progress(1.5)),
            Err(TaskError::InvalidProgress(1.5))
        );
        registry.update_task(&id, TaskUpdate::progress(0.6)).unwrap();
        assert!(matches!(
            registry.update_task(&id, TaskUpdate::progress(0.5)),
            Err(TaskError::ProgressRegression { .. })
        ));
        assert!(matches!(
            registry.update_task(&id, TaskUpdate::progress(f64::NAN)),
            Err(TaskError::InvalidProgress(_))
        ));
    }

    #[test]
    fn test_cancel_semantics() {
        let registry = TaskRegistry::default();
        let done = registry.create_task("done", None).id;
        registry.start_task(&done).unwrap();
        registry.complete_task(&done, None).unwrap();
        assert!(!registry.cancel_task(&done));
        assert_eq!(registry.get_task(&done).unwrap().status, TaskStatus::Completed);

        let pending = registry.create_task("pending", None).id;
        let token = registry.cancellation_token(&pending).unwrap();
        assert!(registry.cancel_task(&pending));
        assert!(token.is_cancelled());
        assert!(!registry.cancel_task(&pending));
        assert!(!registry.cancel_task("missing"));
    }

    #[test]
    fn test_terminal_rejects_updates_but_accepts_logs() {
        let registry = TaskRegistry::default();
        let id = registry.create_task("t", None).id;
        assert!(registry.cancel_task(&id));

        assert!(matches!(
            registry.update_task(&id, TaskUpdate::progress(0.9)),
            Err(TaskError::Terminal { .. })
        ));
        assert!(matches!(
            registry.update_task(&id, TaskUpdate::status(TaskStatus::Running)),
            Err(TaskError::Terminal { .. })
        ));
        let task = registry.update_task(&id, TaskUpdate::log("late line")).unwrap();
        assert_eq!(task.logs, vec!["late line".to_string()]);
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_invalid_transition() {
        let registry = TaskRegistry::default();
        let id = registry.create_task("t", None).id;
        assert_eq!(
            registry.update_task(&id, TaskUpdate::status(TaskStatus::Completed)),
            Err(TaskError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed
            })
        );
        assert!(registry.fail_task(&id, "could not load").is_ok());
    }

    #[test]
    fn test_list_and_prune() {
        let registry = TaskRegistry::default();
        let a = registry.create_task("a", Some("e1")).id;
        registry.create_task("b", Some("e2"));
        registry.create_task("c", None);
        assert_eq!(registry.list_tasks(Some("e1")).len(), 1);
        assert_eq!(registry.list_tasks(None).len(), 3);

        registry.cancel_task(&a);
        assert_eq!(registry.prune_terminal(chrono::Duration::hours(1)), 0);
        assert_eq!(registry.prune_terminal(chrono::Duration::seconds(-1)), 1);
        assert_eq!(registry.len(), 2);
        assert!(registry.get_task(&a).is_none());
    }
}
