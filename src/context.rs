//! Process-scoped state shared by the CLI, the experiment manager and
//! event consumers.
//!
//! The context owns the task registry, event bus, result store and the
//! table of created experiments, plus a janitor thread that prunes old
//! terminal tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::BenchmarkConfig;
use crate::events::{EventBus, LocalEventBus, RemoteEventBus, TcpTransport};
use crate::experiment::Experiment;
use crate::storage::{JsonStore, MemoryStore, ResultStore};
use crate::tasks::TaskRegistry;

struct Janitor {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct BenchmarkContext {
    config: BenchmarkConfig,
    registry: Arc<TaskRegistry>,
    events: Arc<dyn EventBus>,
    store: Arc<dyn ResultStore>,
    experiments: Mutex<HashMap<String, Experiment>>,
    janitor: Mutex<Option<Janitor>>,
}

impl BenchmarkContext {
    pub fn new(
        config: BenchmarkConfig,
        events: Arc<dyn EventBus>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::new(Some(Arc::clone(&events))));
        Self {
            config,
            registry,
            events,
            store,
            experiments: Mutex::new(HashMap::new()),
            janitor: Mutex::new(None),
        }
    }

    /// In-process bus and memory store.
    pub fn in_memory(config: BenchmarkConfig) -> Self {
        let events = Arc::new(LocalEventBus::new(config.events.subscriber_capacity));
        Self::new(config, events, Arc::new(MemoryStore::new()))
    }

    /// Build the backends the configuration asks for.
    pub fn from_config(config: BenchmarkConfig) -> Result<Self> {
        let capacity = config.events.subscriber_capacity;
        let events: Arc<dyn EventBus> = match &config.events.broker {
            Some(addr) => {
                let transport = TcpTransport::connect(addr.as_str())
                    .with_context(|| format!("Failed to connect to event broker {}", addr))?;
                info!(broker = %addr, "Publishing events through broker");
                Arc::new(RemoteEventBus::new(Arc::new(transport), capacity)?)
            }
            None => Arc::new(LocalEventBus::new(capacity)),
        };
        let store: Arc<dyn ResultStore> = match &config.storage.root {
            Some(root) => Arc::new(JsonStore::open(root)?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::new(config, events, store))
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<dyn EventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn insert_experiment(&self, experiment: Experiment) {
        self.experiments
            .lock()
            .insert(experiment.id.clone(), experiment);
    }

    pub fn get_experiment(&self, experiment_id: &str) -> Option<Experiment> {
        self.experiments.lock().get(experiment_id).cloned()
    }

    /// Experiments ordered by creation time.
    pub fn list_experiments(&self) -> Vec<Experiment> {
        let mut experiments: Vec<Experiment> = self.experiments.lock().values().cloned().collect();
        experiments.sort_by_key(|e| e.created_at);
        experiments
    }

    /// Start the task janitor. A second call is a no-op.
    pub fn start_janitor(&self) -> Result<()> {
        let mut slot = self.janitor.lock();
        if slot.is_some() {
            return Ok(());
        }
        let interval = self.config.tasks.prune_interval();
        let retention = self.config.tasks.retention();
        let registry = Arc::clone(&self.registry);
        let (stop, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("task-janitor".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            registry.prune_terminal(retention);
                        }
                        _ => break,
                    }
                }
            })
            .context("Failed to spawn janitor thread")?;
        *slot = Some(Janitor { stop, handle });
        info!(interval_s = interval.as_secs(), "Task janitor started");
        Ok(())
    }

    pub fn stop_janitor(&self) {
        if let Some(janitor) = self.janitor.lock().take() {
            janitor.stop.send(()).ok();
            if janitor.handle.join().is_err() {
                warn!("Janitor thread panicked");
            }
        }
    }

    pub fn janitor_running(&self) -> bool {
        self.janitor.lock().is_some()
    }

    pub fn heartbeat(&self) -> Duration {
        self.config.events.heartbeat()
    }
}

impl Drop for BenchmarkContext {
    fn drop(&mut self) {
        self.stop_janitor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use crate::tasks::TaskStatus;

    #[test]
    fn test_janitor_prunes_terminal_tasks() {
        let config = BenchmarkConfig {
            tasks: TaskConfig {
                retention_secs: 0,
                prune_interval_secs: 1,
            },
            ..Default::default()
        };
        let ctx = BenchmarkContext::in_memory(config);
        let done = ctx.registry().create_task("done", None);
        ctx.registry().cancel_task(&done.id);
        let live = ctx.registry().create_task("live", None);

        ctx.start_janitor().unwrap();
        ctx.start_janitor().unwrap();
        assert!(ctx.janitor_running());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ctx.registry().get_task(&done.id).is_some() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(ctx.registry().get_task(&done.id).is_none());
        assert_eq!(ctx.registry().get_task(&live.id).unwrap().status, TaskStatus::Pending);

        ctx.stop_janitor();
        assert!(!ctx.janitor_running());
    }

    #[test]
    fn test_registry_publishes_on_context_bus() {
        let ctx = BenchmarkContext::in_memory(BenchmarkConfig::default());
        let sub = ctx.events().subscribe();
        let task = ctx.registry().create_task("t", None);
        ctx.registry().cancel_task(&task.id);
        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_str(), "task-cancelled");
    }

    #[test]
    fn test_json_store_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BenchmarkConfig::default();
        config.storage.root = Some(dir.path().join("results"));
        let ctx = BenchmarkContext::from_config(config).unwrap();
        assert!(ctx.store().list_runs("nothing").unwrap().is_empty());
        assert!(dir.path().join("results").is_dir());
    }
}
