//! Publish/subscribe progress notifications.
//!
//! Delivery is best-effort and at most once per subscriber: a subscriber
//! whose queue is full misses the event, and publishing never blocks the
//! producer. Subscribers only see events published after they subscribed.

pub mod local;
pub mod remote;
pub mod stream;
pub mod tcp;

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use serde::{Deserialize, Serialize};

pub use local::LocalEventBus;
pub use remote::{LoopbackTransport, RemoteEventBus, Transport};
pub use stream::{EventStream, StreamFrame};
pub use tcp::{TcpBroker, TcpTransport};

/// Default bounded queue length per subscriber.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    RunCompleted,
    ExperimentCompleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskProgress => "task-progress",
            EventType::TaskCompleted => "task-completed",
            EventType::TaskFailed => "task-failed",
            EventType::TaskCancelled => "task-cancelled",
            EventType::RunCompleted => "run-completed",
            EventType::ExperimentCompleted => "experiment-completed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification as seen by consumers: `{type, data, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize event")
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("Failed to parse event")
    }
}

/// Receiving end of one subscriber's queue.
pub struct Subscription {
    id: u64,
    receiver: Receiver<Event>,
}

impl Subscription {
    pub(crate) fn new(id: u64, receiver: Receiver<Event>) -> Self {
        Self { id, receiver }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn try_recv(&self) -> std::result::Result<Event, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Event, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.try_iter().collect()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("queued", &self.receiver.len())
            .finish()
    }
}

/// Broadcast channel shared by producers (task registry, experiment
/// manager) and consumers (event streams, CLI watchers).
pub trait EventBus: Send + Sync {
    fn publish(&self, event: Event);

    fn subscribe(&self) -> Subscription;

    /// Remove a subscriber. Unknown ids are ignored.
    fn unsubscribe(&self, subscription: &Subscription);

    fn subscriber_count(&self) -> usize;
}
