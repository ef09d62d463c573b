//! Heartbeat-interleaved event stream over one subscription.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, warn};

use super::{EventBus, Subscription};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Heartbeat,
    /// Serialized `{type, data, timestamp}` event.
    Data(String),
}

impl StreamFrame {
    /// Server-Sent-Events rendering.
    pub fn to_sse(&self) -> String {
        match self {
            StreamFrame::Heartbeat => ": heartbeat\n\n".to_string(),
            StreamFrame::Data(json) => format!("data: {}\n\n", json),
        }
    }
}

/// Pull-based stream: each `next()` waits at most one heartbeat interval.
///
/// Ends when the close flag is raised or the bus drops the subscription.
/// Dropping the stream unsubscribes.
pub struct EventStream {
    bus: Arc<dyn EventBus>,
    subscription: Subscription,
    heartbeat: Duration,
    closed: Arc<AtomicBool>,
}

impl EventStream {
    pub fn new(bus: Arc<dyn EventBus>, heartbeat: Duration) -> Self {
        let subscription = bus.subscribe();
        debug!(subscriber = subscription.id(), "Event stream opened");
        Self {
            bus,
            subscription,
            heartbeat,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag the consumer raises to end the stream.
    pub fn close_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

impl Iterator for EventStream {
    type Item = StreamFrame;

    fn next(&mut self) -> Option<StreamFrame> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            match self.subscription.recv_timeout(self.heartbeat) {
                Ok(event) => match event.to_json() {
                    Ok(json) => return Some(StreamFrame::Data(json)),
                    Err(e) => warn!("Skipping unserializable event: {:#}", e),
                },
                Err(RecvTimeoutError::Timeout) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return None;
                    }
                    return Some(StreamFrame::Heartbeat);
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.subscription);
        debug!(subscriber = self.subscription.id(), "Event stream closed");
    }
}
