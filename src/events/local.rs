//! In-process event bus.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Sender, TrySendError, bounded};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{DEFAULT_SUBSCRIBER_CAPACITY, Event, EventBus, Subscription};

pub struct LocalEventBus {
    subscribers: Mutex<Vec<(u64, Sender<Event>)>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl LocalEventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }
}

impl EventBus for LocalEventBus {
    fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(subscriber = id, event = %event.event_type, "Subscriber queue full, dropping event");
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(subscriber = id, "Subscriber gone, removing");
                false
            }
        });
    }

    fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(self.capacity);
        self.subscribers.lock().push((id, tx));
        Subscription::new(id, rx)
    }

    fn unsubscribe(&self, subscription: &Subscription) {
        self.subscribers
            .lock()
            .retain(|(id, _)| *id != subscription.id());
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
