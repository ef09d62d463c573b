//! Event bus backed by an external message transport.
//!
//! `publish` serializes the event and queues it for a writer thread that owns
//! the transport send side. When that queue is full the event is dropped, so
//! a slow broker never stalls the producer. A reader thread republishes every
//! frame the transport delivers into an embedded [`LocalEventBus`], which is
//! what subscribers actually read.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Event, EventBus, LocalEventBus, Subscription};

/// How long the worker threads wait per poll before rechecking the stop flag.
const READER_POLL: Duration = Duration::from_millis(200);

/// Upper bound on how long `shutdown` waits for queued events to be sent.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Serialized events waiting for the writer thread.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Byte-frame channel to a broker.
pub trait Transport: Send + Sync {
    /// Blocking send of one whole frame. An error means the transport is
    /// closed for good.
    fn send(&self, frame: &[u8]) -> Result<()>;

    /// Next frame, `Ok(None)` on timeout. An error means the transport is
    /// closed for good.
    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Must unblock a `send` in progress on another thread.
    fn close(&self);
}

pub struct RemoteEventBus {
    transport: Arc<dyn Transport>,
    local: Arc<LocalEventBus>,
    outbound: Sender<Vec<u8>>,
    dropped: AtomicU64,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteEventBus {
    pub fn new(transport: Arc<dyn Transport>, capacity: usize) -> Result<Self> {
        Self::with_outbound_capacity(transport, capacity, DEFAULT_OUTBOUND_CAPACITY)
    }

    pub fn with_outbound_capacity(
        transport: Arc<dyn Transport>,
        capacity: usize,
        outbound_capacity: usize,
    ) -> Result<Self> {
        let local = Arc::new(LocalEventBus::new(capacity));
        let running = Arc::new(AtomicBool::new(true));
        let (outbound, queued) = bounded(outbound_capacity.max(1));

        let reader = {
            let transport = Arc::clone(&transport);
            let local = Arc::clone(&local);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("event-reader".into())
                .spawn(move || reader_loop(transport, local, running))
                .context("Failed to spawn event reader thread")?
        };
        let writer = {
            let transport = Arc::clone(&transport);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("event-writer".into())
                .spawn(move || writer_loop(transport, queued, running))
                .context("Failed to spawn event writer thread")?
        };

        Ok(Self {
            transport,
            local,
            outbound,
            dropped: AtomicU64::new(0),
            running,
            workers: Mutex::new(vec![reader, writer]),
        })
    }

    /// Events discarded because the outbound queue was full or closed.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Give the writer up to a second to send what is queued, then
    /// close the transport and join both threads.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let deadline = Instant::now() + FLUSH_TIMEOUT;
        while !self.outbound.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        self.transport.close();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                warn!("Event transport thread panicked");
            }
        }
    }
}

fn reader_loop(transport: Arc<dyn Transport>, local: Arc<LocalEventBus>, running: Arc<AtomicBool>) {
    info!("Event reader started");
    while running.load(Ordering::SeqCst) {
        match transport.recv(READER_POLL) {
            Ok(Some(frame)) => match Event::from_slice(&frame) {
                Ok(event) => local.publish(event),
                Err(e) => warn!("Dropping malformed event frame: {:#}", e),
            },
            Ok(None) => continue,
            Err(e) => {
                debug!("Event transport closed: {:#}", e);
                break;
            }
        }
    }
    info!("Event reader stopped");
}

fn writer_loop(transport: Arc<dyn Transport>, queued: Receiver<Vec<u8>>, running: Arc<AtomicBool>) {
    let mut sent = 0u64;
    loop {
        match queued.recv_timeout(READER_POLL) {
            Ok(frame) => {
                if let Err(e) = transport.send(&frame) {
                    if running.load(Ordering::SeqCst) {
                        warn!("Event transport write failed, publishing stopped: {:#}", e);
                    }
                    break;
                }
                sent += 1;
            }
            Err(RecvTimeoutError::Timeout) if running.load(Ordering::SeqCst) => continue,
            Err(_) => break,
        }
    }
    info!(sent, "Event writer stopped");
}

impl EventBus for RemoteEventBus {
    fn publish(&self, event: Event) {
        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(event = %event.event_type, "Failed to serialize event: {:#}", e);
                return;
            }
        };
        match self.outbound.try_send(json.into_bytes()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    debug!(event = %event.event_type, dropped, "Outbound event queue full, dropping");
                }
            }
        }
    }

    fn subscribe(&self) -> Subscription {
        self.local.subscribe()
    }

    fn unsubscribe(&self, subscription: &Subscription) {
        self.local.unsubscribe(subscription);
    }

    fn subscriber_count(&self) -> usize {
        self.local.subscriber_count()
    }
}

impl Drop for RemoteEventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// In-process transport that echoes every sent frame back to its reader,
/// like a broker with a single client.
pub struct LoopbackTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    closed: AtomicBool,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            closed: AtomicBool::new(false),
        }
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, frame: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("transport closed");
        }
        self.tx.send(frame.to_vec()).context("loopback channel closed")
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("transport closed");
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => bail!("loopback channel closed"),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
