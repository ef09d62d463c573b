//! Length-prefixed TCP pub/sub for events.
//!
//! Wire format: `[u32 big-endian length][JSON payload]`. The broker relays
//! every frame it receives to all connected clients, the sender included.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::remote::Transport;

/// Frames larger than this are treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const ACCEPT_POLL: Duration = Duration::from_millis(20);

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "frame too large"))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame)?;
    writer.flush()
}

/// Read one frame; `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Client side of the broker connection.
///
/// Writes are blocking and carry no timeout, so a frame is either written
/// whole or the connection is torn down. Any write error closes the
/// transport: the socket is shut down and later sends fail immediately.
pub struct TcpTransport {
    writer: Mutex<TcpStream>,
    // Separate handle so `close` never waits on a writer stuck in `send`.
    control: TcpStream,
    closed: AtomicBool,
    frames: Receiver<Vec<u8>>,
    peer: SocketAddr,
}

impl TcpTransport {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).context("Failed to connect to event broker")?;
        stream.set_nodelay(true).ok();
        let peer = stream.peer_addr().context("Broker socket has no peer address")?;
        let mut reader = stream.try_clone().context("Failed to clone broker socket")?;
        let control = stream.try_clone().context("Failed to clone broker socket")?;

        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name("event-tcp-reader".into())
            .spawn(move || {
                loop {
                    match read_frame(&mut reader) {
                        Ok(Some(frame)) => {
                            if tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!("Broker connection read failed: {}", e);
                            break;
                        }
                    }
                }
            })
            .context("Failed to spawn broker reader thread")?;

        info!("Connected to event broker at {}", peer);
        Ok(Self {
            writer: Mutex::new(stream),
            control,
            closed: AtomicBool::new(false),
            frames: rx,
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for TcpTransport {
    fn send(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            bail!("broker connection closed");
        }
        let mut stream = self.writer.lock();
        if let Err(e) = write_frame(&mut *stream, frame) {
            self.close();
            return Err(e).context("Failed to write event frame");
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => bail!("broker connection closed"),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.control.shutdown(Shutdown::Both).ok();
        }
    }
}

/// Frames queued per broker client before that client starts missing them.
const CLIENT_QUEUE: usize = 256;

struct Client {
    addr: SocketAddr,
    outbox: Sender<Arc<[u8]>>,
    stream: TcpStream,
}

type ClientList = Arc<Mutex<Vec<Client>>>;

/// Fan-out relay between event bus processes.
///
/// Every client has a bounded outbox drained by its own writer thread. A
/// client that stops reading only loses its own frames.
pub struct TcpBroker {
    local_addr: SocketAddr,
    clients: ClientList,
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl TcpBroker {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).context("Failed to bind event broker")?;
        listener
            .set_nonblocking(true)
            .context("Failed to set broker listener non-blocking")?;
        let local_addr = listener.local_addr()?;

        let clients: ClientList = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let accept_thread = {
            let clients = Arc::clone(&clients);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("event-broker".into())
                .spawn(move || accept_loop(listener, clients, running))
                .context("Failed to spawn broker thread")?
        };

        info!("Event broker listening on {}", local_addr);
        Ok(Self {
            local_addr,
            clients,
            running,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting, disconnect every client and wait for the broker thread.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let clients: Vec<Client> = self.clients.lock().drain(..).collect();
        for client in clients {
            client.stream.shutdown(Shutdown::Both).ok();
        }
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                warn!("Broker thread panicked");
            }
        }
    }
}

impl Drop for TcpBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, clients: ClientList, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = register_client(stream, addr, &clients, &running) {
                    warn!("Rejected broker client {}: {:#}", addr, e);
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                error!("Broker accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    info!("Event broker stopped");
}

fn register_client(
    stream: TcpStream,
    addr: SocketAddr,
    clients: &ClientList,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true).ok();
    let mut reader = stream.try_clone()?;
    let mut writer = stream.try_clone()?;
    let (outbox, pending) = bounded::<Arc<[u8]>>(CLIENT_QUEUE);

    thread::Builder::new()
        .name(format!("broker-writer-{}", addr.port()))
        .spawn(move || {
            for frame in pending.iter() {
                if let Err(e) = write_frame(&mut writer, &frame) {
                    debug!("Broker client {} write failed: {}", addr, e);
                    writer.shutdown(Shutdown::Both).ok();
                    break;
                }
            }
        })?;

    clients.lock().push(Client {
        addr,
        outbox,
        stream,
    });
    info!("Broker client connected: {}", addr);

    let clients = Arc::clone(clients);
    let running = Arc::clone(running);
    thread::Builder::new()
        .name(format!("broker-client-{}", addr.port()))
        .spawn(move || {
            while running.load(Ordering::SeqCst) {
                match read_frame(&mut reader) {
                    Ok(Some(frame)) => broadcast(&clients, frame.into()),
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Broker client {} read failed: {}", addr, e);
                        break;
                    }
                }
            }
            let removed: Vec<Client> = {
                let mut clients = clients.lock();
                let (gone, kept): (Vec<Client>, Vec<Client>) =
                    clients.drain(..).partition(|c| c.addr == addr);
                *clients = kept;
                gone
            };
            for client in removed {
                client.stream.shutdown(Shutdown::Both).ok();
            }
            info!("Broker client disconnected: {}", addr);
        })?;
    Ok(())
}

/// Queue `frame` for every client. Clients whose writer has exited are
/// removed; a full outbox only skips this frame for that client.
fn broadcast(clients: &ClientList, frame: Arc<[u8]>) {
    let mut clients = clients.lock();
    clients.retain(|client| match client.outbox.try_send(Arc::clone(&frame)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            debug!("Broker client {} is behind, skipping frame", client.addr);
            true
        }
        Err(TrySendError::Disconnected(_)) => {
            warn!("Dropping broker client {}", client.addr);
            false
        }
    });
}
