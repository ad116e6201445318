//! Physical Connection
//!
//! One socket to one server endpoint, shared by every logical connection
//! bound to it. Tracks connectivity and an idle-expiry clock, and (in async
//! read mode) runs an inbound reader that routes each response frame to the
//! queue of the session owning its stream id.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use super::error::{ConnError, ConnResult};
use super::registry::PhysicalId;
use super::{lock, Endpoint};
use crate::config::{ManagerConfig, ReadMode, SocketMode};
use crate::protocol::{read_message, FrameError, Message, StreamId, UNADDRESSED_STREAM_ID};

/// Connectivity of a physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Receives the frames the inbound reader cannot route to a single session
pub trait UnsolicitedSink: Send + Sync {
    /// Hand `message` to every session bound to `source`; returns the number
    /// of recipients. The message is only borrowed for the fan-out.
    fn process_unsolicited_message(&self, source: PhysicalId, message: &Message) -> usize;

    fn record_protocol_error(&self, _source: PhysicalId) {}
}

/// Socket behaviour shared by all physical connections of a manager
#[derive(Debug, Clone)]
pub struct PhysicalSettings {
    pub read_mode: ReadMode,
    pub socket_mode: SocketMode,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_message_size: usize,
    pub tcp_nodelay: bool,
}

impl From<&ManagerConfig> for PhysicalSettings {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            read_mode: config.read_mode,
            socket_mode: config.socket_mode,
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            max_message_size: config.max_message_size,
            tcp_nodelay: config.tcp_nodelay,
        }
    }
}

#[derive(Debug)]
struct Clock {
    state: ConnectionState,
    last_touched: Instant,
    ttl: Duration,
}

type QueueReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<Message>>>;

struct MessageQueue {
    // None once the connection is closed; buffered messages stay readable
    tx: Option<mpsc::UnboundedSender<Message>>,
    rx: QueueReceiver,
}

#[derive(Default)]
struct StreamTable {
    next: u16,
    closed: bool,
    queues: HashMap<StreamId, MessageQueue>,
}

/// State shared between the connection and its inbound reader task
struct Shared {
    clock: Mutex<Clock>,
    streams: Mutex<StreamTable>,
}

impl Shared {
    fn touch(&self) {
        lock(&self.clock).last_touched = Instant::now();
    }

    fn set_state(&self, state: ConnectionState) {
        lock(&self.clock).state = state;
    }

    fn deliver(&self, message: Message) {
        let stream_id = message.stream_id();
        let streams = lock(&self.streams);
        match streams.queues.get(&stream_id).and_then(|q| q.tx.as_ref()) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!(stream = %stream_id, "Queue receiver dropped, discarding response");
                }
            }
            None => {
                debug!(stream = %stream_id, "No session bound to stream, discarding response");
            }
        }
    }

    fn close_queues(&self) {
        let mut streams = lock(&self.streams);
        streams.closed = true;
        for queue in streams.queues.values_mut() {
            queue.tx = None;
        }
    }
}

/// A socket to one `(host, port)` endpoint
pub struct PhysicalConnection {
    endpoint: Endpoint,
    settings: PhysicalSettings,
    shared: Arc<Shared>,
    reader: AsyncMutex<Option<OwnedReadHalf>>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

impl PhysicalConnection {
    /// Create an unconnected physical connection
    pub fn new(endpoint: Endpoint, ttl: Duration, settings: PhysicalSettings) -> Self {
        Self {
            endpoint,
            settings,
            shared: Arc::new(Shared {
                clock: Mutex::new(Clock {
                    state: ConnectionState::Disconnected,
                    last_touched: Instant::now(),
                    ttl,
                }),
                streams: Mutex::new(StreamTable::default()),
            }),
            reader: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            inbound_task: Mutex::new(None),
        }
    }

    /// Open the socket. On failure the connection is left `Disconnected`.
    pub async fn connect(&self) -> ConnResult<()> {
        self.shared.set_state(ConnectionState::Connecting);

        let target = self.endpoint.dial_target();
        debug!(endpoint = %self.endpoint, target = %target, "Opening physical connection");

        let stream = match timeout(self.settings.connect_timeout, TcpStream::connect(target.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(ConnError::ConnectFailed {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(ConnError::ConnectFailed {
                    endpoint: self.endpoint.clone(),
                    reason: format!("timed out after {:?}", self.settings.connect_timeout),
                });
            }
        };

        if self.settings.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(endpoint = %self.endpoint, "Could not set TCP_NODELAY: {}", e);
            }
        }

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);

        self.shared.set_state(ConnectionState::Connected);
        self.shared.touch();
        info!(endpoint = %self.endpoint, "Physical connection established");
        Ok(())
    }

    /// Spawn the inbound reader unless it is already running. Only meaningful
    /// in async read mode. The reader takes over the read half of the socket,
    /// so raw reads (a handshake, say) must happen before the first call.
    pub async fn start_inbound(&self, id: PhysicalId, sink: Weak<dyn UnsolicitedSink>) {
        if self.settings.read_mode != ReadMode::Async || self.inbound_started() {
            return;
        }

        // The reader lock is held until the task handle is stored, so a
        // concurrent disconnect always finds the task to abort
        let mut reader = self.reader.lock().await;
        if !self.is_valid() {
            return;
        }
        let Some(read_half) = reader.take() else {
            return;
        };

        let handle = tokio::spawn(run_inbound_reader(
            id,
            self.endpoint.clone(),
            read_half,
            Arc::clone(&self.shared),
            sink,
            self.settings.max_message_size,
        ));
        *lock(&self.inbound_task) = Some(handle);
        debug!(physical = %id, endpoint = %self.endpoint, "Inbound reader handed the socket");
    }

    pub fn inbound_started(&self) -> bool {
        lock(&self.inbound_task).is_some()
    }

    /// Mark the connection unusable without touching the socket yet
    pub fn invalidate(&self) {
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Close the socket, stop the inbound reader and wake queue waiters
    pub async fn disconnect(&self) {
        self.shared.set_state(ConnectionState::Disconnected);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                warn!(endpoint = %self.endpoint, "Socket did not shut down cleanly: {}", e);
            }
        }
        self.reader.lock().await.take();

        let inbound_task = lock(&self.inbound_task).take();
        if let Some(handle) = inbound_task {
            handle.abort();
        }
        self.shared.close_queues();

        debug!(endpoint = %self.endpoint, "Physical connection closed");
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.clock).state
    }

    pub fn is_valid(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_address(&self, host: &str) -> bool {
        !host.is_empty()
            && (self.endpoint.host == host || self.endpoint.resolved_address == host)
    }

    pub fn is_port(&self, port: u16) -> bool {
        self.endpoint.port == port
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Reset the idle clock
    pub fn touch(&self) {
        self.shared.touch();
    }

    pub fn ttl(&self) -> Duration {
        lock(&self.shared.clock).ttl
    }

    pub fn set_ttl(&self, ttl: Duration) {
        lock(&self.shared.clock).ttl = ttl;
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.shared.clock).last_touched.elapsed()
    }

    /// True once the connection has been idle longer than its TTL. A zero
    /// TTL expires immediately.
    pub fn expired_ttl(&self) -> bool {
        let clock = lock(&self.shared.clock);
        clock.ttl.is_zero() || clock.last_touched.elapsed() > clock.ttl
    }

    /// Reserve a stream id for a newly bound session
    pub fn bind_stream(&self) -> ConnResult<StreamId> {
        let mut streams = lock(&self.shared.streams);

        for _ in 0..=u16::MAX {
            streams.next = streams.next.wrapping_add(1);
            if streams.next == UNADDRESSED_STREAM_ID {
                continue;
            }

            let candidate = StreamId(streams.next);
            if streams.queues.contains_key(&candidate) {
                continue;
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let tx = if streams.closed { None } else { Some(tx) };
            streams.queues.insert(
                candidate,
                MessageQueue {
                    tx,
                    rx: Arc::new(AsyncMutex::new(rx)),
                },
            );
            return Ok(candidate);
        }

        Err(ConnError::ResourceExhaustion(format!(
            "no free stream ids on {}",
            self.endpoint
        )))
    }

    pub fn unbind_stream(&self, stream: StreamId) {
        lock(&self.shared.streams).queues.remove(&stream);
    }

    pub fn bound_streams(&self) -> usize {
        lock(&self.shared.streams).queues.len()
    }

    /// Read from the socket according to the socket mode. In async read mode
    /// this only works until the inbound reader has taken over the socket.
    pub async fn read_raw(&self, buf: &mut [u8]) -> ConnResult<usize> {
        self.shared.touch();

        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            if self.inbound_started() {
                return Err(ConnError::ReadWriteFailed(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "raw reads are unavailable while the inbound reader owns the socket",
                )));
            }
            return Err(not_connected());
        };

        let result = match self.settings.socket_mode {
            SocketMode::Blocking => match timeout(self.settings.request_timeout, reader.read_exact(buf)).await {
                Ok(read) => read.map_err(ConnError::from),
                Err(_) => Err(stalled(self.settings.request_timeout)),
            },
            SocketMode::NonBlocking => match reader.try_read(buf) {
                // Zero bytes into a non-empty buffer is end of stream, not "nothing yet"
                Ok(0) if !buf.is_empty() => Err(ConnError::ReadWriteFailed(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} closed the connection", self.endpoint),
                ))),
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(e.into()),
            },
        };
        let read = self.check_io(result)?;

        self.shared.touch();
        Ok(read)
    }

    /// Write to the socket according to the socket mode
    pub async fn write_raw(&self, buf: &[u8]) -> ConnResult<usize> {
        self.shared.touch();

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(not_connected)?;

        let result = match self.settings.socket_mode {
            SocketMode::Blocking => match timeout(self.settings.request_timeout, writer.write_all(buf)).await {
                Ok(written) => written.map(|_| buf.len()).map_err(ConnError::from),
                Err(_) => Err(stalled(self.settings.request_timeout)),
            },
            SocketMode::NonBlocking => match writer.try_write(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(e.into()),
            },
        };
        let written = self.check_io(result)?;

        self.shared.touch();
        Ok(written)
    }

    /// Build the next message straight from the socket (sync read mode).
    /// The caller expects a message to be imminent, so a stall is an error.
    /// Unsolicited frames met on the way are fanned out through `sink`.
    pub async fn read_message_direct(
        &self,
        source: PhysicalId,
        sink: &dyn UnsolicitedSink,
    ) -> ConnResult<Message> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or_else(not_connected)?;

        loop {
            let result = match timeout(
                self.settings.request_timeout,
                read_message(reader, self.settings.max_message_size),
            )
            .await
            {
                Ok(frame) => frame.map_err(ConnError::from),
                Err(_) => Err(stalled(self.settings.request_timeout)),
            };
            let message = match self.check_io(result) {
                Ok(message) => message,
                Err(e @ ConnError::Protocol { .. }) => {
                    sink.record_protocol_error(source);
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            self.shared.touch();

            if message.is_unsolicited() {
                sink.process_unsolicited_message(source, &message);
                continue;
            }
            return Ok(message);
        }
    }

    /// A failed socket operation leaves the stream at an unknown position, so
    /// the connection is marked dead and is never handed to new sessions.
    /// Malformed frames are drained by the codec and are not fatal.
    fn check_io<T>(&self, result: ConnResult<T>) -> ConnResult<T> {
        if let Err(e @ ConnError::ReadWriteFailed(_)) = &result {
            warn!(
                endpoint = %self.endpoint,
                kind = e.error_kind(),
                "Socket operation failed, marking physical connection disconnected: {}",
                e
            );
            self.shared.set_state(ConnectionState::Disconnected);
        }
        result
    }

    /// Wait for the next queued response on `stream` (async read mode).
    /// Returns `Ok(None)` when nothing arrived within the request timeout.
    pub async fn read_queued(&self, stream: StreamId) -> ConnResult<Option<Message>> {
        let rx = lock(&self.shared.streams)
            .queues
            .get(&stream)
            .map(|queue| Arc::clone(&queue.rx))
            .ok_or_else(|| {
                ConnError::ReadWriteFailed(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("stream {} is not bound", stream),
                ))
            })?;

        let mut rx = rx.lock().await;
        match timeout(self.settings.request_timeout, rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(message)) => {
                self.shared.touch();
                Ok(Some(message))
            }
            Ok(None) => Err(ConnError::ReadWriteFailed(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("connection to {} closed", self.endpoint),
            ))),
        }
    }
}

impl Drop for PhysicalConnection {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.inbound_task).take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clock = lock(&self.shared.clock);
        f.debug_struct("PhysicalConnection")
            .field("endpoint", &self.endpoint)
            .field("state", &clock.state)
            .field("ttl", &clock.ttl)
            .finish()
    }
}

#[instrument(skip_all, fields(physical = %id, endpoint = %endpoint))]
async fn run_inbound_reader(
    id: PhysicalId,
    endpoint: Endpoint,
    mut read_half: OwnedReadHalf,
    shared: Arc<Shared>,
    sink: Weak<dyn UnsolicitedSink>,
    max_message_size: usize,
) {
    debug!("Inbound reader started");

    loop {
        match read_message(&mut read_half, max_message_size).await {
            Ok(message) if message.is_unsolicited() => match sink.upgrade() {
                Some(sink) => {
                    let recipients = sink.process_unsolicited_message(id, &message);
                    debug!(recipients, "Dispatched unsolicited message");
                }
                None => debug!("Connection manager gone, dropping unsolicited message"),
            },
            Ok(message) => {
                shared.touch();
                shared.deliver(message);
            }
            Err(FrameError::Protocol { code, message }) => {
                error!(code, "Malformed frame: {}", message);
                if let Some(sink) = sink.upgrade() {
                    sink.record_protocol_error(id);
                }
            }
            Err(FrameError::Io(e)) => {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    info!("Server closed the connection");
                } else {
                    warn!("Inbound read failed: {}", e);
                }
                break;
            }
        }
    }

    shared.set_state(ConnectionState::Disconnected);
    shared.close_queues();
    debug!("Inbound reader stopped");
}

fn not_connected() -> ConnError {
    ConnError::ReadWriteFailed(io::Error::new(
        io::ErrorKind::NotConnected,
        "physical connection is not connected",
    ))
}

fn stalled(waited: Duration) -> ConnError {
    ConnError::ReadWriteFailed(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("socket stalled for {:?}", waited),
    ))
}
