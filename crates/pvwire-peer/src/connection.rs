use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use pvwire_frame::{
    ByteOrder, ErrorTier, FrameConfig, FrameError, FrameReader, FrameWriter, Header,
    RequestEncoder, Segment, SegmentAccumulator, WireReader, WireWriter, HEADER_SIZE,
    PROTOCOL_REVISION,
};
use pvwire_transport::{PeerIdentity, PvaStream};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{PeerError, Result};
use crate::pool::{lock, TaskHandle, ThreadPool};
use crate::role::ConnectionRole;

/// How often blocked waits re-check the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Outbound {
    Request(Box<dyn RequestEncoder>),
    End,
}

/// One TCP connection to a PVA peer.
///
/// The engine owns one receiver thread, started with the connection, and
/// one sender thread, started by [`Connection::start_sender`] once the role
/// is ready to send. Handles are cheap to clone and may be used from any
/// thread; only the send queue is shared with callers.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    is_server: bool,
    config: ConnectionConfig,
    pool: ThreadPool,

    running: AtomicBool,
    closing: AtomicBool,

    queue: SyncSender<Outbound>,
    queue_rx: Mutex<Option<Receiver<Outbound>>>,

    stream: Mutex<Option<PvaStream>>,
    stream_ready: Condvar,
    write_lock: Mutex<()>,

    peer_version: AtomicU8,
    peer_buffer_size: AtomicUsize,
    big_endian: AtomicBool,
    peer_addr: Mutex<Option<SocketAddr>>,
    peer_identity: Mutex<Option<PeerIdentity>>,

    last_received: Mutex<Instant>,
    last_sent: Mutex<Instant>,

    ready: Mutex<bool>,
    ready_changed: Condvar,

    sender: Mutex<Option<TaskHandle>>,
    sender_thread: Mutex<Option<ThreadId>>,
    receiver: Mutex<Option<TaskHandle>>,
    receiver_thread: Mutex<Option<ThreadId>>,
}

impl Connection {
    /// Create a connection for `role` and start its receiver thread.
    ///
    /// `name` identifies the peer in log output.
    pub fn start<R: ConnectionRole>(
        role: R,
        name: impl Into<String>,
        pool: &ThreadPool,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let (queue, queue_rx) = mpsc::sync_channel(config.send_queue_capacity.max(1));
        let now = Instant::now();
        let is_server = !role.expects_server_messages();
        let conn = Connection {
            shared: Arc::new(Shared {
                name: name.into(),
                is_server,
                peer_buffer_size: AtomicUsize::new(config.receive_buffer_size),
                config,
                pool: pool.clone(),
                running: AtomicBool::new(true),
                closing: AtomicBool::new(false),
                queue,
                queue_rx: Mutex::new(Some(queue_rx)),
                stream: Mutex::new(None),
                stream_ready: Condvar::new(),
                write_lock: Mutex::new(()),
                peer_version: AtomicU8::new(PROTOCOL_REVISION),
                big_endian: AtomicBool::new(ByteOrder::native() == ByteOrder::Big),
                peer_addr: Mutex::new(None),
                peer_identity: Mutex::new(None),
                last_received: Mutex::new(now),
                last_sent: Mutex::new(now),
                ready: Mutex::new(false),
                ready_changed: Condvar::new(),
                sender: Mutex::new(None),
                sender_thread: Mutex::new(None),
                receiver: Mutex::new(None),
                receiver_thread: Mutex::new(None),
            }),
        };

        let receiver_conn = conn.clone();
        let handle = pool.spawn("rx", move || receive_loop(receiver_conn, role))?;
        *lock(&conn.shared.receiver_thread) = handle.thread_id();
        *lock(&conn.shared.receiver) = Some(handle);
        Ok(conn)
    }

    /// Start the sender thread. Calling it again has no effect.
    pub fn start_sender(&self) -> std::io::Result<()> {
        let Some(rx) = lock(&self.shared.queue_rx).take() else {
            return Ok(());
        };
        let conn = self.clone();
        let handle = self
            .shared
            .pool
            .spawn("tx", move || send_loop(conn, rx))?;
        *lock(&self.shared.sender_thread) = handle.thread_id();
        *lock(&self.shared.sender) = Some(handle);
        Ok(())
    }

    /// Queue an item for sending without blocking.
    ///
    /// Fails immediately when the queue is full or the connection is
    /// closing. Delivery of a queued item is best-effort.
    pub fn submit<E: RequestEncoder + 'static>(&self, item: E) -> Result<()> {
        self.submit_boxed(Box::new(item))
    }

    pub fn submit_boxed(&self, item: Box<dyn RequestEncoder>) -> Result<()> {
        if self.shared.closing.load(Ordering::Acquire) || !self.is_running() {
            return Err(PeerError::Closed);
        }
        match self.shared.queue.try_send(Outbound::Request(item)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PeerError::QueueFull {
                capacity: self.shared.config.send_queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(PeerError::Closed),
        }
    }

    /// Encode `item` and write it on the calling thread, bypassing the queue.
    ///
    /// Used while the sender thread is not running yet, e.g. to answer
    /// connection validation.
    pub fn send_now(&self, item: &dyn RequestEncoder) -> pvwire_frame::Result<()> {
        let mut buf = BytesMut::with_capacity(self.shared.config.send_buffer_size);
        let mut w = WireWriter::new(&mut buf, self.send_order()).with_server_origin(self.is_server());
        item.encode_request(self.peer_version(), &mut w)?;

        let stream = {
            let slot = lock(&self.shared.stream);
            match slot.as_ref() {
                Some(stream) => stream.try_clone().map_err(transport_error)?,
                None => return Err(FrameError::ConnectionClosed),
            }
        };
        let mut writer = FrameWriter::new(stream, self.batch_limit());
        let _guard = lock(&self.shared.write_lock);
        writer.write_batched(&buf)?;
        self.touch_sent();
        Ok(())
    }

    /// Close the connection.
    ///
    /// The sender gets a bounded time to drain what was queued before it.
    /// The socket is then shut down, which unblocks a receiver parked in a
    /// read; with `wait` set the receiver is joined within the same bound.
    /// Timeouts are logged, never escalated.
    pub fn close(&self, wait: bool) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let timeout = self.shared.config.shutdown_timeout;
        let current = thread::current().id();

        // A full queue has no room for the end marker; the sender then
        // stops once it finds the queue empty with `closing` set.
        if let Err(err) = self.shared.queue.try_send(Outbound::End) {
            debug!(peer = %self.name(), error = %err, "end marker not queued");
        }
        if *lock(&self.shared.sender_thread) != Some(current) {
            let sender = lock(&self.shared.sender).take();
            if let Some(mut sender) = sender {
                if !sender.join_timeout(timeout) {
                    warn!(peer = %self.name(), ?timeout, "sender did not drain in time");
                }
            }
        }

        self.shared.running.store(false, Ordering::Release);
        self.shutdown_socket();

        if wait && *lock(&self.shared.receiver_thread) != Some(current) {
            let receiver = lock(&self.shared.receiver).take();
            if let Some(mut receiver) = receiver {
                if !receiver.join_timeout(timeout) {
                    warn!(peer = %self.name(), ?timeout, "receiver did not exit in time");
                }
            }
        }
        debug!(peer = %self.name(), "connection closed");
    }

    fn shutdown_socket(&self) {
        if let Some(stream) = lock(&self.shared.stream).as_ref() {
            if let Err(err) = stream.shutdown() {
                debug!(peer = %self.name(), error = %err, "socket shutdown failed");
            }
        }
        self.shared.stream_ready.notify_all();
        self.shared.ready_changed.notify_all();
    }

    /// Stop everything after the receiver exited on its own.
    fn receiver_finished(&self) {
        self.shared.running.store(false, Ordering::Release);
        let _ = self.shared.queue.try_send(Outbound::End);
        self.shutdown_socket();
    }

    fn install_stream(&self, stream: PvaStream) {
        if let Ok(addr) = stream.peer_addr() {
            *lock(&self.shared.peer_addr) = Some(addr);
        }
        *lock(&self.shared.peer_identity) = stream.peer_identity().cloned();
        *lock(&self.shared.stream) = Some(stream);
        self.shared.stream_ready.notify_all();
    }

    /// Wait for the socket and return a clone for writing.
    fn wait_for_stream(&self) -> Option<PvaStream> {
        let mut slot = lock(&self.shared.stream);
        loop {
            if let Some(stream) = slot.as_ref() {
                return stream.try_clone().ok();
            }
            if !self.is_running() {
                return None;
            }
            slot = self
                .shared
                .stream_ready
                .wait_timeout(slot, POLL_INTERVAL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Is this the server end of the connection?
    pub fn is_server(&self) -> bool {
        self.shared.is_server
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.peer_addr)
    }

    /// Identity of a securely connected peer.
    pub fn peer_identity(&self) -> Option<PeerIdentity> {
        lock(&self.shared.peer_identity).clone()
    }

    pub fn peer_version(&self) -> u8 {
        self.shared.peer_version.load(Ordering::Acquire)
    }

    pub fn set_peer_version(&self, version: u8) {
        self.shared.peer_version.store(version, Ordering::Release);
    }

    /// Receive buffer size of the peer, bounded by our own.
    pub fn peer_buffer_size(&self) -> usize {
        self.shared.peer_buffer_size.load(Ordering::Acquire)
    }

    pub fn set_peer_buffer_size(&self, size: usize) {
        self.shared.peer_buffer_size.store(size, Ordering::Release);
    }

    /// Largest single socket write: half the peer's buffer.
    pub fn batch_limit(&self) -> usize {
        self.peer_buffer_size() / 2
    }

    pub fn send_order(&self) -> ByteOrder {
        if self.shared.big_endian.load(Ordering::Acquire) {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    pub fn set_send_order(&self, order: ByteOrder) {
        self.shared
            .big_endian
            .store(order == ByteOrder::Big, Ordering::Release);
    }

    pub fn last_received(&self) -> Instant {
        *lock(&self.shared.last_received)
    }

    pub fn last_sent(&self) -> Instant {
        *lock(&self.shared.last_sent)
    }

    /// Time since anything was received from the peer.
    pub fn receive_idle_for(&self) -> Duration {
        self.last_received().elapsed()
    }

    /// Time since anything was sent to the peer.
    pub fn send_idle_for(&self) -> Duration {
        self.last_sent().elapsed()
    }

    fn touch_received(&self) {
        *lock(&self.shared.last_received) = Instant::now();
    }

    fn touch_sent(&self) {
        *lock(&self.shared.last_sent) = Instant::now();
    }

    /// Mark the connection as validated and wake waiters.
    pub fn mark_ready(&self) {
        *lock(&self.shared.ready) = true;
        self.shared.ready_changed.notify_all();
    }

    pub fn is_ready(&self) -> bool {
        *lock(&self.shared.ready)
    }

    /// Block until the connection is validated.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut ready = lock(&self.shared.ready);
        while !*ready {
            if !self.is_running() {
                return Err(PeerError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PeerError::Timeout(timeout));
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            ready = self
                .shared
                .ready_changed
                .wait_timeout(ready, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.shared.name)
            .field("server", &self.shared.is_server)
            .field("running", &self.is_running())
            .field("ready", &self.is_ready())
            .finish()
    }
}

fn transport_error(err: pvwire_transport::TransportError) -> FrameError {
    match err {
        pvwire_transport::TransportError::Io(io) => FrameError::Io(io),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

fn receive_loop<R: ConnectionRole>(conn: Connection, mut role: R) {
    let exit_error = run_receiver(&conn, &mut role).err();
    match &exit_error {
        Some(err) if conn.is_running() => error!(peer = %conn.name(), error = %err, "receiver failed"),
        _ => debug!(peer = %conn.name(), "receiver exited"),
    }
    let error = exit_error.filter(|_| conn.is_running());
    conn.receiver_finished();
    role.on_receiver_exit(&conn, error.as_ref());
}

fn run_receiver<R: ConnectionRole>(conn: &Connection, role: &mut R) -> Result<()> {
    let stream = role.initialize_socket(conn)?;
    let read_stream = stream.try_clone()?;
    conn.install_stream(stream);
    info!(peer = %conn.name(), server = conn.is_server(), "connection established");
    role.on_connected(conn)?;

    let frame_config = FrameConfig {
        max_message_size: conn.config().max_message_size,
        ..FrameConfig::default()
    };
    let mut reader = FrameReader::with_config(
        read_stream,
        role.expects_server_messages(),
        frame_config,
    );
    let mut segments = SegmentAccumulator::new(conn.config().max_message_size);

    while conn.is_running() {
        let message = match reader.read_message() {
            Ok(message) => message,
            Err(FrameError::ConnectionClosed) => {
                debug!(peer = %conn.name(), "peer closed the connection");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        conn.touch_received();

        let header = message.header;
        if let Err(err) = handle_message(conn, role, &mut segments, header, message.bytes) {
            match err.tier() {
                ErrorTier::ConnectionFatal => return Err(err.into()),
                ErrorTier::MessageLocal => warn!(
                    peer = %conn.name(),
                    command = header.command,
                    error = %err,
                    "failed to process message, subsequent framing may be unreliable"
                ),
            }
        }
    }
    Ok(())
}

/// Route one complete message, merging segments first.
fn handle_message<R: ConnectionRole>(
    conn: &Connection,
    role: &mut R,
    segments: &mut SegmentAccumulator,
    header: Header,
    bytes: &[u8],
) -> pvwire_frame::Result<()> {
    if header.segment() != Segment::None {
        return match segments.accept(&header, bytes)? {
            Some(merged) => {
                let merged_header = Header::decode(merged)?;
                dispatch_message(conn, role, merged_header, merged)
            }
            None => Ok(()),
        };
    }
    dispatch_message(conn, role, header, bytes)
}

fn dispatch_message<R: ConnectionRole>(
    conn: &Connection,
    role: &mut R,
    header: Header,
    bytes: &[u8],
) -> pvwire_frame::Result<()> {
    if header.is_control() {
        return role.handle_control(conn, &header);
    }
    let mut payload = WireReader::new(&bytes[HEADER_SIZE..], header.order());
    role.handle_application(conn, &header, &mut payload)
}

fn send_loop(conn: Connection, rx: Receiver<Outbound>) {
    let Some(stream) = conn.wait_for_stream() else {
        debug!(peer = %conn.name(), "sender stopped before the socket was ready");
        return;
    };
    let mut writer = FrameWriter::new(stream, conn.batch_limit());
    let mut buf = BytesMut::with_capacity(conn.config().send_buffer_size);

    loop {
        let item = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Outbound::Request(item)) => item,
            Ok(Outbound::End) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout)
                if conn.is_running() && !conn.shared.closing.load(Ordering::Acquire) =>
            {
                continue
            }
            Err(RecvTimeoutError::Timeout) => break,
        };

        buf.clear();
        let mut w = WireWriter::new(&mut buf, conn.send_order()).with_server_origin(conn.is_server());
        if let Err(err) = item.encode_request(conn.peer_version(), &mut w) {
            warn!(peer = %conn.name(), error = %err, "failed to encode outbound item, dropping it");
            continue;
        }
        if buf.is_empty() {
            continue;
        }

        writer.set_batch_limit(conn.batch_limit());
        let result = {
            let _guard = lock(&conn.shared.write_lock);
            writer.write_batched(&buf)
        };
        if let Err(err) = result {
            if conn.is_running() {
                error!(peer = %conn.name(), error = %err, "send failed");
            }
            break;
        }
        conn.touch_sent();
    }
    debug!(peer = %conn.name(), "sender exited");
}
