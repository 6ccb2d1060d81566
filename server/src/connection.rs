//! One accepted TCP connection
//!
//! Each connection runs two tokio tasks: a reader that decodes frames and
//! feeds them to the attached protocol, and a writer that drains queued
//! output messages. Closing is a small state machine driven through the
//! dispatcher:
//!
//! `Open -> RequestClose -> Closing -> Closed`
//!
//! The socket is only shut down once every queued write has completed, and
//! the connection leaves the registry once nothing references it anymore.

use crate::context::ServerContext;
use crate::lifetime::{self, Releasable, ReleaseLatch};
use crate::output::OutputMessagePtr;
use crate::protocol::{self, Protocol};
use crate::service::ServicePort;
use crate::tasks::Task;
use bytes::BytesMut;
use futures::StreamExt;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use shared::{FrameCodec, InputMessage};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

pub type ConnectionId = u64;

const PACKET_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    RequestClose,
    Closing,
    Closed,
}

struct ConnectionInner {
    state: ConnectionState,
    protocol: Option<Arc<dyn Protocol>>,
    received_first: bool,
    /// Writes handed to the writer task and not yet completed
    pending_write: u32,
    /// Sends deferred to the pool since the last completed write
    deferred_sends: u32,
    window_start: Instant,
    window_packets: u32,
}

pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    context: Arc<ServerContext>,
    port: Option<Arc<ServicePort>>,
    inner: Mutex<ConnectionInner>,
    latch: ReleaseLatch,
    writer_tx: mpsc::UnboundedSender<OutputMessagePtr>,
    writer_rx: Mutex<Option<mpsc::UnboundedReceiver<OutputMessagePtr>>>,
    shutdown: CancellationToken,
    error_logged: AtomicBool,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        context: Arc<ServerContext>,
        port: Option<Arc<ServicePort>>,
    ) -> Arc<Self> {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            peer,
            context,
            port,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Open,
                protocol: None,
                received_first: false,
                pending_write: 0,
                deferred_sends: 0,
                window_start: Instant::now(),
                window_packets: 0,
            }),
            latch: ReleaseLatch::new(),
            writer_tx,
            writer_rx: Mutex::new(Some(writer_rx)),
            shutdown: CancellationToken::new(),
            error_logged: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn ip(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.inner.lock().protocol.clone()
    }

    pub fn pending_writes(&self) -> u32 {
        self.inner.lock().pending_write
    }

    pub fn is_released(&self) -> bool {
        self.latch.is_released()
    }

    /// Binds a protocol before the first frame arrives
    pub fn attach_protocol(&self, protocol: Arc<dyn Protocol>) {
        self.inner.lock().protocol = Some(protocol);
    }

    /// Starts the reader and writer tasks on the current tokio runtime
    pub fn accept(self: &Arc<Self>, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            trace!("Could not disable Nagle for {}: {}", self.peer, e);
        }
        let (read_half, write_half) = stream.into_split();

        if let Some(port) = &self.port {
            if let Some(protocol) = port.make_sending_protocol(self) {
                self.attach_protocol(Arc::clone(&protocol));
                protocol.on_connect();
            }
        }

        if let Some(rx) = self.writer_rx.lock().take() {
            tokio::spawn(Arc::clone(self).write_loop(write_half, rx));
        }
        tokio::spawn(Arc::clone(self).read_loop(read_half));
    }

    async fn read_loop(self: Arc<Self>, read_half: OwnedReadHalf) {
        let read_timeout = self.context.config.read_timeout();
        let mut frames = FramedRead::new(read_half, FrameCodec::new());

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = timeout(read_timeout, frames.next()) => next,
            };

            match next {
                Err(_) => {
                    self.log_error(format_args!("read timed out after {:?}", read_timeout));
                    self.close();
                    break;
                }
                Ok(None) => {
                    trace!("Connection {} reached end of stream", self.id);
                    self.close();
                    break;
                }
                Ok(Some(Err(e))) => {
                    self.log_error(format_args!("{}", e));
                    self.close();
                    break;
                }
                Ok(Some(Ok(body))) => {
                    if !self.parse_packet(body) {
                        break;
                    }
                }
            }
        }
    }

    /// Routes one frame body. Returns false once the connection stops reading.
    pub fn parse_packet(self: &Arc<Self>, body: BytesMut) -> bool {
        self.parse_packet_at(body, Instant::now())
    }

    fn parse_packet_at(self: &Arc<Self>, body: BytesMut, now: Instant) -> bool {
        let (first, protocol) = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Open {
                return false;
            }

            if now.saturating_duration_since(inner.window_start) >= PACKET_WINDOW {
                inner.window_start = now;
                inner.window_packets = 0;
            }
            inner.window_packets += 1;
            let limit = self.context.config.max_packets_per_second;
            if limit > 0 && inner.window_packets > limit {
                drop(inner);
                warn!(
                    "{} sent more than {} packets per second, disconnecting",
                    self.peer, limit
                );
                self.close();
                return false;
            }

            let first = !inner.received_first;
            inner.received_first = true;
            (first, inner.protocol.clone())
        };

        let mut msg = InputMessage::new(body);
        let checksummed = msg.strip_checksum();

        let protocol = match protocol {
            Some(protocol) => protocol,
            None => match self.select_protocol(checksummed, &mut msg) {
                Some(protocol) => protocol,
                None => {
                    self.close();
                    return false;
                }
            },
        };

        if checksummed {
            protocol.core().enable_checksum();
        }
        if first {
            protocol.on_recv_first_message(msg);
        } else {
            protocol::on_recv_message(protocol, msg);
        }

        self.state() == ConnectionState::Open
    }

    fn select_protocol(
        self: &Arc<Self>,
        checksummed: bool,
        msg: &mut InputMessage,
    ) -> Option<Arc<dyn Protocol>> {
        let port = self.port.as_ref()?;
        let protocol = port.make_protocol(self, checksummed, msg)?;
        self.attach_protocol(Arc::clone(&protocol));
        Some(protocol)
    }

    /// Queues a message for writing
    ///
    /// Written immediately when no write is outstanding; otherwise deferred
    /// to the pool's next flush. A peer that keeps the writer busy for longer
    /// than the configured backlog is disconnected.
    pub fn send(self: &Arc<Self>, msg: OutputMessagePtr) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Open {
            return false;
        }

        if inner.pending_write == 0 {
            inner.pending_write += 1;
            inner.deferred_sends = 0;
            drop(inner);

            if let Some(protocol) = msg.protocol() {
                protocol.on_send_message(&msg);
            }
            self.internal_send(msg);
            return true;
        }

        inner.deferred_sends += 1;
        let config = &self.context.config;
        if config.force_close_slow_connection && inner.deferred_sends > config.max_pending_writes {
            drop(inner);
            warn!(
                "{} is not reading its output, disconnecting slow consumer",
                self.peer
            );
            self.close();
            return false;
        }
        drop(inner);

        self.context.pool.auto_send(msg);
        true
    }

    fn internal_send(self: &Arc<Self>, msg: OutputMessagePtr) {
        if self.writer_tx.send(msg).is_err() {
            trace!("Writer for connection {} is gone", self.id);
            self.on_write_complete();
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<OutputMessagePtr>,
    ) {
        let write_timeout = self.context.config.write_timeout();

        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let bytes = msg.frame_bytes();
            drop(msg);
            match timeout(write_timeout, write_half.write_all(&bytes)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.log_error(format_args!("write failed: {}", e));
                    self.close();
                }
                Err(_) => {
                    self.log_error(format_args!("write timed out after {:?}", write_timeout));
                    self.close();
                }
            }

            if self.on_write_complete() {
                break;
            }
        }

        let _ = write_half.shutdown().await;
    }

    /// Returns true when this completion let the socket close
    fn on_write_complete(self: &Arc<Self>) -> bool {
        let close_now = {
            let mut inner = self.inner.lock();
            inner.pending_write = inner.pending_write.saturating_sub(1);
            inner.deferred_sends = 0;
            inner.state == ConnectionState::Closing && inner.pending_write == 0
        };

        if close_now {
            self.close_socket();
            self.release_connection();
        }
        close_now
    }

    /// Requests a close. The real work happens on the dispatcher.
    pub fn close(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Open {
                return;
            }
            inner.state = ConnectionState::RequestClose;
        }

        let connection = Arc::clone(self);
        let task = Task::new(move || connection.close_connection());
        if let Err(task) = self.context.dispatcher.try_add_task(task, false) {
            task.execute();
        }
    }

    /// Detaches and releases the protocol, then closes the socket once all
    /// pending writes have drained
    pub fn close_connection(self: &Arc<Self>) {
        let (protocol, close_now) = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::RequestClose {
                return;
            }
            inner.state = ConnectionState::Closing;
            (inner.protocol.take(), inner.pending_write == 0)
        };

        if let Some(protocol) = protocol {
            protocol.core().detach_connection();
            protocol::release_protocol(&protocol);
        }

        if close_now {
            self.close_socket();
            self.release_connection();
        }
    }

    fn close_socket(&self) {
        self.inner.lock().state = ConnectionState::Closed;
        self.shutdown.cancel();
        debug!("Closed socket of connection {} ({})", self.id, self.peer);
    }

    /// Marks the connection released; it leaves the registry when the last
    /// output message referencing it is gone
    pub fn release_connection(&self) {
        lifetime::release(self);
    }

    fn log_error(&self, error: fmt::Arguments<'_>) {
        if !self.error_logged.swap(true, Ordering::SeqCst) {
            info!("Connection {} ({}) error: {}", self.id, self.peer, error);
        }
    }

    #[cfg(test)]
    pub(crate) fn take_written(&self) -> Vec<OutputMessagePtr> {
        let mut written = Vec::new();
        if let Some(rx) = self.writer_rx.lock().as_mut() {
            while let Ok(msg) = rx.try_recv() {
                written.push(msg);
            }
        }
        written
    }

    #[cfg(test)]
    pub(crate) fn complete_write(self: &Arc<Self>) -> bool {
        self.on_write_complete()
    }
}

impl Releasable for Connection {
    fn latch(&self) -> &ReleaseLatch {
        &self.latch
    }

    fn teardown(&self) {
        self.context.connections.release_connection(self.id);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
