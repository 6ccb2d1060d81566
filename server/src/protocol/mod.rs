//! Protocol layer shared by the login, game and admin protocols.
//!
//! A protocol sits on top of one [`Connection`]: it owns the session's
//! framing flags (XTEA key, checksum, raw mode), parses inbound messages and
//! produces outbound ones through the output pool.

pub mod admin;
pub mod game;
pub mod login;

use crate::connection::Connection;
use crate::context::ServerContext;
use crate::lifetime::{self, Releasable, ReleaseLatch};
use crate::output::{OutputMessage, OutputMessagePtr};
use log::{debug, error, warn};
use parking_lot::Mutex;
use shared::{FrameOptions, InputMessage, OutputBuffer, WireError, XteaKey, MAX_PAYLOAD_LENGTH};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Room a cached auto-send message must still have to be reused
const OUTPUT_REUSE_HEADROOM: usize = 4096;

pub trait Protocol: Send + Sync + 'static {
    fn core(&self) -> &ProtocolCore;

    fn name(&self) -> &'static str;

    /// Runs at accept time for services that send first
    fn on_connect(self: Arc<Self>) {}

    fn on_recv_first_message(self: Arc<Self>, msg: InputMessage);

    fn parse_packet(self: Arc<Self>, msg: InputMessage);

    /// Called right before a message is written, or when it is discarded
    fn on_send_message(&self, msg: &OutputMessage) {
        self.core().on_send_message(msg);
    }

    /// Runs once after the protocol is released and unreferenced
    fn on_release(&self) {}
}

/// Per-session state common to every protocol
pub struct ProtocolCore {
    context: Arc<ServerContext>,
    connection: Mutex<Option<Arc<Connection>>>,
    ip: IpAddr,
    key: Mutex<XteaKey>,
    encryption: AtomicBool,
    checksum: AtomicBool,
    raw: AtomicBool,
    output: Mutex<Option<OutputMessagePtr>>,
    latch: ReleaseLatch,
}

impl ProtocolCore {
    pub fn new(connection: &Arc<Connection>) -> Self {
        Self {
            context: Arc::clone(connection.context()),
            ip: connection.ip(),
            connection: Mutex::new(Some(Arc::clone(connection))),
            key: Mutex::new([0; 4]),
            encryption: AtomicBool::new(false),
            checksum: AtomicBool::new(false),
            raw: AtomicBool::new(false),
            output: Mutex::new(None),
            latch: ReleaseLatch::new(),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().clone()
    }

    pub(crate) fn detach_connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().take()
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn xtea_key(&self) -> XteaKey {
        *self.key.lock()
    }

    pub fn set_xtea_key(&self, key: XteaKey) {
        *self.key.lock() = key;
    }

    pub fn enable_xtea(&self) {
        self.encryption.store(true, Ordering::SeqCst);
    }

    pub fn is_xtea_enabled(&self) -> bool {
        self.encryption.load(Ordering::SeqCst)
    }

    pub fn enable_checksum(&self) {
        self.checksum.store(true, Ordering::SeqCst);
    }

    pub fn is_checksum_enabled(&self) -> bool {
        self.checksum.load(Ordering::SeqCst)
    }

    pub fn set_raw_messages(&self, raw: bool) {
        self.raw.store(raw, Ordering::SeqCst);
    }

    pub fn frame_options(&self) -> FrameOptions {
        FrameOptions {
            xtea_key: self.is_xtea_enabled().then(|| self.xtea_key()),
            checksum: self.is_checksum_enabled(),
        }
    }

    /// Seals the message for the wire and forgets it as the cached buffer
    pub fn on_send_message(&self, msg: &OutputMessage) {
        if !self.raw.load(Ordering::SeqCst) {
            if let Err(e) = msg.seal(&self.frame_options()) {
                error!("Failed to seal message for {}: {}", self.ip, e);
            }
        }

        let mut cached = self.output.lock();
        if cached
            .as_ref()
            .map_or(false, |current| std::ptr::eq(current.as_ref(), msg))
        {
            *cached = None;
        }
    }

    pub fn close_connection(&self) {
        if let Some(connection) = self.connection() {
            connection.close();
        }
    }
}

impl Releasable for dyn Protocol {
    fn latch(&self) -> &ReleaseLatch {
        &self.core().latch
    }

    fn teardown(&self) {
        debug!("{} protocol for {} released", self.name(), self.core().ip);
        self.on_release();
    }
}

/// The auto-send message this protocol is currently filling
///
/// Reuses the cached message while it has room, otherwise asks the pool for
/// a fresh one.
pub fn output_buffer(protocol: &Arc<dyn Protocol>) -> Option<OutputMessagePtr> {
    let core = protocol.core();
    let mut cached = core.output.lock();
    if let Some(current) = cached.as_ref() {
        if !current.is_sealed() && current.len() + OUTPUT_REUSE_HEADROOM < MAX_PAYLOAD_LENGTH {
            return Some(Arc::clone(current));
        }
    }

    let message = core.context.pool.get_output_message(protocol, true)?;
    *cached = Some(Arc::clone(&message));
    Some(message)
}

/// Starts a new auto-send message even when the cached one still has room.
/// The previous message stays queued with what it already holds.
pub fn fresh_output_buffer(protocol: &Arc<dyn Protocol>) -> Option<OutputMessagePtr> {
    let core = protocol.core();
    let message = core.context.pool.get_output_message(protocol, true)?;
    *core.output.lock() = Some(Arc::clone(&message));
    Some(message)
}

/// Sends a final error message and closes the connection
pub fn disconnect_client(protocol: &Arc<dyn Protocol>, opcode: u8, reason: &str) {
    let core = protocol.core();
    if let Some(message) = core.context.pool.get_output_message(protocol, false) {
        let written = write_disconnect(&mut message.buffer(), opcode, reason);
        match written {
            Ok(()) => core.context.pool.send(message),
            Err(e) => warn!("Failed to write disconnect for {}: {}", core.ip, e),
        }
    }
    core.close_connection();
}

fn write_disconnect(out: &mut OutputBuffer, opcode: u8, reason: &str) -> Result<(), WireError> {
    out.add_u8(opcode)?;
    out.add_string(reason)
}

/// Decrypts a follow-up message if the session is encrypted, then parses it
pub fn on_recv_message(protocol: Arc<dyn Protocol>, mut msg: InputMessage) {
    let core = protocol.core();
    if core.is_xtea_enabled() {
        if let Err(e) = msg.xtea_decrypt(&core.xtea_key()) {
            warn!("Dropping {} session from {}: {}", protocol.name(), core.ip, e);
            core.close_connection();
            return;
        }
    }
    protocol.parse_packet(msg);
}

/// Releases the protocol; teardown waits for outstanding output messages
pub fn release_protocol(protocol: &Arc<dyn Protocol>) {
    // The cached message holds a reference to us; let go of it first.
    let cached = protocol.core().output.lock().take();
    drop(cached);
    lifetime::release(protocol.as_ref());
}
