//! Fixtures for unit tests: an unstarted context and a recording protocol.

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::context::ServerContext;
use crate::output::OutputMessage;
use crate::protocol::{Protocol, ProtocolCore};
use parking_lot::Mutex;
use shared::InputMessage;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Context whose worker threads are not running, so every task runs inline
pub(crate) fn context() -> Arc<ServerContext> {
    context_with(ServerConfig::default())
}

pub(crate) fn context_with(config: ServerConfig) -> Arc<ServerContext> {
    ServerContext::new(config).unwrap()
}

pub(crate) fn peer() -> SocketAddr {
    "127.0.0.1:50000".parse().unwrap()
}

pub(crate) fn connection(context: &Arc<ServerContext>) -> Arc<Connection> {
    context
        .connections
        .create_connection(context, peer(), None)
}

/// Records everything routed to it
pub(crate) struct RecordingProtocol {
    core: ProtocolCore,
    pub sent: AtomicUsize,
    pub first: Mutex<Option<Vec<u8>>>,
    pub packets: Mutex<Vec<Vec<u8>>>,
    pub released: AtomicUsize,
}

impl RecordingProtocol {
    pub fn attach(connection: &Arc<Connection>) -> Arc<Self> {
        let protocol = Arc::new(Self {
            core: ProtocolCore::new(connection),
            sent: AtomicUsize::new(0),
            first: Mutex::new(None),
            packets: Mutex::new(Vec::new()),
            released: AtomicUsize::new(0),
        });
        connection.attach_protocol(protocol.clone());
        protocol
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

impl Protocol for RecordingProtocol {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        "recording"
    }

    fn on_recv_first_message(self: Arc<Self>, msg: InputMessage) {
        *self.first.lock() = Some(msg.remaining_bytes().to_vec());
    }

    fn parse_packet(self: Arc<Self>, msg: InputMessage) {
        self.packets.lock().push(msg.remaining_bytes().to_vec());
    }

    fn on_send_message(&self, msg: &OutputMessage) {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.core.on_send_message(msg);
    }

    fn on_release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
