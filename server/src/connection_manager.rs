//! Connection registry and per-address admission control
//!
//! This module tracks every live connection and decides which peers may
//! connect or log in:
//! - a registry of open connections keyed by id
//! - an accept-rate limiter that blocks addresses opening sockets too fast
//! - failed-login throttling per address and protocol
//! - temporary address bans
//!
//! All time-dependent checks have an `_at` variant taking the current
//! instant, so the rules can be exercised without sleeping.

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::context::ServerContext;
use crate::service::ServicePort;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Admission tables are pruned once they grow past this many entries
const PRUNE_THRESHOLD: usize = 1024;

/// Accept-rate bookkeeping for one address
#[derive(Debug, Clone, Copy)]
struct ConnectBlock {
    window_start: Instant,
    count: u32,
    blocked_until: Option<Instant>,
}

/// Login attempt bookkeeping for one address and protocol
#[derive(Debug, Clone, Copy)]
struct LoginBlock {
    last_attempt: Instant,
    count: u32,
}

#[derive(Debug, Clone, Copy)]
struct AdmissionRules {
    accept_window: Duration,
    accept_max: u32,
    accept_block: Duration,
    login_tries: u32,
    retry_timeout: Duration,
    login_timeout: Duration,
}

impl AdmissionRules {
    fn from_config(config: &ServerConfig) -> Self {
        Self {
            accept_window: Duration::from_millis(config.accept_window_ms),
            accept_max: config.accept_max_per_window,
            accept_block: Duration::from_millis(config.accept_block_ms),
            login_tries: config.login_tries,
            retry_timeout: Duration::from_millis(config.retry_timeout_ms),
            login_timeout: Duration::from_millis(config.login_timeout_ms),
        }
    }
}

#[derive(Default)]
struct Admission {
    connects: HashMap<IpAddr, ConnectBlock>,
    logins: HashMap<(IpAddr, u8), LoginBlock>,
    bans: HashMap<IpAddr, Instant>,
}

/// Owns every live connection and the admission tables
///
/// Connections are registered at accept time and removed by their own
/// teardown, once they are closed and no output message refers to them.
pub struct ConnectionManager {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    admission: Mutex<Admission>,
    rules: AdmissionRules,
}

impl ConnectionManager {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            admission: Mutex::new(Admission::default()),
            rules: AdmissionRules::from_config(config),
        }
    }

    /// Creates and registers a connection for an accepted peer
    pub fn create_connection(
        &self,
        context: &Arc<ServerContext>,
        peer: SocketAddr,
        port: Option<Arc<ServicePort>>,
    ) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, peer, Arc::clone(context), port);
        self.connections.lock().insert(id, Arc::clone(&connection));
        info!("Connection {} opened from {}", id, peer);
        connection
    }

    /// Removes a connection from the registry
    ///
    /// Returns true if it was registered, false if it was already gone.
    pub fn release_connection(&self, id: ConnectionId) -> bool {
        match self.connections.lock().remove(&id) {
            Some(connection) => {
                info!("Connection {} from {} released", id, connection.peer());
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests a close of every registered connection
    pub fn close_all(&self) {
        let connections: Vec<_> = self.connections.lock().values().cloned().collect();
        for connection in connections {
            connection.close();
        }
    }

    /// Admission check for a freshly accepted socket
    pub fn accept_connection(&self, ip: IpAddr) -> bool {
        self.accept_connection_at(ip, Instant::now())
    }

    /// More than the allowed number of accepts inside one window blocks the
    /// address for the block period.
    pub fn accept_connection_at(&self, ip: IpAddr, now: Instant) -> bool {
        if ip.is_unspecified() {
            return false;
        }

        let rules = self.rules;
        let mut admission = self.admission.lock();
        if let Some(until) = admission.bans.get(&ip).copied() {
            if now < until {
                debug!("Refusing banned address {}", ip);
                return false;
            }
            admission.bans.remove(&ip);
        }

        if admission.connects.len() > PRUNE_THRESHOLD {
            admission.connects.retain(|_, block| {
                block.blocked_until.map_or(false, |until| now < until)
                    || now.saturating_duration_since(block.window_start) < rules.accept_window
            });
        }

        let block = admission.connects.entry(ip).or_insert(ConnectBlock {
            window_start: now,
            count: 0,
            blocked_until: None,
        });

        if let Some(until) = block.blocked_until {
            if now < until {
                return false;
            }
            block.blocked_until = None;
            block.window_start = now;
            block.count = 0;
        }

        if now.saturating_duration_since(block.window_start) >= rules.accept_window {
            block.window_start = now;
            block.count = 0;
        }

        block.count += 1;
        if block.count > rules.accept_max {
            block.blocked_until = Some(now + rules.accept_block);
            warn!(
                "{} opened more than {} connections in {:?}, blocking for {:?}",
                ip, rules.accept_max, rules.accept_window, rules.accept_block
            );
            return false;
        }
        true
    }

    pub fn is_disabled(&self, ip: IpAddr, protocol_id: u8) -> bool {
        self.is_disabled_at(ip, protocol_id, Instant::now())
    }

    /// Whether logins for this protocol are locked out for the address
    pub fn is_disabled_at(&self, ip: IpAddr, protocol_id: u8, now: Instant) -> bool {
        let rules = self.rules;
        if rules.login_tries == 0 || ip.is_unspecified() {
            return false;
        }

        let admission = self.admission.lock();
        admission.logins.get(&(ip, protocol_id)).map_or(false, |block| {
            block.count > rules.login_tries && now < block.last_attempt + rules.login_timeout
        })
    }

    pub fn add_attempt(&self, ip: IpAddr, protocol_id: u8, success: bool) {
        self.add_attempt_at(ip, protocol_id, success, Instant::now())
    }

    /// Records a login attempt
    ///
    /// Failures count; so do successes that follow the previous attempt
    /// within the retry timeout. A slow successful login clears the count.
    pub fn add_attempt_at(&self, ip: IpAddr, protocol_id: u8, success: bool, now: Instant) {
        let rules = self.rules;
        if rules.login_tries == 0 || ip.is_unspecified() {
            return;
        }

        let mut admission = self.admission.lock();
        if admission.logins.len() > PRUNE_THRESHOLD {
            admission.logins.retain(|_, block| {
                now < block.last_attempt + rules.login_timeout.max(rules.retry_timeout)
            });
        }

        let block = admission
            .logins
            .entry((ip, protocol_id))
            .or_insert(LoginBlock {
                last_attempt: now,
                count: 0,
            });

        if block.count > rules.login_tries {
            block.count = 0;
        }

        let rapid = block.count > 0 && now < block.last_attempt + rules.retry_timeout;
        if !success || rapid {
            block.count += 1;
        } else {
            block.count = 0;
        }
        block.last_attempt = now;

        if block.count > rules.login_tries {
            warn!(
                "Too many login attempts from {} on protocol 0x{:02X}, locked for {:?}",
                ip, protocol_id, rules.login_timeout
            );
        }
    }

    /// Bans an address from connecting for `duration`
    pub fn ban_ip(&self, ip: IpAddr, duration: Duration) {
        self.ban_ip_at(ip, duration, Instant::now());
    }

    pub fn ban_ip_at(&self, ip: IpAddr, duration: Duration, now: Instant) {
        self.admission.lock().bans.insert(ip, now + duration);
        info!("Banned {} for {:?}", ip, duration);
    }

    pub fn is_banned_at(&self, ip: IpAddr, now: Instant) -> bool {
        self.admission
            .lock()
            .bans
            .get(&ip)
            .map_or(false, |until| now < *until)
    }
}
