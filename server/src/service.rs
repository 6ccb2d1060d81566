//! Listening ports and the services they host.
//!
//! One port can carry several protocols (login and admin share 7171 by
//! default). The first frame of a connection then starts with a selector
//! byte that picks the service. A service that talks first must have its
//! port to itself, since there is no frame to select on.

use crate::connection::Connection;
use crate::context::ServerContext;
use crate::error::{Result, ServerError};
use crate::protocol::Protocol;
use futures::future;
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use shared::InputMessage;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A protocol kind a port can host
pub trait Service: Send + Sync + 'static {
    /// Selector byte that opens the first frame
    fn protocol_identifier(&self) -> u8;

    /// Whether first frames must carry a valid checksum
    fn is_checksummed(&self) -> bool;

    /// Whether the server speaks before the client's first frame
    fn server_sends_first(&self) -> bool;

    fn name(&self) -> &'static str;

    fn make_protocol(&self, connection: &Arc<Connection>) -> Arc<dyn Protocol>;
}

pub struct ServicePort {
    port: u16,
    context: Arc<ServerContext>,
    services: RwLock<Vec<Arc<dyn Service>>>,
    shutdown: CancellationToken,
}

impl ServicePort {
    pub fn new(port: u16, context: Arc<ServerContext>) -> Arc<Self> {
        Arc::new(Self {
            port,
            context,
            services: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn add_service(&self, service: Arc<dyn Service>) -> Result<()> {
        let mut services = self.services.write();
        if services.iter().any(|s| s.server_sends_first()) {
            return Err(ServerError::ServiceConflict {
                port: self.port,
                service: service.name(),
                reason: "port is owned by a service that sends first",
            });
        }
        if service.server_sends_first() && !services.is_empty() {
            return Err(ServerError::ServiceConflict {
                port: self.port,
                service: service.name(),
                reason: "a service that sends first needs its own port",
            });
        }
        if services
            .iter()
            .any(|s| s.protocol_identifier() == service.protocol_identifier())
        {
            return Err(ServerError::ServiceConflict {
                port: self.port,
                service: service.name(),
                reason: "protocol identifier already taken",
            });
        }
        services.push(service);
        Ok(())
    }

    pub fn is_single_socket(&self) -> bool {
        let services = self.services.read();
        services.len() == 1 && services[0].server_sends_first()
    }

    pub fn protocol_names(&self) -> String {
        self.services
            .read()
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Protocol for a port whose only service talks first
    pub fn make_sending_protocol(&self, connection: &Arc<Connection>) -> Option<Arc<dyn Protocol>> {
        let services = self.services.read();
        match services.as_slice() {
            [service] if service.server_sends_first() => Some(service.make_protocol(connection)),
            _ => None,
        }
    }

    /// Picks a service from the selector byte of a first frame
    pub fn make_protocol(
        &self,
        connection: &Arc<Connection>,
        checksummed: bool,
        msg: &mut InputMessage,
    ) -> Option<Arc<dyn Protocol>> {
        let selector = msg.get_u8().ok()?;
        let services = self.services.read();
        let service = services.iter().find(|service| {
            service.protocol_identifier() == selector && (checksummed || !service.is_checksummed())
        });

        match service {
            Some(service) => {
                trace!("{} selected {} protocol", connection.peer(), service.name());
                Some(service.make_protocol(connection))
            }
            None => {
                debug!(
                    "{} sent unknown protocol selector 0x{:02X} on port {}",
                    connection.peer(),
                    selector,
                    self.port
                );
                None
            }
        }
    }

    pub async fn bind(&self, ip: IpAddr) -> Result<TcpListener> {
        let addr = SocketAddr::new(ip, self.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(
            "{} listening on {}",
            self.protocol_names(),
            listener.local_addr().unwrap_or(addr)
        );
        Ok(listener)
    }

    /// Accepts connections until stopped
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.on_accept(stream, peer),
                Err(e) => {
                    error!("Accept failed on port {}: {}", self.port, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        debug!("Stopped accepting on port {}", self.port);
    }

    fn on_accept(self: &Arc<Self>, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let connections = &self.context.connections;
        if !connections.accept_connection(peer.ip()) {
            debug!("Rejected connection from {}", peer);
            return;
        }

        let connection =
            connections.create_connection(&self.context, peer, Some(Arc::clone(self)));
        connection.accept(stream);
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// All service ports of one server
pub struct ServiceManager {
    context: Arc<ServerContext>,
    ports: Mutex<BTreeMap<u16, Arc<ServicePort>>>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceManager {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self {
            context,
            ports: Mutex::new(BTreeMap::new()),
            accept_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers a service on a port, creating the port on first use
    pub fn add<S: Service>(&self, port: u16, service: S) -> Result<()> {
        let mut ports = self.ports.lock();
        let service_port = ports
            .entry(port)
            .or_insert_with(|| ServicePort::new(port, Arc::clone(&self.context)));
        service_port.add_service(Arc::new(service))
    }

    pub fn is_empty(&self) -> bool {
        self.ports.lock().is_empty()
    }

    /// Binds every port and spawns its accept loop
    ///
    /// Returns the bound addresses keyed by configured port; a configured
    /// port of 0 binds an ephemeral one.
    pub async fn start(&self, ip: IpAddr) -> Result<BTreeMap<u16, SocketAddr>> {
        let ports: Vec<_> = self.ports.lock().values().cloned().collect();
        if ports.is_empty() {
            warn!("No services registered, nothing to listen on");
        }

        let listeners =
            future::try_join_all(ports.iter().map(|port| port.bind(ip))).await?;

        let mut bound = BTreeMap::new();
        let mut tasks = self.accept_tasks.lock();
        for (port, listener) in ports.into_iter().zip(listeners) {
            bound.insert(port.port(), listener.local_addr()?);
            tasks.push(tokio::spawn(port.run(listener)));
        }
        Ok(bound)
    }

    pub fn stop(&self) {
        for port in self.ports.lock().values() {
            port.stop();
        }
    }

    /// Waits for the accept loops to exit after [`ServiceManager::stop`]
    pub async fn join(&self) {
        let tasks: Vec<_> = self.accept_tasks.lock().drain(..).collect();
        for task in future::join_all(tasks).await {
            if let Err(e) = task {
                error!("Accept loop failed: {}", e);
            }
        }
    }
}
