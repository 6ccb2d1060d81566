//! Server assembly: builds the shared services once, binds the service ports
//! and coordinates an orderly shutdown.

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::dispatcher::FrameHook;
use crate::error::Result;
use crate::service::{Service, ServiceManager};
use log::{error, info};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

/// Main server coordinating the worker threads and the listening ports
pub struct Server {
    context: Arc<ServerContext>,
    services: ServiceManager,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let context = ServerContext::new(config)?;
        Ok(Server {
            services: ServiceManager::new(Arc::clone(&context)),
            context,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn add_service<S: Service>(&self, port: u16, service: S) -> Result<()> {
        self.services.add(port, service)
    }

    /// Registers a per-frame hook such as a world cache reset
    pub fn add_frame_hook(&self, hook: Weak<dyn FrameHook>) {
        self.context.dispatcher.register_hook(hook);
    }

    /// Cancelling the token makes [`Server::run`] shut down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts the worker threads and binds every service port
    ///
    /// Returns the bound addresses keyed by configured port.
    pub async fn start(&self) -> Result<BTreeMap<u16, SocketAddr>> {
        self.context.start()?;
        let bound = match self.services.start(self.context.config.ip).await {
            Ok(bound) => bound,
            Err(e) => {
                self.context.shutdown();
                return Err(e);
            }
        };

        for (port, addr) in &bound {
            info!("Port {} listening on {}", port, addr);
        }
        Ok(bound)
    }

    /// Runs until Ctrl+C or the shutdown token fires, then stops everything
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        info!("Server running, press Ctrl+C to stop");

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
                }
            }
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested");
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Stops accepting, closes connections, then stops the pool, the
    /// scheduler (pending tasks discarded) and the dispatcher (drained)
    pub async fn stop(&self) {
        self.services.stop();
        self.context.shutdown();
        self.services.join().await;

        let context = Arc::clone(&self.context);
        if let Err(e) = tokio::task::spawn_blocking(move || context.join()).await {
            error!("Worker threads did not stop cleanly: {}", e);
        }
        info!("Server stopped");
    }
}
