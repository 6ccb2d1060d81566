//! Shared services handed to every connection and protocol.

use crate::config::ServerConfig;
use crate::connection_manager::ConnectionManager;
use crate::dispatcher::{Dispatcher, FrameHook};
use crate::error::Result;
use crate::output::OutputMessagePool;
use crate::scheduler::Scheduler;
use log::info;
use shared::RsaKey;
use std::sync::{Arc, Weak};

/// Everything the network core needs, created once per server
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub rsa: Arc<RsaKey>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<Scheduler>,
    pub pool: Arc<OutputMessagePool>,
    pub connections: Arc<ConnectionManager>,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let rsa = Arc::new(config.rsa_key()?);
        let config = Arc::new(config);

        let dispatcher = Dispatcher::new();
        let scheduler = Scheduler::new(Arc::clone(&dispatcher));
        let pool = OutputMessagePool::new(Arc::clone(&dispatcher), Arc::clone(&scheduler));
        let connections = Arc::new(ConnectionManager::new(&config));

        let hook: Weak<dyn FrameHook> = Arc::downgrade(&pool) as Weak<dyn FrameHook>;
        dispatcher.register_hook(hook);

        Ok(Arc::new(Self {
            config,
            rsa,
            dispatcher,
            scheduler,
            pool,
            connections,
        }))
    }

    /// Starts the dispatcher and scheduler threads
    pub fn start(&self) -> Result<()> {
        self.dispatcher.start()?;
        self.scheduler.start()?;
        Ok(())
    }

    /// Closes every connection and stops the worker threads without waiting
    pub fn shutdown(&self) {
        info!(
            "Shutting down network core ({} open connection(s))",
            self.connections.len()
        );
        self.connections.close_all();
        self.pool.shutdown();
        self.scheduler.stop();
        self.dispatcher.stop();
    }

    /// Blocks until the worker threads have exited
    pub fn join(&self) {
        self.scheduler.wait_until_stopped();
        self.dispatcher.wait_until_stopped();
    }
}
