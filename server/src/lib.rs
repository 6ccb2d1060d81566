//! # Tilegate Server Library
//!
//! Network core of a persistent tile-based multiplayer server. It accepts TCP
//! connections, frames and optionally encrypts the binary protocol, and
//! serializes every world-mutating piece of work onto a single execution
//! timeline. Game rules, persistence and map data live outside this crate
//! and plug in through the traits in [`world`].
//!
//! ## Core Responsibilities
//!
//! ### Connection Handling
//! Each accepted socket becomes a [`connection::Connection`] with its own
//! reader and writer task. Frames are length-prefixed, may carry an Adler-32
//! checksum and may be XTEA-encrypted once the RSA handshake supplied a key.
//!
//! ### Single Execution Timeline
//! The [`dispatcher::Dispatcher`] owns one worker thread that runs tasks in
//! FIFO order (urgent tasks jump the queue). The [`scheduler::Scheduler`]
//! feeds it time-delayed tasks. Protocols never touch game state from I/O
//! tasks; they post work to the dispatcher instead.
//!
//! ### Batched Output
//! Outgoing messages come from the [`output::OutputMessagePool`]. Messages
//! marked for auto-send are collected per dispatcher frame and flushed once
//! they grow large or old enough.
//!
//! ### Client Visibility
//! [`visibility::KnownCreatures`] tracks what each client believes about the
//! creatures around it and repairs the client when that belief drifts from
//! the server's map.
//!
//! ## Module Organization
//!
//! - `config`: TOML configuration with defaults and validation
//! - `context`: the shared services built once per server
//! - `dispatcher`, `scheduler`, `tasks`: the execution timeline
//! - `lifetime`: reference latches for deferred teardown
//! - `connection`, `connection_manager`: sockets, admission, framing
//! - `service`: listening ports and protocol selection
//! - `protocol`: login, game and admin protocols
//! - `output`: the output message pool
//! - `visibility`: known-creature bookkeeping
//! - `world`: interfaces to the game world
//! - `network`: server assembly and shutdown
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::load("server.toml")?;
//!     let server = Server::new(config)?;
//!
//!     // Services are registered here, e.g.
//!     // server.add_service(7171, LoginService::new(backend))?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod lifetime;
pub mod network;
pub mod output;
pub mod protocol;
pub mod scheduler;
pub mod service;
pub mod tasks;
#[cfg(test)]
mod testing;
pub mod visibility;
pub mod world;

pub use config::ServerConfig;
pub use context::ServerContext;
pub use error::{Result, ServerError};
pub use network::Server;
