//! # Tilegate Client Library
//!
//! Headless implementation of the client side of the wire protocol. It is
//! what the integration tests drive the server with, and what the `client`
//! binary uses to log in or send admin commands from a terminal.
//!
//! Framing, checksums and ciphers come from the `shared` crate, so both ends
//! agree on the byte layout by construction.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::ProtocolClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = ProtocolClient::connect("127.0.0.1:7171").await?;
//!     let reply = client.login(860, "1", "secret").await?;
//!     for character in reply.characters {
//!         println!("{} on {} ({})", character.name, character.world, character.addr);
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod network;

pub use error::{ClientError, Result};
pub use network::{AdminHello, CharacterInfo, LoginReply, ProtocolClient};
