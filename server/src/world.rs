//! Interfaces the network core expects from the game world
//!
//! The core never owns game state. Protocols call into these traits (always
//! on the dispatcher thread, except for the pure credential checks) and the
//! world calls back through the protocol's send methods.

use crate::protocol::game::ProtocolGame;
use shared::{OutputBuffer, Position, WireError};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

pub type CreatureId = u32;

/// One entry of a tile's visible stack, bottom first
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileThing {
    /// An item, already encoded the way the client expects it
    Item(Vec<u8>),
    Creature(CreatureId),
}

/// Read access to the map as one player sees it
pub trait WorldView: Send + Sync {
    /// Things on the tile, or `None` where there is no tile at all
    fn tile_things(&self, viewer: CreatureId, pos: &Position) -> Option<Vec<TileThing>>;

    fn creature_position(&self, creature: CreatureId) -> Option<Position>;

    fn can_see_creature(&self, viewer: CreatureId, creature: CreatureId) -> bool;

    /// Writes the creature body that follows the known/unknown header
    fn write_creature(
        &self,
        viewer: CreatureId,
        creature: CreatureId,
        known: bool,
        out: &mut OutputBuffer,
    ) -> Result<(), WireError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameLogin {
    pub ip: IpAddr,
    pub os: u16,
    pub version: u16,
    pub gamemaster: bool,
    pub account: String,
    pub character: String,
    pub password: String,
}

/// The running game as seen from the game protocol
pub trait GameBackend: WorldView {
    /// Places the character in the world; the error text is shown to the client
    fn login(&self, client: Arc<ProtocolGame>, request: GameLogin) -> Result<CreatureId, String>;

    fn logout(&self, player: CreatureId);

    fn handle_packet(
        &self,
        client: &Arc<ProtocolGame>,
        player: CreatureId,
        opcode: u8,
        msg: shared::InputMessage,
    );

    /// The player's connection went away without a logout
    fn client_detached(&self, player: CreatureId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub ip: IpAddr,
    pub os: u16,
    pub version: u16,
    pub account: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterEntry {
    pub name: String,
    pub world: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CharacterList {
    pub characters: Vec<CharacterEntry>,
    pub premium_days: u16,
}

pub trait LoginBackend: Send + Sync {
    fn authenticate(&self, request: &LoginRequest) -> Result<CharacterList, String>;

    /// Message of the day as `(id, text)`
    fn motd(&self) -> Option<(u32, String)> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Broadcast(String),
    CloseServer,
    OpenServer,
    PayHouses,
    Shutdown,
    Kick(String),
    Save,
}

pub trait AdminBackend: Send + Sync {
    fn execute(&self, command: AdminCommand) -> Result<(), String>;
}
