//! Wire primitives shared by the server and the headless client.
//!
//! Everything in this crate is a pure transform over byte buffers: frame
//! sealing/opening, the Adler-32 checksum, XTEA and the raw RSA handshake
//! block. The length-prefix [`FrameCodec`] plugs into `tokio_util` framing
//! on either side; nothing here owns sockets or threads.

pub mod checksum;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod rsa;
pub mod xtea;

pub use checksum::adler32;
pub use codec::FrameCodec;
pub use error::{FrameError, WireError};
pub use frame::{seal, FrameOptions};
pub use message::{InputMessage, OutputBuffer};
pub use rsa::RsaKey;
pub use xtea::XteaKey;

use std::fmt;

/// Largest frame body the server accepts or produces.
pub const MAX_BODY_LENGTH: usize = 15340;
/// Size of the little-endian length prefix in front of every frame.
pub const HEADER_LENGTH: usize = 2;
pub const CHECKSUM_LENGTH: usize = 4;
/// Bytes reserved in front of an outgoing body for length, checksum and the
/// encrypted inner length.
pub const HEADER_ROOM: usize = HEADER_LENGTH + CHECKSUM_LENGTH + HEADER_LENGTH;
pub const RSA_BLOCK_SIZE: usize = 128;
/// Payload limit for one outgoing message, leaving space for the prepended
/// headers and cipher padding under the receiver's frame limit.
pub const MAX_PAYLOAD_LENGTH: usize = MAX_BODY_LENGTH - 32;

/// Half-extent of the map window a client renders around its player.
pub const VIEWPORT_X: i32 = 8;
pub const VIEWPORT_Y: i32 = 6;
pub const SURFACE_FLOOR: u8 = 7;

/// Protocol selector bytes carried by the first frame on a shared port.
pub const PROTOCOL_LOGIN: u8 = 0x01;
pub const PROTOCOL_GAME: u8 = 0x0A;
pub const PROTOCOL_ADMIN: u8 = 0xFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Position {
    pub x: u16,
    pub y: u16,
    pub z: u8,
}

impl Position {
    pub const fn new(x: u16, y: u16, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Tile distance used to rank creatures for eviction. Floors count as
    /// far away so a creature one floor down loses to one on the same floor.
    pub fn distance_to(&self, other: &Position) -> u32 {
        let dx = (self.x as i32 - other.x as i32).unsigned_abs();
        let dy = (self.y as i32 - other.y as i32).unsigned_abs();
        let dz = (self.z as i32 - other.z as i32).unsigned_abs();
        dx.max(dy) + dz * 15
    }

    /// Whether a client centred on `center` has this tile inside its map
    /// window. Lower floors are shifted diagonally like the client draws them.
    pub fn in_view_of(&self, center: &Position) -> bool {
        if center.z <= SURFACE_FLOOR {
            if self.z > SURFACE_FLOOR {
                return false;
            }
        } else if (center.z as i32 - self.z as i32).abs() > 2 {
            return false;
        }

        let offset = center.z as i32 - self.z as i32;
        let x = self.x as i32;
        let y = self.y as i32;
        let cx = center.x as i32;
        let cy = center.y as i32;

        x >= cx - VIEWPORT_X + offset
            && x <= cx + VIEWPORT_X + 1 + offset
            && y >= cy - VIEWPORT_Y + offset
            && y <= cy + VIEWPORT_Y + 1 + offset
    }

    /// Two tiles are neighbours when they share a floor and touch, including
    /// diagonally.
    pub fn is_adjacent(&self, other: &Position) -> bool {
        self.z == other.z
            && (self.x as i32 - other.x as i32).abs() <= 1
            && (self.y as i32 - other.y as i32).abs() <= 1
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// A tile plus the index of a thing inside that tile's visible stack, as
/// the client addresses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackPosition {
    pub pos: Position,
    pub index: u8,
}

impl StackPosition {
    pub const fn new(pos: Position, index: u8) -> Self {
        Self { pos, index }
    }
}

impl fmt::Display for StackPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pos, self.index)
    }
}
