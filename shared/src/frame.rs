//! Sealing and opening of whole frames.
//!
//! Layout on the wire, outermost first:
//! `len:u16 [checksum:u32] [xtea( inner_len:u16 payload padding )]`.

use crate::error::{Result, WireError};
use crate::message::{InputMessage, OutputBuffer};
use crate::xtea::{self, XteaKey};
use crate::{adler32, MAX_BODY_LENGTH};
use bytes::BytesMut;

/// Margin kept below `MAX_BODY_LENGTH` when validating incoming lengths.
const LENGTH_MARGIN: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOptions {
    pub xtea_key: Option<XteaKey>,
    pub checksum: bool,
}

/// Validates a decoded length prefix.
pub fn check_length(len: usize) -> Result<usize> {
    if len == 0 || len >= MAX_BODY_LENGTH - LENGTH_MARGIN {
        return Err(WireError::InvalidLength(len));
    }
    Ok(len)
}

/// Turns a written body into a complete frame in place.
pub fn seal(buffer: &mut OutputBuffer, options: &FrameOptions) -> Result<()> {
    if let Some(key) = &options.xtea_key {
        let inner = buffer.len() as u16;
        buffer.prepend(&inner.to_le_bytes())?;
        buffer.pad_to(xtea::BLOCK_SIZE);
        xtea::encrypt(buffer.body_mut(), key)?;
    }

    if options.checksum {
        let checksum = adler32(buffer.body());
        buffer.prepend(&checksum.to_le_bytes())?;
    }

    let len = buffer.len() as u16;
    buffer.prepend(&len.to_le_bytes())
}

/// Opens a frame body (length prefix already removed). Returns the message
/// positioned at the payload and whether a valid checksum was present.
pub fn open(body: BytesMut, xtea_key: Option<&XteaKey>) -> Result<(InputMessage, bool)> {
    let mut msg = InputMessage::new(body);
    let checksummed = msg.strip_checksum();
    if let Some(key) = xtea_key {
        msg.xtea_decrypt(key)?;
    }
    Ok((msg, checksummed))
}
