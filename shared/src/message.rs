//! Cursor-style readers and writers for frame bodies.

use crate::error::{Result, WireError};
use crate::rsa::RsaKey;
use crate::xtea::{self, XteaKey};
use crate::{
    adler32, Position, CHECKSUM_LENGTH, HEADER_LENGTH, HEADER_ROOM, MAX_BODY_LENGTH,
    MAX_PAYLOAD_LENGTH, RSA_BLOCK_SIZE,
};
use bytes::BytesMut;

/// Filler written after the plaintext to reach the cipher block size.
const PADDING_BYTE: u8 = 0x33;

/// A received frame body with a read cursor.
#[derive(Debug, Clone, Default)]
pub struct InputMessage {
    buffer: BytesMut,
    position: usize,
}

impl InputMessage {
    pub fn new(buffer: BytesMut) -> Self {
        Self { buffer, position: 0 }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(BytesMut::from(data))
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn remaining_bytes(&self) -> &[u8] {
        &self.buffer[self.position..]
    }

    fn take(&mut self, count: usize) -> Result<&[u8]> {
        if self.remaining() < count {
            return Err(WireError::UnexpectedEnd {
                needed: count,
                remaining: self.remaining(),
            });
        }
        let start = self.position;
        self.position += count;
        Ok(&self.buffer[start..start + count])
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.take(count).map(|_| ())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn peek_u32(&self) -> Result<u32> {
        let bytes = self.remaining_bytes();
        if bytes.len() < 4 {
            return Err(WireError::UnexpectedEnd {
                needed: 4,
                remaining: bytes.len(),
            });
        }
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Length-prefixed string. Bytes that are not UTF-8 are replaced rather
    /// than rejected since clients send Latin-1 names.
    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_u16()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        self.take(count).map(|bytes| bytes.to_vec())
    }

    pub fn get_position(&mut self) -> Result<Position> {
        let x = self.get_u16()?;
        let y = self.get_u16()?;
        let z = self.get_u8()?;
        Ok(Position::new(x, y, z))
    }

    pub fn get_xtea_key(&mut self) -> Result<XteaKey> {
        Ok([self.get_u32()?, self.get_u32()?, self.get_u32()?, self.get_u32()?])
    }

    /// Consumes a leading checksum if it matches the rest of the body.
    /// Returns whether one was found; on mismatch nothing is consumed.
    pub fn strip_checksum(&mut self) -> bool {
        if self.remaining() < CHECKSUM_LENGTH {
            return false;
        }

        let received = match self.peek_u32() {
            Ok(value) => value,
            Err(_) => return false,
        };
        let body = &self.buffer[self.position + CHECKSUM_LENGTH..];
        if body.is_empty() || adler32(body) != received {
            return false;
        }

        self.position += CHECKSUM_LENGTH;
        true
    }

    /// Decrypts the 128-byte block at the cursor in place and consumes its
    /// zero marker byte.
    pub fn rsa_decrypt(&mut self, key: &RsaKey) -> Result<()> {
        if self.remaining() < RSA_BLOCK_SIZE {
            return Err(WireError::RsaBlockSize {
                expected: RSA_BLOCK_SIZE,
                got: self.remaining(),
            });
        }

        let start = self.position;
        key.decrypt_checked(&mut self.buffer[start..start + RSA_BLOCK_SIZE])?;
        self.position += 1;
        Ok(())
    }

    /// Decrypts everything after the cursor, then narrows the message to the
    /// plaintext length carried in the first two decrypted bytes.
    pub fn xtea_decrypt(&mut self, key: &XteaKey) -> Result<()> {
        let start = self.position;
        let body_len = self.remaining();
        if body_len == 0 || body_len % xtea::BLOCK_SIZE != 0 {
            return Err(WireError::UnalignedCipherText(body_len));
        }

        xtea::decrypt(&mut self.buffer[start..], key)?;

        let inner = self.get_u16()? as usize;
        if inner > self.remaining() {
            return Err(WireError::InnerLengthOverflow {
                inner,
                available: self.remaining(),
            });
        }

        let end = self.position + inner;
        self.buffer.truncate(end);
        Ok(())
    }
}

/// An outgoing frame under construction.
///
/// The body is written after `HEADER_ROOM` reserved bytes so the length,
/// checksum and encrypted inner length can be prepended without moving it.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    buffer: Vec<u8>,
    start: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        let mut buffer = Vec::with_capacity(HEADER_ROOM + MAX_BODY_LENGTH);
        buffer.resize(HEADER_ROOM, 0);
        Self {
            buffer,
            start: HEADER_ROOM,
        }
    }

    pub fn reset(&mut self) {
        self.buffer.truncate(HEADER_ROOM);
        self.buffer.iter_mut().for_each(|byte| *byte = 0);
        self.start = HEADER_ROOM;
    }

    /// Bytes from the current start, including anything already prepended.
    pub fn body(&self) -> &[u8] {
        &self.buffer[self.start..]
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.start..]
    }

    pub fn len(&self) -> usize {
        self.buffer.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops body bytes past `len`, undoing a partial write.
    pub fn truncate(&mut self, len: usize) {
        self.buffer.truncate(self.start + len);
    }

    /// Whether `count` more body bytes still fit in one frame.
    pub fn can_add(&self, count: usize) -> bool {
        self.buffer.len() - HEADER_ROOM + count <= MAX_PAYLOAD_LENGTH
    }

    fn reserve(&mut self, count: usize) -> Result<()> {
        if !self.can_add(count) {
            return Err(WireError::BufferOverflow { requested: count });
        }
        Ok(())
    }

    pub fn add_u8(&mut self, value: u8) -> Result<()> {
        self.reserve(1)?;
        self.buffer.push(value);
        Ok(())
    }

    pub fn add_u16(&mut self, value: u16) -> Result<()> {
        self.reserve(2)?;
        self.buffer.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn add_u32(&mut self, value: u32) -> Result<()> {
        self.reserve(4)?;
        self.buffer.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    pub fn add_string(&mut self, value: &str) -> Result<()> {
        let len = u16::try_from(value.len()).map_err(|_| WireError::BufferOverflow {
            requested: value.len(),
        })?;
        self.reserve(HEADER_LENGTH + value.len())?;
        self.buffer.extend_from_slice(&len.to_le_bytes());
        self.buffer.extend_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn add_position(&mut self, pos: &Position) -> Result<()> {
        self.reserve(5)?;
        self.buffer.extend_from_slice(&pos.x.to_le_bytes());
        self.buffer.extend_from_slice(&pos.y.to_le_bytes());
        self.buffer.push(pos.z);
        Ok(())
    }

    /// Pads the body with filler up to a multiple of `multiple`.
    pub(crate) fn pad_to(&mut self, multiple: usize) {
        let pad = (multiple - self.len() % multiple) % multiple;
        self.buffer.extend(std::iter::repeat(PADDING_BYTE).take(pad));
    }

    pub(crate) fn prepend(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.start {
            return Err(WireError::HeaderRoomExhausted(bytes.len()));
        }
        self.start -= bytes.len();
        let start = self.start;
        self.buffer[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_primitives() {
        let mut msg = InputMessage::from_slice(&[
            0x01, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0x03, 0x00, b'a', b'b', b'c',
        ]);

        assert_eq!(msg.get_u8().unwrap(), 0x01);
        assert_eq!(msg.get_u16().unwrap(), 0x1234);
        assert_eq!(msg.get_u32().unwrap(), 0x1234_5678);
        assert_eq!(msg.get_string().unwrap(), "abc");
        assert_eq!(msg.remaining(), 0);
    }

    #[test]
    fn test_read_past_end() {
        let mut msg = InputMessage::from_slice(&[0x01]);
        assert_eq!(
            msg.get_u16(),
            Err(WireError::UnexpectedEnd {
                needed: 2,
                remaining: 1
            })
        );
        assert_eq!(msg.position(), 0);
    }

    #[test]
    fn test_string_length_past_end() {
        let mut msg = InputMessage::from_slice(&[0x10, 0x00, b'x']);
        assert!(msg.get_string().is_err());
    }

    #[test]
    fn test_strip_valid_checksum() {
        let body = b"hello";
        let mut data = adler32(body).to_le_bytes().to_vec();
        data.extend_from_slice(body);

        let mut msg = InputMessage::from_slice(&data);
        assert!(msg.strip_checksum());
        assert_eq!(msg.remaining_bytes(), body);
    }

    #[test]
    fn test_forged_checksum_left_in_place() {
        let mut data = 0xDEAD_BEEFu32.to_le_bytes().to_vec();
        data.extend_from_slice(b"hello");

        let mut msg = InputMessage::from_slice(&data);
        assert!(!msg.strip_checksum());
        assert_eq!(msg.position(), 0);
        assert_eq!(msg.remaining(), 9);
    }

    #[test]
    fn test_short_body_has_no_checksum() {
        let mut msg = InputMessage::from_slice(&[1, 0, 0]);
        assert!(!msg.strip_checksum());
    }

    #[test]
    fn test_write_then_read_position() {
        let mut out = OutputBuffer::new();
        out.add_position(&Position::new(100, 200, 7)).unwrap();
        out.add_string("name").unwrap();

        let mut msg = InputMessage::from_slice(out.body());
        assert_eq!(msg.get_position().unwrap(), Position::new(100, 200, 7));
        assert_eq!(msg.get_string().unwrap(), "name");
    }

    #[test]
    fn test_output_overflow() {
        let mut out = OutputBuffer::new();
        let chunk = vec![0u8; 1000];
        while out.can_add(chunk.len()) {
            out.add_bytes(&chunk).unwrap();
        }
        assert!(matches!(
            out.add_bytes(&chunk),
            Err(WireError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn test_truncate_undoes_partial_write() {
        let mut out = OutputBuffer::new();
        out.add_u16(0x0102).unwrap();
        let mark = out.len();
        out.add_string("partial").unwrap();
        out.truncate(mark);

        assert_eq!(out.body(), &[0x02, 0x01]);
        out.add_u8(9).unwrap();
        assert_eq!(out.body(), &[0x02, 0x01, 9]);
    }

    #[test]
    fn test_reset_clears_body() {
        let mut out = OutputBuffer::new();
        out.add_u32(7).unwrap();
        out.prepend(&[1, 2]).unwrap();
        out.reset();

        assert!(out.is_empty());
        assert!(out.can_add(MAX_PAYLOAD_LENGTH));
        assert!(!out.can_add(MAX_PAYLOAD_LENGTH + 1));
    }

    #[test]
    fn test_prepend_limited_by_header_room() {
        let mut out = OutputBuffer::new();
        out.prepend(&[0u8; HEADER_ROOM]).unwrap();
        assert_eq!(
            out.prepend(&[0u8]),
            Err(WireError::HeaderRoomExhausted(1))
        );
    }
}
