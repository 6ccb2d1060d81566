//! Length-prefixed frame codec shared by the server and the client
//!
//! Every frame starts with a 2-byte little-endian body length. A length of
//! zero or one at/over the frame limit is a protocol violation and ends the
//! stream with an error. Outgoing frames are sealed before they reach the
//! encoder and already carry their prefix.

use crate::error::FrameError;
use crate::frame::check_length;
use crate::HEADER_LENGTH;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug)]
pub struct FrameCodec {
    state: DecoderState,
}

#[derive(Debug, Clone, Copy)]
enum DecoderState {
    Header,
    Body { len: usize },
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            state: DecoderState::Header,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.state {
            DecoderState::Header => {
                if src.remaining() < HEADER_LENGTH {
                    return Ok(None);
                }
                let len = check_length(src.get_u16_le() as usize)?;
                self.state = DecoderState::Body { len };
                len
            }
            DecoderState::Body { len } => len,
        };

        if src.remaining() < len {
            src.reserve(len - src.remaining());
            return Ok(None);
        }

        self.state = DecoderState::Header;
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(frame.len());
        dst.put(frame);
        Ok(())
    }
}
