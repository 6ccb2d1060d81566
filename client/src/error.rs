use shared::{FrameError, WireError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("connection closed by the server")]
    Closed,

    #[error("no reply within {0:?}")]
    Timeout(std::time::Duration),

    #[error("frame checksum mismatch")]
    Checksum,

    #[error("server refused: {0}")]
    Refused(String),

    #[error("unexpected reply opcode 0x{0:02X}")]
    Unexpected(u8),
}

impl From<FrameError> for ClientError {
    fn from(error: FrameError) -> Self {
        match error {
            FrameError::Io(e) => ClientError::Io(e),
            FrameError::Wire(e) => ClientError::Wire(e),
        }
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
