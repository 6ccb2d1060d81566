use std::io;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of message: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("invalid frame length {0}")]
    InvalidLength(usize),
    #[error("message buffer overflow: {requested} bytes do not fit")]
    BufferOverflow { requested: usize },
    #[error("no header room left to prepend {0} bytes")]
    HeaderRoomExhausted(usize),
    #[error("encrypted body of {0} bytes is not a multiple of 8")]
    UnalignedCipherText(usize),
    #[error("decrypted length {inner} exceeds the {available} available bytes")]
    InnerLengthOverflow { inner: usize, available: usize },
    #[error("rsa block must be {expected} bytes, got {got}")]
    RsaBlockSize { expected: usize, got: usize },
    #[error("rsa block rejected: first decrypted byte is not zero")]
    RsaIntegrity,
    #[error("rsa block is out of range for the modulus")]
    RsaOutOfRange,
    #[error("rsa private exponent is not configured")]
    MissingPrivateKey,
    #[error("invalid rsa key: {0}")]
    InvalidKey(String),
}

/// Failure while reading frames off a stream
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

pub type Result<T, E = WireError> = std::result::Result<T, E>;
