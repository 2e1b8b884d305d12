//! Crate-wide error type.

use std::io;
use thiserror::Error;

/// Everything that can go wrong while talking to other nodes.
///
/// Transport failures (connect, timeout, truncated frames, simulated
/// partitions and drops) and protocol failures (frames that do not parse,
/// responses of an unexpected shape) share one enum; callers that only care
/// about "the peer did not answer usefully" treat every variant the same way.
#[derive(Error, Debug)]
pub enum DhtError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("simulated network partition")]
    Partition,
    #[error("simulated packet drop")]
    PacketDrop,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, DhtError>;
