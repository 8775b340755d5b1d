//! Channel error types.

use std::io;

use relaylink_protocol::CodecError;
use thiserror::Error;

/// Write failure. The channel must be treated as dead afterwards.
#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("Transmission failed: {0}")]
    Io(#[from] io::Error),
    #[error("Encoding failed: {0}")]
    Encode(#[from] CodecError),
    #[error("Channel closed")]
    Closed,
}

/// Read failure.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// The peer closed its side of the stream.
    #[error("End of stream")]
    EndOfStream,
    /// The channel was closed locally.
    #[error("Channel closed")]
    Closed,
    #[error("Receive failed: {0}")]
    Io(#[from] io::Error),
    #[error("Decoding failed: {0}")]
    Decode(#[from] CodecError),
}

impl ReceiveError {
    /// Whether the peer ended the stream, as opposed to a local or I/O failure.
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            Self::EndOfStream => true,
            Self::Io(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}
