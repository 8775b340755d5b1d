//! Session error types.

use relaylink_channel::{ReceiveError, TransmitError};
use thiserror::Error;

/// Why a connection could not be established.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Identification failed: {0}")]
    Identification(#[from] TransmitError),
}

/// Session error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: ConnectError,
    },
    #[error("Session is not connected")]
    NotConnected,
    #[error("Transmit error: {0}")]
    Transmit(#[from] TransmitError),
    #[error("Receive error: {0}")]
    Receive(#[from] ReceiveError),
    #[error("Protocol drift: expected {expected}, got {got}")]
    ProtocolDrift {
        expected: &'static str,
        got: &'static str,
    },
}

impl SessionError {
    /// Whether the session is no longer usable after this error.
    #[must_use]
    pub const fn is_session_lost(&self) -> bool {
        matches!(self, Self::Transmit(_) | Self::Receive(_))
    }
}
