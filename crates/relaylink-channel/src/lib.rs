//! Duplex request channel.
//!
//! Wraps one physical connection and exposes `send`, blocking `receive`,
//! and non-consuming `peek` of the next inbound request.

pub mod channel;
pub mod error;

pub use channel::DuplexChannel;
pub use error::{ReceiveError, TransmitError};
