//! Client sessions for relaylink.
//!
//! Provides:
//! - `Session` - Connection lifecycle, identification, chat delivery and
//!   data-store proxy calls over one duplex channel
//! - `MessageListener` - Callback for inbound chat messages
//! - `SessionConfig` - Default host and port

pub mod config;
mod dispatcher;
pub mod error;
pub mod listener;
pub mod session;

pub use config::SessionConfig;
pub use error::{ConnectError, SessionError};
pub use listener::{ChannelListener, MessageListener};
pub use session::{Session, SessionState};

pub use relaylink_channel::{ReceiveError, TransmitError};
pub use relaylink_protocol::{ChatMessage, Record, Request, StoreReply, StoreRequest};
