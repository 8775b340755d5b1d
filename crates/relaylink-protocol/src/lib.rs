//! Wire vocabulary for relaylink sessions.
//!
//! Provides:
//! - `Request` - Tagged union of everything exchanged on a connection
//! - Per-message payload encryption for chat messages
//! - Newline-delimited JSON framing

pub mod codec;
pub mod crypto;
pub mod request;

pub use codec::CodecError;
pub use crypto::{DecryptionError, SealedPayload, decrypt_payload, encrypt_payload};
pub use request::{
    ChatMessage, Identification, Record, Request, StoreReply, StoreRequest,
    UNDECRYPTABLE_PLACEHOLDER,
};
