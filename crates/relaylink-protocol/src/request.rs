//! Wire requests exchanged between a session and its peer.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::crypto::{self, DecryptionError};

/// One row of a data-store result set.
pub type Record = Map<String, Value>;

/// Text shown in place of a chat payload that cannot be decrypted.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[unable to decrypt message]";

/// A unit of wire exchange.
///
/// Requests are immutable once built and carry no reference to the channel
/// they travel on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Declares who the client is, sent once right after connecting.
    Identification(Identification),
    /// Encrypted chat payload.
    ChatMessage(ChatMessage),
    /// Data-store operation proxied through the peer.
    StoreRequest(StoreRequest),
    /// Result rows answering a `find` store request.
    StoreReply(StoreReply),
    /// Courtesy notice sent before closing a connection.
    Disconnect,
}

impl Request {
    /// Wire tag of this variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Identification(_) => "identification",
            Self::ChatMessage(_) => "chat_message",
            Self::StoreRequest(_) => "store_request",
            Self::StoreReply(_) => "store_reply",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Identification handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identification {
    pub self_id: String,
    #[serde(default)]
    pub peer_id: Option<String>,
}

impl Identification {
    #[must_use]
    pub fn new(self_id: impl Into<String>, peer_id: Option<String>) -> Self {
        Self {
            self_id: self_id.into(),
            peer_id,
        }
    }
}

impl From<Identification> for Request {
    fn from(value: Identification) -> Self {
        Self::Identification(value)
    }
}

/// Encrypted chat payload.
///
/// `key_material` is the base64 key that decrypts `ciphertext`. It travels
/// inside the same message, see [`crate::crypto`] for what that implies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender_id: String,
    pub ciphertext: String,
    pub recipient_id: String,
    pub key_material: String,
    /// Creation time in Unix epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl ChatMessage {
    /// Encrypt `content` under a fresh key and build a message for sending.
    #[must_use]
    pub fn seal(
        sender_id: impl Into<String>,
        content: &str,
        recipient_id: impl Into<String>,
    ) -> Self {
        let sealed = crypto::encrypt_payload(content);
        Self {
            sender_id: sender_id.into(),
            ciphertext: sealed.ciphertext,
            recipient_id: recipient_id.into(),
            key_material: sealed.key_material,
            timestamp: now_millis(),
        }
    }

    /// Rebuild a message whose payload is already encrypted, e.g. to relay it.
    #[must_use]
    pub fn from_parts(
        sender_id: impl Into<String>,
        ciphertext: impl Into<String>,
        recipient_id: impl Into<String>,
        key_material: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            ciphertext: ciphertext.into(),
            recipient_id: recipient_id.into(),
            key_material: key_material.into(),
            timestamp,
        }
    }

    /// Decrypt the payload.
    ///
    /// # Errors
    /// Returns [`DecryptionError`] if the payload or key is malformed.
    pub fn try_content(&self) -> Result<String, DecryptionError> {
        crypto::decrypt_payload(&self.ciphertext, &self.key_material)
    }

    /// Decrypted payload, or [`UNDECRYPTABLE_PLACEHOLDER`] on failure.
    #[must_use]
    pub fn content(&self) -> String {
        self.try_content().unwrap_or_else(|e| {
            tracing::debug!("Failed to decrypt message from {}: {e}", self.sender_id);
            UNDECRYPTABLE_PLACEHOLDER.to_string()
        })
    }
}

impl From<ChatMessage> for Request {
    fn from(value: ChatMessage) -> Self {
        Self::ChatMessage(value)
    }
}

/// Data-store operation proxied through the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRequest {
    pub database: String,
    pub collection: String,
    /// Lowercase operation name, e.g. `find`, `insert`, `update`.
    #[serde(deserialize_with = "lowercase")]
    pub operation: String,
    #[serde(default)]
    pub filter: Option<Record>,
    #[serde(default)]
    pub update: Option<Record>,
    #[serde(default)]
    pub document: Option<Record>,
}

impl StoreRequest {
    /// Operation whose reply carries result rows.
    pub const FIND: &'static str = "find";

    #[must_use]
    pub fn new(
        database: impl Into<String>,
        collection: impl Into<String>,
        operation: &str,
        filter: Option<Record>,
        update: Option<Record>,
        document: Option<Record>,
    ) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            operation: operation.to_lowercase(),
            filter,
            update,
            document,
        }
    }

    #[must_use]
    pub fn find(database: impl Into<String>, collection: impl Into<String>, filter: Record) -> Self {
        Self::new(database, collection, Self::FIND, Some(filter), None, None)
    }

    #[must_use]
    pub fn insert(
        database: impl Into<String>,
        collection: impl Into<String>,
        document: Record,
    ) -> Self {
        Self::new(database, collection, "insert", None, None, Some(document))
    }

    #[must_use]
    pub fn update(
        database: impl Into<String>,
        collection: impl Into<String>,
        filter: Record,
        update: Record,
    ) -> Self {
        Self::new(database, collection, "update", Some(filter), Some(update), None)
    }

    #[must_use]
    pub fn delete(
        database: impl Into<String>,
        collection: impl Into<String>,
        filter: Record,
    ) -> Self {
        Self::new(database, collection, "delete", Some(filter), None, None)
    }

    /// Whether the peer answers this request with a [`StoreReply`].
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.operation == Self::FIND
    }
}

impl From<StoreRequest> for Request {
    fn from(value: StoreRequest) -> Self {
        Self::StoreRequest(value)
    }
}

/// Result rows for a `find`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreReply {
    #[serde(default)]
    pub rows: Vec<Record>,
}

impl StoreReply {
    #[must_use]
    pub const fn new(rows: Vec<Record>) -> Self {
        Self { rows }
    }
}

impl From<StoreReply> for Request {
    fn from(value: StoreReply) -> Self {
        Self::StoreReply(value)
    }
}

fn lowercase<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(|s| s.to_lowercase())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_seal_and_read_back() {
        let msg = ChatMessage::seal("alice", "hi bob", "bob");
        assert_eq!(msg.sender_id, "alice");
        assert_eq!(msg.recipient_id, "bob");
        assert!(!msg.key_material.is_empty());
        assert!(msg.timestamp > 0);
        assert_eq!(msg.content(), "hi bob");
    }

    #[test]
    fn test_sealed_messages_use_fresh_keys() {
        let a = ChatMessage::seal("alice", "same", "bob");
        let b = ChatMessage::seal("alice", "same", "bob");
        assert_ne!(a.key_material, b.key_material);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_relayed_message_keeps_key() {
        let original = ChatMessage::seal("alice", "relay me", "bob");
        let relayed = ChatMessage::from_parts(
            original.sender_id.clone(),
            original.ciphertext.clone(),
            original.recipient_id.clone(),
            original.key_material.clone(),
            original.timestamp,
        );
        assert_eq!(relayed, original);
        assert_eq!(relayed.content(), "relay me");
    }

    #[test]
    fn test_undecryptable_content_renders_placeholder() {
        let msg = ChatMessage::from_parts("alice", "garbage!", "bob", "also garbage", 0);
        assert!(msg.try_content().is_err());
        assert_eq!(msg.content(), UNDECRYPTABLE_PLACEHOLDER);
    }

    #[test]
    fn test_operation_is_lowercased() {
        let req = StoreRequest::new("x", "y", "FIND", None, None, None);
        assert_eq!(req.operation, "find");
        assert!(req.expects_reply());

        let insert = StoreRequest::insert("x", "y", record(json!({"a": 1})));
        assert!(!insert.expects_reply());
    }

    #[test]
    fn test_operation_is_lowercased_on_decode() {
        let parsed: Request = serde_json::from_value(json!({
            "type": "store_request",
            "database": "x",
            "collection": "y",
            "operation": "Update",
        }))
        .unwrap();

        let Request::StoreRequest(req) = parsed else {
            panic!("Wrong request type");
        };
        assert_eq!(req.operation, "update");
        assert_eq!(req.filter, None);
    }

    #[test]
    fn test_request_tags() {
        let json = serde_json::to_value(Request::Disconnect).unwrap();
        assert_eq!(json, json!({"type": "disconnect"}));

        let ident = Request::from(Identification::new("alice", None));
        assert_eq!(ident.kind(), "identification");
        let json = serde_json::to_value(&ident).unwrap();
        assert_eq!(json["type"], "identification");
        assert_eq!(json["self_id"], "alice");
    }

    #[test]
    fn test_store_reply_preserves_row_order() {
        let reply = Request::from(StoreReply::new(vec![
            record(json!({"name": "b", "n": 2})),
            record(json!({"name": "a", "nested": {"k": [1, 2]}})),
        ]));
        let text = serde_json::to_string(&reply).unwrap();
        let parsed: Request = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, reply);
    }

    #[test]
    fn test_chat_message_without_timestamp_decodes() {
        let parsed: Request = serde_json::from_value(json!({
            "type": "chat_message",
            "sender_id": "a",
            "ciphertext": "c",
            "recipient_id": "b",
            "key_material": "k",
        }))
        .unwrap();
        let Request::ChatMessage(msg) = parsed else {
            panic!("Wrong request type");
        };
        assert_eq!(msg.timestamp, 0);
    }
}
