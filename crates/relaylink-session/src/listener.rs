//! Inbound chat message callbacks.

use relaylink_protocol::ChatMessage;
use tokio::sync::mpsc;

/// Receives chat messages pushed by the peer.
///
/// Called on the session's dispatcher task, which reads nothing else while
/// the callback runs. Implementations must return quickly; hand the message
/// to another task for anything slow.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: ChatMessage);
}

impl<F> MessageListener for F
where
    F: Fn(ChatMessage) + Send + Sync,
{
    fn on_message(&self, message: ChatMessage) {
        self(message);
    }
}

/// Listener that forwards messages into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ChatMessage>,
}

impl ChannelListener {
    /// Create a listener and the receiver its messages arrive on.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChatMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageListener for ChannelListener {
    fn on_message(&self, message: ChatMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("Listener receiver dropped, discarding message");
        }
    }
}
