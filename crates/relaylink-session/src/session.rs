//! Client session: connection lifecycle and request orchestration.

use std::sync::{Arc, PoisonError, RwLock};

use relaylink_channel::{DuplexChannel, ReceiveError};
use relaylink_protocol::{ChatMessage, Identification, Record, Request, StoreRequest};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, oneshot, watch},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    config::SessionConfig,
    dispatcher::{Dispatcher, PendingReply, SharedListener, mark_inactive},
    error::{ConnectError, SessionError},
    listener::MessageListener,
};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No usable connection.
    Idle,
    /// Opening the connection and identifying.
    Connecting,
    /// Identified; `send` and `query` are allowed.
    Active,
    /// Tearing the connection down.
    Closing,
}

/// One live connection: the channel and its dispatcher task.
struct Link {
    id: Uuid,
    channel: Arc<DuplexChannel>,
    pending: PendingReply,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Link {
    /// Stop the dispatcher, close the channel and wait for the task to end.
    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.channel.close().await;
        if let Err(e) = self.task.await {
            tracing::error!(link_id = %self.id, "Dispatcher task failed: {e}");
        }
    }
}

/// Identity and connection, guarded together by the session lock.
#[derive(Default)]
struct LinkState {
    self_id: Option<String>,
    peer_id: Option<String>,
    link: Option<Link>,
}

/// Client session with one peer over one duplex channel.
///
/// All state-changing calls (`connect`, `send`, the write of `query`,
/// `close`, `reset`) run one at a time. Inbound traffic is read only by the
/// dispatcher task started on `connect`: chat messages go to the listener
/// and replies are handed to the waiting `query`.
///
/// Dropping the session stops its dispatcher and closes the connection
/// without sending a disconnect notice.
pub struct Session {
    config: SessionConfig,
    inner: Mutex<LinkState>,
    /// Serializes queries so at most one waits for a reply.
    query_gate: Mutex<()>,
    state: Arc<watch::Sender<SessionState>>,
    listener: SharedListener,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    /// Create an idle session.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            inner: Mutex::new(LinkState::default()),
            query_gate: Mutex::new(()),
            state: Arc::new(state),
            listener: Arc::new(RwLock::new(None)),
        }
    }

    /// Configuration used for unspecified host or port.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register the callback for inbound chat messages, replacing any
    /// previous one. Takes effect for the next message delivered.
    pub fn set_listener(&self, listener: impl MessageListener + 'static) {
        *self
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    /// Remove the listener. Later chat messages are logged and dropped.
    pub fn clear_listener(&self) {
        *self
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether `send` and `query` are currently allowed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Watch state transitions, e.g. to notice the peer closing the
    /// connection.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Identity declared on the last successful connect.
    pub async fn self_id(&self) -> Option<String> {
        self.inner.lock().await.self_id.clone()
    }

    /// Peer declared on the last successful connect.
    pub async fn peer_id(&self) -> Option<String> {
        self.inner.lock().await.peer_id.clone()
    }

    /// Connect, identify and start receiving.
    ///
    /// Anything left from a previous connection is torn down first, so this
    /// is safe to call again to switch identities. `None` (or port 0) falls
    /// back to the configured host and port.
    ///
    /// # Errors
    /// Returns [`SessionError::Connect`] if the connection cannot be opened
    /// or the identification cannot be written. The session stays idle.
    pub async fn connect(
        &self,
        host: Option<&str>,
        port: Option<u16>,
        self_id: &str,
        peer_id: Option<&str>,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;

        if inner.link.is_some() || inner.self_id.is_some() || self.state() != SessionState::Idle
        {
            self.teardown(&mut inner).await;
            inner.self_id = None;
            inner.peer_id = None;
        }

        let host = host
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(self.config.host.as_str());
        let port = port.filter(|p| *p > 0).unwrap_or(self.config.port);
        let addr = format!("{host}:{port}");

        self.state.send_replace(SessionState::Connecting);
        let channel = match open_identified(host, port, self_id, peer_id).await {
            Ok(channel) => Arc::new(channel),
            Err(source) => {
                self.state.send_replace(SessionState::Idle);
                return Err(SessionError::Connect { addr, source });
            }
        };

        let id = self.install(&mut inner, channel, self_id, peer_id);
        tracing::info!(link_id = %id, %addr, self_id, "Connected");
        Ok(())
    }

    /// Record the identity, mark the session active and start the
    /// dispatcher over an identified channel.
    fn install(
        &self,
        inner: &mut LinkState,
        channel: Arc<DuplexChannel>,
        self_id: &str,
        peer_id: Option<&str>,
    ) -> Uuid {
        inner.self_id = Some(self_id.to_string());
        inner.peer_id = peer_id.map(str::to_string);

        let id = Uuid::new_v4();
        let pending = PendingReply::default();
        let (shutdown, shutdown_rx) = oneshot::channel();

        // Active before the dispatcher starts, so an immediate failure
        // can flip it back.
        self.state.send_replace(SessionState::Active);
        let task = Dispatcher {
            link_id: id,
            channel: Arc::clone(&channel),
            listener: Arc::clone(&self.listener),
            pending: pending.clone(),
            state: Arc::clone(&self.state),
        }
        .spawn(shutdown_rx);

        inner.link = Some(Link {
            id,
            channel,
            pending,
            shutdown: Some(shutdown),
            task,
        });
        id
    }

    /// Encrypt `content` and send it to `recipient_id`.
    ///
    /// # Errors
    /// Returns [`SessionError::NotConnected`] if the session is not active,
    /// or [`SessionError::Transmit`] if the write fails. A failed write
    /// leaves the session inactive.
    pub async fn send(&self, content: &str, recipient_id: &str) -> Result<(), SessionError> {
        let inner = self.inner.lock().await;
        let (link, self_id) = self.active_link(&inner)?;

        let message = ChatMessage::seal(self_id, content, recipient_id);
        self.transmit(link, &message.into()).await
    }

    /// Proxy a data-store operation through the peer.
    ///
    /// For `find`, waits for the peer's reply and returns its rows. Other
    /// operations return `None` as soon as the request is written.
    ///
    /// # Errors
    /// Returns [`SessionError::NotConnected`] if the session is not active,
    /// [`SessionError::Transmit`] if the write fails,
    /// [`SessionError::Receive`] if the connection fails or closes before the
    /// reply arrives, or [`SessionError::ProtocolDrift`] if the peer answers
    /// with something other than a store reply.
    pub async fn query(&self, request: StoreRequest) -> Result<Option<Vec<Record>>, SessionError> {
        let _gate = self.query_gate.lock().await;

        let reply_rx = {
            let inner = self.inner.lock().await;
            let (link, _) = self.active_link(&inner)?;

            let reply_rx = if request.expects_reply() {
                // `None` if the dispatcher stopped since the state check.
                Some(link.pending.register().ok_or(SessionError::NotConnected)?)
            } else {
                None
            };
            tracing::debug!(
                database = %request.database,
                collection = %request.collection,
                operation = %request.operation,
                "Sending store request"
            );
            self.transmit(link, &request.into()).await?;
            reply_rx
        };

        // Wait outside the session lock so `close` can always proceed.
        let Some(reply_rx) = reply_rx else {
            return Ok(None);
        };

        match reply_rx.await {
            Ok(Ok(Request::StoreReply(reply))) => Ok(Some(reply.rows)),
            Ok(Ok(other)) => {
                tracing::warn!(kind = other.kind(), "Unexpected reply to store request");
                Err(SessionError::ProtocolDrift {
                    expected: "store_reply",
                    got: other.kind(),
                })
            }
            Ok(Err(e)) => Err(SessionError::Receive(e)),
            Err(_) => Err(SessionError::Receive(ReceiveError::Closed)),
        }
    }

    /// Send a disconnect notice, close the connection and stop receiving.
    ///
    /// Safe to call in any state. Teardown errors are logged and ignored.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner).await;
    }

    /// Close and forget the identity, ready for a connect as someone else.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner).await;
        inner.self_id = None;
        inner.peer_id = None;
    }

    fn active_link<'a>(&self, inner: &'a LinkState) -> Result<(&'a Link, &'a str), SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotConnected);
        }
        match (&inner.link, &inner.self_id) {
            (Some(link), Some(self_id)) => Ok((link, self_id.as_str())),
            _ => Err(SessionError::NotConnected),
        }
    }

    async fn transmit(&self, link: &Link, request: &Request) -> Result<(), SessionError> {
        if let Err(e) = link.channel.send(request).await {
            tracing::error!(link_id = %link.id, "Failed to send {}: {e}", request.kind());
            mark_inactive(&self.state);
            // Stops the dispatcher too; the link is cleaned up on close or
            // the next connect.
            link.channel.close().await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn teardown(&self, inner: &mut LinkState) {
        let previous = self.state();
        let Some(link) = inner.link.take() else {
            self.state.send_replace(SessionState::Idle);
            return;
        };

        self.state.send_replace(SessionState::Closing);
        if matches!(previous, SessionState::Active | SessionState::Connecting) {
            if let Err(e) = link.channel.send(&Request::Disconnect).await {
                tracing::debug!("Failed to send disconnect notice: {e}");
            }
        }

        let id = link.id;
        link.stop().await;
        self.state.send_replace(SessionState::Idle);
        tracing::info!(link_id = %id, "Session closed");
    }
}

/// Open the connection and write the identification.
async fn open_identified(
    host: &str,
    port: u16,
    self_id: &str,
    peer_id: Option<&str>,
) -> Result<DuplexChannel, ConnectError> {
    let channel = DuplexChannel::connect((host, port)).await?;
    let identification = Identification::new(self_id, peer_id.map(str::to_string));
    if let Err(e) = channel.send(&identification.into()).await {
        channel.close().await;
        return Err(e.into());
    }
    Ok(channel)
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    };

    use tokio::io::{AsyncWrite, DuplexStream};
    use tokio_test::assert_err;

    use super::*;

    /// Writer whose every operation fails, like a connection reset by the peer.
    struct ResetWriter;

    impl AsyncWrite for ResetWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }
    }

    /// An active session whose writes fail. Keep the returned stream alive so
    /// the dispatcher keeps waiting for input.
    async fn session_with_dead_writer() -> (Session, DuplexStream) {
        let (reader, peer) = tokio::io::duplex(1024);
        let session = Session::default();
        let channel = Arc::new(DuplexChannel::new(reader, ResetWriter));
        {
            let mut inner = session.inner.lock().await;
            session.install(&mut inner, channel, "alice", Some("bob"));
        }
        assert!(session.is_active());
        (session, peer)
    }

    #[tokio::test]
    async fn test_new_session_is_idle() {
        let session = Session::default();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_active());
        assert_eq!(session.self_id().await, None);
        assert_eq!(session.config().port, 3000);
    }

    #[tokio::test]
    async fn test_send_and_query_require_connection() {
        let session = Session::default();

        let err = assert_err!(session.send("hi", "bob").await);
        assert!(matches!(err, SessionError::NotConnected));
        assert!(!err.is_session_lost());

        let err = assert_err!(
            session
                .query(StoreRequest::find("db", "users", Record::new()))
                .await
        );
        assert!(matches!(err, SessionError::NotConnected));
    }

    #[tokio::test]
    async fn test_close_and_reset_from_idle_are_noops() {
        let session = Session::default();
        session.close().await;
        session.reset().await;
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_session_idle() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let session = Session::default();
        let err = assert_err!(
            session
                .connect(Some("127.0.0.1"), Some(port), "alice", Some("bob"))
                .await
        );
        match err {
            SessionError::Connect { addr, source } => {
                assert_eq!(addr, format!("127.0.0.1:{port}"));
                assert!(matches!(source, ConnectError::Io(_)));
            }
            other => panic!("Wrong error: {other}"),
        }
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.self_id().await, None);
    }

    #[tokio::test]
    async fn test_failed_send_deactivates_session() {
        let (session, _peer) = session_with_dead_writer().await;

        let err = assert_err!(session.send("hi", "bob").await);
        assert!(matches!(err, SessionError::Transmit(_)));
        assert!(err.is_session_lost());
        assert_eq!(session.state(), SessionState::Idle);

        let err = assert_err!(session.send("again", "bob").await);
        assert!(matches!(err, SessionError::NotConnected));

        session.close().await;
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_failed_query_write_deactivates_session() {
        let (session, _peer) = session_with_dead_writer().await;

        let err = assert_err!(
            session
                .query(StoreRequest::find("db", "users", Record::new()))
                .await
        );
        assert!(matches!(err, SessionError::Transmit(_)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&SessionState::Active).unwrap();
        assert_eq!(json, "\"active\"");
    }
}
