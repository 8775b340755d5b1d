//! Single reader of a session's inbound stream.
//!
//! The dispatcher task is the only caller of `receive` on a session's
//! channel. Chat messages go to the registered listener; anything else is
//! handed to the oldest query still in line for a reply, if there is one.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use relaylink_channel::{DuplexChannel, ReceiveError};
use relaylink_protocol::{ChatMessage, Request};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tracing::Instrument;
use uuid::Uuid;

use crate::{listener::MessageListener, session::SessionState};

/// Listener slot shared between a session and its dispatcher.
pub(crate) type SharedListener = Arc<RwLock<Option<Arc<dyn MessageListener>>>>;

pub(crate) type ReplyResult = Result<Request, ReceiveError>;

#[derive(Default)]
struct Waiters {
    queue: VecDeque<oneshot::Sender<ReplyResult>>,
    closed: bool,
}

/// Queries in line for a reply, oldest first.
///
/// Replies arrive in request order, so each one belongs to the front of the
/// queue. A query that gave up keeps its place; its reply is discarded when
/// it arrives instead of going to the query behind it.
#[derive(Clone, Default)]
pub(crate) struct PendingReply(Arc<Mutex<Waiters>>);

impl PendingReply {
    /// Join the line. Must happen before the request is written so a fast
    /// reply cannot slip past.
    ///
    /// Returns `None` once the dispatcher has stopped, since nothing would
    /// ever answer.
    pub(crate) fn register(&self) -> Option<oneshot::Receiver<ReplyResult>> {
        let mut waiters = self.lock();
        if waiters.closed {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        waiters.queue.push_back(tx);
        Some(rx)
    }

    /// The waiter owed the next reply.
    fn next(&self) -> Option<oneshot::Sender<ReplyResult>> {
        self.lock().queue.pop_front()
    }

    /// Refuse new waiters and hand back those still in line.
    fn close(&self) -> VecDeque<oneshot::Sender<ReplyResult>> {
        let mut waiters = self.lock();
        waiters.closed = true;
        std::mem::take(&mut waiters.queue)
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Flip an active session to idle.
pub(crate) fn mark_inactive(state: &watch::Sender<SessionState>) {
    state.send_if_modified(|s| {
        if *s == SessionState::Active {
            *s = SessionState::Idle;
            true
        } else {
            false
        }
    });
}

/// Marks the session inactive however the dispatcher exits, panics included.
struct ExitGuard {
    state: Arc<watch::Sender<SessionState>>,
    pending: PendingReply,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        mark_inactive(&self.state);
        self.pending.close();
    }
}

pub(crate) struct Dispatcher {
    pub(crate) link_id: Uuid,
    pub(crate) channel: Arc<DuplexChannel>,
    pub(crate) listener: SharedListener,
    pub(crate) pending: PendingReply,
    pub(crate) state: Arc<watch::Sender<SessionState>>,
}

impl Dispatcher {
    /// Start the read loop. It stops when `shutdown` fires or its sender is
    /// dropped, or when the channel fails.
    pub(crate) fn spawn(self, shutdown: oneshot::Receiver<()>) -> JoinHandle<()> {
        let span = tracing::info_span!("dispatcher", link_id = %self.link_id);
        tokio::spawn(self.run(shutdown).instrument(span))
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let _guard = ExitGuard {
            state: Arc::clone(&self.state),
            pending: self.pending.clone(),
        };

        loop {
            let received = tokio::select! {
                result = self.channel.receive() => result,
                _ = &mut shutdown => {
                    tracing::debug!("Dispatcher stopped");
                    self.fail(ReceiveError::Closed);
                    return;
                }
            };

            match received {
                Ok(Request::ChatMessage(message)) => self.deliver(message),
                Ok(Request::Disconnect) => {
                    tracing::info!("Peer announced disconnect");
                    self.fail(ReceiveError::EndOfStream);
                    return;
                }
                Ok(other) => self.route_reply(other),
                Err(e) => {
                    match &e {
                        e if e.is_end_of_stream() => tracing::info!("Connection closed by peer"),
                        ReceiveError::Closed => tracing::debug!("Channel closed locally"),
                        e => tracing::error!("Error reading from peer: {e}"),
                    }
                    self.fail(e);
                    return;
                }
            }
        }
    }

    fn deliver(&self, message: ChatMessage) {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match listener {
            Some(listener) => listener.on_message(message),
            None => tracing::warn!(
                "No listener registered, dropping message from {}",
                message.sender_id
            ),
        }
    }

    fn route_reply(&self, request: Request) {
        let kind = request.kind();
        match self.pending.next() {
            Some(tx) => {
                if tx.send(Ok(request)).is_err() {
                    tracing::debug!(kind, "Discarding reply for a query that gave up");
                }
            }
            None => tracing::warn!(kind, "Ignoring unexpected request with no query waiting"),
        }
    }

    /// Mark the session inactive, then surface `error` to the query still
    /// waiting. Abandoned waiters are dropped.
    fn fail(&self, error: ReceiveError) {
        mark_inactive(&self.state);
        let waiting = self.pending.close().into_iter().find(|tx| !tx.is_closed());
        if let Some(tx) = waiting {
            let _ = tx.send(Err(error));
        }
    }
}
