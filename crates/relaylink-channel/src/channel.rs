//! Duplex channel over one physical connection.

use std::net::SocketAddr;

use relaylink_protocol::{Request, codec};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    net::{TcpStream, ToSocketAddrs},
    sync::{Mutex, watch},
};

use crate::error::{ReceiveError, TransmitError};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Inbound half plus the single peeked-but-not-consumed slot.
struct Inbound {
    /// `None` once the channel is closed.
    reader: Option<BufReader<BoxedReader>>,
    /// Bytes of a partially read frame. Survives a cancelled read.
    buffer: Vec<u8>,
    peeked: Option<Request>,
}

impl Inbound {
    async fn read_frame(&mut self) -> Result<Request, ReceiveError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(ReceiveError::Closed);
        };
        loop {
            let n = reader.read_until(codec::DELIMITER, &mut self.buffer).await?;
            if n == 0 && self.buffer.is_empty() {
                return Err(ReceiveError::EndOfStream);
            }
            if n != 0 && self.buffer.last() != Some(&codec::DELIMITER) {
                // Stream ended mid-frame; the next read reports EOF and
                // decodes whatever is left.
                continue;
            }

            let frame = std::mem::take(&mut self.buffer);
            if frame.trim_ascii().is_empty() {
                if n == 0 {
                    return Err(ReceiveError::EndOfStream);
                }
                continue;
            }

            let request = codec::decode(&frame)?;
            tracing::trace!(kind = request.kind(), "Received request");
            return Ok(request);
        }
    }
}

/// Wraps one physical connection's two directional streams.
///
/// Writes are serialized by the outbound lock. Reads are serialized by the
/// inbound lock, which also guards the peeked slot, so a frame is never torn
/// between two readers. `peek` followed by `receive` is not atomic across
/// callers.
///
/// [`close`](Self::close) unblocks any pending read or write promptly,
/// without waiting for the peer.
pub struct DuplexChannel {
    inbound: Mutex<Inbound>,
    outbound: Mutex<Option<BufWriter<BoxedWriter>>>,
    closed: watch::Sender<bool>,
    peer_addr: Option<SocketAddr>,
}

impl DuplexChannel {
    /// Create a channel from separate read and write halves.
    #[must_use]
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inbound: Mutex::new(Inbound {
                reader: Some(BufReader::new(Box::new(reader))),
                buffer: Vec::new(),
                peeked: None,
            }),
            outbound: Mutex::new(Some(BufWriter::new(Box::new(writer)))),
            closed,
            peer_addr: None,
        }
    }

    /// Create a channel over any bidirectional stream.
    #[must_use]
    pub fn from_stream(stream: impl AsyncRead + AsyncWrite + Send + 'static) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    /// Create a channel over an established TCP connection.
    #[must_use]
    pub fn from_tcp(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {e}");
        }
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let mut channel = Self::new(reader, writer);
        channel.peer_addr = peer_addr;
        channel
    }

    /// Open a TCP connection and wrap it.
    ///
    /// # Errors
    /// Returns error if the connection cannot be established.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_tcp(stream))
    }

    /// Remote address, when the channel runs over TCP.
    #[must_use]
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Serialize and write a request, then flush.
    ///
    /// # Errors
    /// Returns error on any I/O failure or if the channel is closed.
    pub async fn send(&self, request: &Request) -> Result<(), TransmitError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransmitError::Closed);
        }

        let frame = codec::encode(request)?;
        let write = async {
            let mut outbound = self.outbound.lock().await;
            let Some(writer) = outbound.as_mut() else {
                return Err(TransmitError::Closed);
            };
            writer.write_all(&frame).await?;
            writer.flush().await?;
            Ok::<_, TransmitError>(())
        };

        tokio::select! {
            result = write => {
                result?;
                tracing::trace!(kind = request.kind(), "Sent request");
                Ok(())
            }
            _ = closed.wait_for(|c| *c) => Err(TransmitError::Closed),
        }
    }

    /// Return the peeked request if there is one, otherwise read the next one.
    ///
    /// # Errors
    /// Returns [`ReceiveError::EndOfStream`] when the peer closed the stream,
    /// [`ReceiveError::Closed`] after a local close, or an I/O or decode error.
    pub async fn receive(&self) -> Result<Request, ReceiveError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(ReceiveError::Closed);
        }

        let mut inbound = tokio::select! {
            guard = self.inbound.lock() => guard,
            _ = closed.wait_for(|c| *c) => return Err(ReceiveError::Closed),
        };

        if let Some(request) = inbound.peeked.take() {
            return Ok(request);
        }

        tokio::select! {
            result = inbound.read_frame() => result,
            _ = closed.wait_for(|c| *c) => Err(ReceiveError::Closed),
        }
    }

    /// Look at the next request without consuming it.
    ///
    /// Reads and buffers one request if the slot is empty. The next
    /// `receive` returns the buffered request.
    ///
    /// # Errors
    /// Same as [`receive`](Self::receive).
    pub async fn peek(&self) -> Result<Request, ReceiveError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(ReceiveError::Closed);
        }

        let mut inbound = tokio::select! {
            guard = self.inbound.lock() => guard,
            _ = closed.wait_for(|c| *c) => return Err(ReceiveError::Closed),
        };

        if let Some(request) = &inbound.peeked {
            return Ok(request.clone());
        }

        let request = tokio::select! {
            result = inbound.read_frame() => result?,
            _ = closed.wait_for(|c| *c) => return Err(ReceiveError::Closed),
        };
        inbound.peeked = Some(request.clone());
        Ok(request)
    }

    /// Close the connection.
    ///
    /// Shuts down and releases the outbound stream, then releases the
    /// inbound one. Pending and future reads and writes fail with `Closed`.
    /// Teardown errors are logged and swallowed; calling this more than once
    /// is fine.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        let writer = self.outbound.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Error shutting down connection: {e}");
            }
        }

        // Pending reads saw the close signal and released the lock.
        let mut inbound = self.inbound.lock().await;
        inbound.reader = None;
        inbound.buffer.clear();
        inbound.peeked = None;
    }
}

impl std::fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
