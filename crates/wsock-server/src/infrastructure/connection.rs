//! A single accepted WebSocket connection.
//!
//! [`Connection`] is a cheap, cloneable handle.  The socket itself is owned by
//! one Tokio task per connection which:
//!
//! 1. reads whatever bytes the peer sends into an accumulating buffer,
//! 2. recognises the HTTP Upgrade request and answers `101 Switching Protocols`,
//! 3. decodes every complete frame in the buffer and hands text payloads to
//!    the registered observers, in registration order,
//! 4. writes frames queued by [`Connection::send`], in the order they were queued.
//!
//! # Why a buffer is needed
//!
//! TCP is a stream protocol.  A single `read()` may return half a frame, or
//! the Upgrade request followed by the first two frames.  Bytes are therefore
//! appended to `recv_buf` and decoded in a loop until
//! [`FrameError::Incomplete`] says more data is needed.
//!
//! # Why does `send` queue instead of writing?
//!
//! Observers run synchronously on the connection task, so a reply sent from an
//! observer cannot await the socket.  `send` encodes the frame and pushes it on
//! a bounded channel; the same task drains that channel between reads, so
//! writes are never interleaved and never reordered.  A peer that stops
//! reading fills the channel, and further `send` calls fail with
//! [`ConnectionError::Backpressure`] instead of growing memory.  Callers that
//! need to know the bytes reached the socket use [`Connection::send_async`].
//!
//! # Oversized frames
//!
//! A frame declaring more than `max_frame_size` bytes is never buffered.  Its
//! bytes are dropped as they arrive, and decoding resumes at the next frame.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use wsock_core::{
    decode_frame, encode_text_frame, parse_upgrade_request, upgrade_response, FrameError,
    HandshakeError,
};

use crate::domain::{ConnectionId, ConnectionLimits, ConnectionState};

/// Callback invoked with the decoded text of every inbound message.
pub type MessageObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Runs once, on the connection task, right after the 101 response is written
/// and before the first frame is decoded.
pub(crate) type UpgradeHook = Box<dyn FnOnce(&Connection) + Send>;

/// Runs once when the connection task ends, whatever the reason.
pub(crate) type CloseHook = Box<dyn FnOnce(ConnectionId) + Send>;

/// Errors surfaced by [`Connection`] operations and by the receive task.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The outbound text exceeds `ConnectionLimits::max_message_size`.
    #[error("message of {len} bytes exceeds the {max}-byte limit")]
    MessageTooLong { len: usize, max: usize },

    /// `send` was called before the Upgrade handshake completed.
    #[error("connection has not completed the WebSocket handshake")]
    NotUpgraded,

    /// The connection task has ended.
    #[error("connection is closed")]
    Closed,

    /// The outbound queue is full because the peer is not reading.
    #[error("outbound queue is full ({capacity} frames)")]
    Backpressure { capacity: usize },

    /// A socket read or write failed.
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent bytes that cannot be decoded as a frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),
}

/// Hooks the server attaches to a connection it accepted.
#[derive(Default)]
pub(crate) struct LifecycleHooks {
    pub(crate) on_upgrade: Option<UpgradeHook>,
    pub(crate) on_close: Option<CloseHook>,
    /// Flips to `true` when the owning server shuts down.
    pub(crate) shutdown: Option<watch::Receiver<bool>>,
}

/// One frame waiting to be written, with an optional completion signal.
struct Outbound {
    bytes: Vec<u8>,
    done: Option<oneshot::Sender<io::Result<()>>>,
}

struct Shared {
    id: ConnectionId,
    peer_addr: SocketAddr,
    limits: ConnectionLimits,
    receiving: AtomicBool,
    state: watch::Sender<ConnectionState>,
    observers: RwLock<Vec<MessageObserver>>,
    outbound: mpsc::Sender<Outbound>,
    stop: Notify,
}

/// Handle to one accepted connection.
///
/// Cloning is cheap; all clones refer to the same socket task.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Spawns the receive task for `stream` and returns its handle.
    ///
    /// The task starts in [`ConnectionState::AwaitingHandshake`] and runs in a
    /// `connection` span nested under the current span.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S>(stream: S, peer_addr: SocketAddr, limits: ConnectionLimits) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn_with_hooks(
            stream,
            peer_addr,
            limits,
            LifecycleHooks::default(),
            &Span::current(),
        )
    }

    pub(crate) fn spawn_with_hooks<S>(
        stream: S,
        peer_addr: SocketAddr,
        limits: ConnectionLimits,
        hooks: LifecycleHooks,
        parent: &Span,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(limits.outbound_queue_size.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::AwaitingHandshake);
        let id = Uuid::new_v4();

        let conn = Self {
            shared: Arc::new(Shared {
                id,
                peer_addr,
                limits,
                receiving: AtomicBool::new(true),
                state: state_tx,
                observers: RwLock::new(Vec::new()),
                outbound: outbound_tx,
                stop: Notify::new(),
            }),
        };

        let span = info_span!(parent: parent, "connection", conn_id = %id, peer = %peer_addr);
        let task_conn = conn.clone();
        tokio::spawn(
            async move {
                task_conn.run(stream, outbound_rx, hooks).await;
            }
            .instrument(span),
        );

        conn
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    /// Unique identifier assigned at accept time.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Remote address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Returns `true` once the Upgrade handshake has completed and until the
    /// connection closes.
    pub fn has_upgraded(&self) -> bool {
        self.state().is_upgraded()
    }

    /// Returns `false` once [`stop`](Self::stop) has been requested.
    pub fn is_receiving(&self) -> bool {
        self.shared.receiving.load(Ordering::Acquire)
    }

    // ── Observers ─────────────────────────────────────────────────────────────

    /// Registers a text observer.
    ///
    /// Observers are invoked on the connection task, one message at a time,
    /// in the order they were registered.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Encodes `text` as a text frame and queues it for writing.
    ///
    /// Returns as soon as the frame is queued.  Frames are written in the
    /// order `send` was called.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::MessageTooLong`] if `text` exceeds the configured
    ///   maximum (65 535 UTF-8 bytes by default).  The connection is unaffected.
    /// - [`ConnectionError::NotUpgraded`] before the handshake completed.
    /// - [`ConnectionError::Backpressure`] if `outbound_queue_size` frames are
    ///   already waiting.  The connection is unaffected.
    /// - [`ConnectionError::Closed`] after the connection ended.
    pub fn send(&self, text: &str) -> Result<(), ConnectionError> {
        let bytes = self.encode_outbound(text)?;
        self.shared
            .outbound
            .try_send(Outbound { bytes, done: None })
            .map_err(|e| match e {
                TrySendError::Full(_) => ConnectionError::Backpressure {
                    capacity: self.shared.limits.outbound_queue_size,
                },
                TrySendError::Closed(_) => ConnectionError::Closed,
            })
    }

    /// Like [`send`](Self::send), but waits for room in the queue instead of
    /// failing with `Backpressure`, and resolves only after the frame has been
    /// written to the socket.
    ///
    /// # Errors
    ///
    /// The errors of [`send`](Self::send) except `Backpressure`, plus
    /// [`ConnectionError::Io`] if the write itself failed.
    pub async fn send_async(&self, text: &str) -> Result<(), ConnectionError> {
        let bytes = self.encode_outbound(text)?;
        let (done_tx, done_rx) = oneshot::channel();
        self.shared
            .outbound
            .send(Outbound {
                bytes,
                done: Some(done_tx),
            })
            .await
            .map_err(|_| ConnectionError::Closed)?;

        match done_rx.await {
            Ok(result) => result.map_err(ConnectionError::Io),
            // The task ended before it got to this frame.
            Err(_) => Err(ConnectionError::Closed),
        }
    }

    fn encode_outbound(&self, text: &str) -> Result<Vec<u8>, ConnectionError> {
        let max = self.shared.limits.max_message_size;
        if text.len() > max {
            return Err(ConnectionError::MessageTooLong {
                len: text.len(),
                max,
            });
        }
        match self.state() {
            ConnectionState::AwaitingHandshake => Err(ConnectionError::NotUpgraded),
            ConnectionState::Closed => Err(ConnectionError::Closed),
            ConnectionState::Upgraded => Ok(encode_text_frame(text)),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Asks the connection task to stop.
    ///
    /// A pending read or write is interrupted; frames already buffered are not
    /// dispatched.  No close frame is sent to the peer.
    pub fn stop(&self) {
        self.shared.receiving.store(false, Ordering::Release);
        // `notify_one` stores a permit if the task is not currently waiting.
        self.shared.stop.notify_one();
    }

    /// Waits until the handshake completes.
    ///
    /// Returns `true` once upgraded, or `false` if the connection closed first.
    pub async fn wait_until_upgraded(&self) -> bool {
        let mut rx = self.shared.state.subscribe();
        let upgraded = match rx
            .wait_for(|state| *state != ConnectionState::AwaitingHandshake)
            .await
        {
            Ok(state) => state.is_upgraded(),
            Err(_) => false,
        };
        upgraded
    }

    /// Waits until the connection task has ended.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `shared`, which `self` keeps alive.
        let _ = rx.wait_for(|state| state.is_closed()).await;
    }

    // ── Receive task ──────────────────────────────────────────────────────────

    async fn run<S>(
        self,
        stream: S,
        mut outbound_rx: mpsc::Receiver<Outbound>,
        mut hooks: LifecycleHooks,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        // Marks the connection Closed and fires `on_close` even if an
        // observer panics and unwinds this task.
        let _guard = CloseGuard {
            conn: self.clone(),
            on_close: hooks.on_close.take(),
        };

        let (mut reader, mut writer) = tokio::io::split(stream);
        let limits = self.shared.limits;
        let mut recv_buf: Vec<u8> = Vec::with_capacity(limits.read_buffer_size);
        let mut read_tmp = vec![0u8; limits.read_buffer_size.max(1)];
        // Bytes of a refused frame still to be dropped from the stream.
        let mut discard: u64 = 0;
        let mut shutdown = hooks.shutdown.take();

        debug!("receive task started");

        let outcome: Result<(), ConnectionError> = loop {
            if !self.is_receiving() {
                debug!("receiving flag cleared");
                break Ok(());
            }

            tokio::select! {
                biased;

                _ = self.stop_requested(&mut shutdown) => {
                    debug!("stop requested");
                    break Ok(());
                }

                Some(outbound) = outbound_rx.recv() => {
                    let written = tokio::select! {
                        biased;
                        _ = self.stop_requested(&mut shutdown) => None,
                        result = writer.write_all(&outbound.bytes) => Some(result),
                    };
                    let Some(written) = written else {
                        debug!("stop requested during write");
                        break Ok(());
                    };
                    match written {
                        Ok(()) => {
                            if let Some(done) = outbound.done {
                                let _ = done.send(Ok(()));
                            }
                        }
                        Err(e) => {
                            warn!("write to peer failed: {e}");
                            if let Some(done) = outbound.done {
                                let _ = done.send(Err(e));
                            }
                            break Err(ConnectionError::Closed);
                        }
                    }
                }

                read = reader.read(&mut read_tmp) => {
                    let n = match read {
                        Ok(0) => {
                            debug!("peer closed the TCP connection (EOF)");
                            break Ok(());
                        }
                        Ok(n) => n,
                        Err(e) => break Err(ConnectionError::Io(e)),
                    };

                    recv_buf.extend_from_slice(&read_tmp[..n]);

                    if let Err(e) = self
                        .process_buffer(&mut recv_buf, &mut discard, &mut writer, &mut hooks)
                        .await
                    {
                        break Err(e);
                    }
                }
            }
        };

        match outcome {
            Ok(()) => info!("connection closed"),
            Err(e) => warn!("connection closed with error: {e}"),
        }
    }

    /// Resolves when [`stop`](Self::stop) is called or the owning server shuts down.
    async fn stop_requested(&self, shutdown: &mut Option<watch::Receiver<bool>>) {
        let server_shutdown = async {
            match shutdown {
                Some(rx) => {
                    let server_dropped = rx.wait_for(|stopping| *stopping).await.is_err();
                    if server_dropped {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = self.shared.stop.notified() => {}
            _ = server_shutdown => {}
        }
    }

    /// Handles everything currently in `buf`: the handshake first, then frames.
    async fn process_buffer<W>(
        &self,
        buf: &mut Vec<u8>,
        discard: &mut u64,
        writer: &mut W,
        hooks: &mut LifecycleHooks,
    ) -> Result<(), ConnectionError>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.has_upgraded() {
            if !self.try_handshake(buf, writer).await? {
                return Ok(());
            }

            self.shared.state.send_replace(ConnectionState::Upgraded);
            info!("connection upgraded to WebSocket");

            if let Some(on_upgrade) = hooks.on_upgrade.take() {
                on_upgrade(self);
            }
        }

        self.dispatch_frames(buf, discard)
    }

    /// Attempts the Upgrade handshake on the buffered bytes.
    ///
    /// Returns `Ok(true)` once the 101 response has been written.  Anything
    /// that is not a usable Upgrade request is logged and dropped; the peer
    /// receives nothing.
    async fn try_handshake<W>(&self, buf: &mut Vec<u8>, writer: &mut W) -> Result<bool, ConnectionError>
    where
        W: AsyncWrite + Unpin,
    {
        while !buf.is_empty() {
            match parse_upgrade_request(buf) {
                Ok(request) => {
                    let response = upgrade_response(&request.accept_key());
                    writer.write_all(response.as_bytes()).await?;
                    writer.flush().await?;
                    buf.drain(..request.consumed);
                    debug!(path = %request.path, "sent 101 Switching Protocols");
                    return Ok(true);
                }
                Err(HandshakeError::Incomplete { available }) => {
                    if available > self.shared.limits.max_handshake_size {
                        warn!(
                            available,
                            "upgrade request exceeds {} bytes; discarding",
                            self.shared.limits.max_handshake_size
                        );
                        buf.clear();
                    }
                    return Ok(false);
                }
                Err(HandshakeError::NotGetRequest) => {
                    debug!(len = buf.len(), "discarding bytes that are not an upgrade request");
                    buf.clear();
                }
                Err(HandshakeError::Malformed { consumed }) => {
                    warn!("malformed upgrade request; discarding {consumed} bytes");
                    buf.drain(..consumed);
                }
                Err(HandshakeError::MissingKey { consumed }) => {
                    warn!("upgrade request without Sec-WebSocket-Key; not upgrading");
                    buf.drain(..consumed);
                }
            }
        }
        Ok(false)
    }

    /// Decodes and dispatches every complete frame at the front of `buf`.
    ///
    /// Frames that are not masked final text frames are logged and skipped.
    /// Frames over `max_frame_size` are skipped without being buffered:
    /// `discard` carries the bytes still to drop across reads.
    fn dispatch_frames(&self, buf: &mut Vec<u8>, discard: &mut u64) -> Result<(), ConnectionError> {
        let max_frame = self.shared.limits.max_frame_size;
        let mut offset = 0;

        let result = loop {
            if !self.is_receiving() {
                break Ok(());
            }

            if *discard > 0 {
                let available = (buf.len() - offset) as u64;
                let skipped = available.min(*discard);
                // `skipped` never exceeds the buffered length, so it fits in usize.
                offset += skipped as usize;
                *discard -= skipped;
                if *discard > 0 {
                    break Ok(());
                }
                debug!("finished skipping oversized frame");
                continue;
            }

            match decode_frame(&buf[offset..], max_frame) {
                Ok((frame, consumed)) => {
                    offset += consumed;
                    match frame.into_text() {
                        Ok(text) => {
                            debug!(len = text.len(), "dispatching text message");
                            self.dispatch(&text);
                        }
                        Err(e) => warn!("skipping frame: {e}"),
                    }
                }
                Err(FrameError::Incomplete { .. }) => break Ok(()),
                Err(e) => match e.discard_len() {
                    Some(len) => {
                        warn!("skipping frame: {e}");
                        *discard = len;
                    }
                    None => break Err(ConnectionError::Protocol(e)),
                },
            }
        };

        buf.drain(..offset);
        result
    }

    fn dispatch(&self, text: &str) {
        // Snapshot so observers may register further observers without deadlocking.
        let observers: Vec<MessageObserver> = self
            .shared
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for observer in &observers {
            observer(text);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Finalises a connection when its task ends.
struct CloseGuard {
    conn: Connection,
    on_close: Option<CloseHook>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let shared = &self.conn.shared;
        shared.receiving.store(false, Ordering::Release);
        shared.state.send_replace(ConnectionState::Closed);

        // Observers commonly capture a clone of their own connection; dropping
        // them here breaks that reference cycle.
        shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        if let Some(on_close) = self.on_close.take() {
            on_close(shared.id);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;
    use wsock_core::{encode_client_frame, Opcode};

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];
    const WAIT: Duration = Duration::from_secs(5);

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn upgrade_request() -> Vec<u8> {
        format!(
            "GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: {KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        )
        .into_bytes()
    }

    fn text_frame(text: &str) -> Vec<u8> {
        encode_client_frame(Opcode::Text, text.as_bytes(), true, MASK)
    }

    /// Spawns a connection over an in-memory duplex pipe and returns the
    /// client end plus a channel that receives every dispatched message.
    fn spawn_collecting(
        limits: ConnectionLimits,
    ) -> (Connection, DuplexStream, mpsc::UnboundedReceiver<String>) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let conn = Connection::spawn(server, peer(), limits);
        let (tx, rx) = mpsc::unbounded_channel();
        conn.on_message(move |text| {
            let _ = tx.send(text.to_string());
        });
        (conn, client, rx)
    }

    async fn read_response(client: &mut DuplexStream) -> String {
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).await.unwrap();
            response.push(byte[0]);
        }
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_writes_exact_101_response() {
        let (conn, mut client, _rx) = spawn_collecting(ConnectionLimits::default());

        client.write_all(&upgrade_request()).await.unwrap();
        let response = timeout(WAIT, read_response(&mut client)).await.unwrap();

        assert_eq!(
            response,
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
        );
        assert!(timeout(WAIT, conn.wait_until_upgraded()).await.unwrap());
        assert!(conn.has_upgraded());
    }

    #[tokio::test]
    async fn test_frames_are_not_dispatched_before_handshake() {
        let (conn, mut client, mut rx) = spawn_collecting(ConnectionLimits::default());

        // A frame before any Upgrade request is discarded.
        client.write_all(&text_frame("too early")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.has_upgraded());

        client.write_all(&upgrade_request()).await.unwrap();
        read_response(&mut client).await;
        client.write_all(&text_frame("on time")).await.unwrap();

        let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, "on time");
    }

    #[tokio::test]
    async fn test_missing_key_does_not_upgrade() {
        let (conn, mut client, _rx) = spawn_collecting(ConnectionLimits::default());

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(conn.state(), ConnectionState::AwaitingHandshake);

        // A proper request afterwards still upgrades the connection.
        client.write_all(&upgrade_request()).await.unwrap();
        assert!(timeout(WAIT, conn.wait_until_upgraded()).await.unwrap());
    }

    #[tokio::test]
    async fn test_pipelined_frames_after_request_are_dispatched_in_order() {
        let (_conn, mut client, mut rx) = spawn_collecting(ConnectionLimits::default());

        let mut burst = upgrade_request();
        burst.extend_from_slice(&text_frame("first"));
        burst.extend_from_slice(&text_frame("second"));
        client.write_all(&burst).await.unwrap();

        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "first");
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "second");
    }

    #[tokio::test]
    async fn test_frame_split_across_reads_is_reassembled() {
        let (_conn, mut client, mut rx) = spawn_collecting(ConnectionLimits::default());
        client.write_all(&upgrade_request()).await.unwrap();
        read_response(&mut client).await;

        let frame = text_frame("split across segments");
        let (head, tail) = frame.split_at(3);
        client.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(tail).await.unwrap();

        assert_eq!(
            timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
            "split across segments"
        );
    }

    #[tokio::test]
    async fn test_unsupported_frame_is_skipped_and_connection_stays_open() {
        let (conn, mut client, mut rx) = spawn_collecting(ConnectionLimits::default());
        client.write_all(&upgrade_request()).await.unwrap();
        read_response(&mut client).await;

        let mut burst = encode_client_frame(Opcode::Binary, &[1, 2, 3], true, MASK);
        burst.extend_from_slice(&text_frame("after binary"));
        client.write_all(&burst).await.unwrap();

        assert_eq!(
            timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
            "after binary"
        );
        assert!(conn.has_upgraded());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped_and_connection_stays_open() {
        let limits = ConnectionLimits {
            max_frame_size: 16,
            ..ConnectionLimits::default()
        };
        let (conn, mut client, mut rx) = spawn_collecting(limits);
        client.write_all(&upgrade_request()).await.unwrap();
        read_response(&mut client).await;

        // The refused frame arrives over two reads; the second read also
        // carries the frame that follows it.
        let oversized = text_frame(&"x".repeat(40));
        let (head, tail) = oversized.split_at(10);
        client.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut rest = tail.to_vec();
        rest.extend_from_slice(&text_frame("next"));
        client.write_all(&rest).await.unwrap();

        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "next");
        assert!(conn.has_upgraded());
    }

    #[tokio::test]
    async fn test_send_reports_backpressure_when_peer_stops_reading() {
        // A 64-byte pipe fills after the first reply; the client never reads it.
        let (mut client, server) = tokio::io::duplex(64);
        let limits = ConnectionLimits {
            outbound_queue_size: 2,
            ..ConnectionLimits::default()
        };
        let conn = Connection::spawn(server, peer(), limits);
        client.write_all(&upgrade_request()).await.unwrap();
        read_response(&mut client).await;
        assert!(timeout(WAIT, conn.wait_until_upgraded()).await.unwrap());

        let message = "m".repeat(100);
        let mut accepted = 0;
        let mut refused = None;
        for _ in 0..10 {
            match conn.send(&message) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    refused = Some(e);
                    break;
                }
            }
        }

        assert!(accepted <= 3, "accepted {accepted} sends");
        assert!(matches!(
            refused,
            Some(ConnectionError::Backpressure { capacity: 2 })
        ));
        assert!(conn.has_upgraded());
    }

    #[tokio::test]
    async fn test_server_shutdown_signal_closes_connection_awaiting_handshake() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let hooks = LifecycleHooks {
            shutdown: Some(shutdown_rx),
            ..LifecycleHooks::default()
        };
        let conn = Connection::spawn_with_hooks(
            server,
            peer(),
            ConnectionLimits::default(),
            hooks,
            &Span::current(),
        );

        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.state(), ConnectionState::AwaitingHandshake);

        shutdown_tx.send_replace(true);

        timeout(WAIT, conn.closed()).await.unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(timeout(WAIT, client.read(&mut byte)).await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_signal_raised_before_spawn_still_stops_task() {
        let (_client, server) = tokio::io::duplex(1024);
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);
        let hooks = LifecycleHooks {
            shutdown: Some(shutdown_rx),
            ..LifecycleHooks::default()
        };

        let conn = Connection::spawn_with_hooks(
            server,
            peer(),
            ConnectionLimits::default(),
            hooks,
            &Span::current(),
        );

        timeout(WAIT, conn.closed()).await.unwrap();
        assert!(!conn.has_upgraded());
    }

    #[tokio::test]
    async fn test_send_reply_from_observer() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut client = client;
        let conn = Connection::spawn(server, peer(), ConnectionLimits::default());
        let replier = conn.clone();
        conn.on_message(move |text| {
            replier.send(&format!("echo:{text}")).unwrap();
        });

        client.write_all(&upgrade_request()).await.unwrap();
        read_response(&mut client).await;
        client.write_all(&text_frame("hi")).await.unwrap();

        let mut reply = [0u8; 9];
        timeout(WAIT, client.read_exact(&mut reply)).await.unwrap().unwrap();
        assert_eq!(reply, [0x81, 7, b'e', b'c', b'h', b'o', b':', b'h', b'i']);
    }

    #[tokio::test]
    async fn test_send_before_upgrade_is_rejected() {
        let (conn, _client, _rx) = spawn_collecting(ConnectionLimits::default());
        assert!(matches!(conn.send("nope"), Err(ConnectionError::NotUpgraded)));
    }

    #[tokio::test]
    async fn test_send_over_limit_fails_without_closing() {
        let (conn, mut client, _rx) = spawn_collecting(ConnectionLimits::default());
        client.write_all(&upgrade_request()).await.unwrap();
        assert!(timeout(WAIT, conn.wait_until_upgraded()).await.unwrap());

        let result = conn.send(&"a".repeat(65_536));

        assert!(matches!(
            result,
            Err(ConnectionError::MessageTooLong {
                len: 65_536,
                max: 65_535
            })
        ));
        assert!(conn.has_upgraded());
        conn.send_async(&"a".repeat(65_535)).await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_eof_closes_connection() {
        let (conn, client, _rx) = spawn_collecting(ConnectionLimits::default());

        drop(client);

        timeout(WAIT, conn.closed()).await.unwrap();
        assert!(!conn.has_upgraded());
        assert!(!timeout(WAIT, conn.wait_until_upgraded()).await.unwrap());
        assert!(matches!(conn.send("late"), Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_stop_interrupts_pending_read() {
        let (conn, _client, _rx) = spawn_collecting(ConnectionLimits::default());

        conn.stop();

        timeout(WAIT, conn.closed()).await.unwrap();
        assert!(!conn.is_receiving());
    }
}
