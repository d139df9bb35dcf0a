//! A single live connection.
//!
//! A [`Session`] is a cheap, cloneable handle. The connection itself is split
//! at open time: the write half is owned by a writer task fed from a bounded
//! outbound queue, the read half by the [`SessionReader`] handed to whoever
//! runs the receive loop. Nothing else touches the stream.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::{Frame, FrameCodec};
use crate::chat::Message;
use crate::config::SessionConfig;
use crate::{PeerchatError, Result};

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by the local relay server.
    Inbound,
    /// Opened with `/connect`.
    Outbound,
}

impl Direction {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Stream accepted, writer not running yet.
    #[default]
    Connecting,
    /// Frames can be sent and received.
    Open,
    /// `close()` was called; queued frames are being flushed.
    Closing,
    /// Connection released.
    Closed,
}

/// Pending outbound frames.
#[derive(Default)]
struct Outbox {
    frames: VecDeque<Frame>,
    /// Frames discarded since the last write because the queue was full.
    dropped: usize,
}

struct Inner {
    /// `address:port` of the remote end.
    addr: String,
    /// Display name assigned by the name exchange, if any.
    name: OnceLock<String>,
    peer_addr: SocketAddr,
    direction: Direction,
    opened_at: DateTime<Utc>,
    state: watch::Sender<SessionState>,
    outbox: Mutex<Outbox>,
    notify: Notify,
    capacity: usize,
    codec: FrameCodec,
    cancel: CancellationToken,
}

/// Handle to one live connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("direction", &self.inner.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Open a session over an established stream.
    ///
    /// Spawns the writer task and returns the handle together with the
    /// reader for the receive loop. Cancelling `cancel` (or calling
    /// [`Session::close`]) stops both.
    pub fn open(
        stream: TcpStream,
        direction: Direction,
        config: &SessionConfig,
        cancel: CancellationToken,
    ) -> Result<(Session, SessionReader)> {
        let peer_addr = stream.peer_addr()?;
        let addr = peer_addr.to_string();
        let codec = FrameCodec::new(config.max_payload_bytes);
        let (read_half, write_half) = stream.into_split();
        let (state, _) = watch::channel(SessionState::Connecting);

        let inner = Arc::new(Inner {
            addr: addr.clone(),
            name: OnceLock::new(),
            peer_addr,
            direction,
            opened_at: Utc::now(),
            state,
            outbox: Mutex::new(Outbox::default()),
            notify: Notify::new(),
            capacity: config.queue_capacity.max(1),
            codec: codec.clone(),
            cancel: cancel.clone(),
        });

        let writer = FramedWrite::new(write_half, codec.clone());
        tokio::spawn(write_loop(Arc::clone(&inner), writer, config.flush_timeout()));

        inner.state.send_replace(SessionState::Open);
        debug!("Opened {} session {}", direction.as_str(), addr);

        let reader = SessionReader {
            frames: FramedRead::new(read_half, codec),
            cancel,
        };
        Ok((Session { inner }, reader))
    }

    /// Get the session identifier.
    ///
    /// This is the assigned display name once there is one, otherwise the
    /// peer's `address:port`.
    pub fn id(&self) -> &str {
        self.inner
            .name
            .get()
            .map(String::as_str)
            .unwrap_or(&self.inner.addr)
    }

    /// Get the assigned display name.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.get().map(String::as_str)
    }

    /// Assign the display name. A session is named at most once.
    pub(crate) fn assign_name(&self, name: &str) -> Result<()> {
        self.inner.name.set(name.to_string()).map_err(|_| {
            PeerchatError::Validation(format!("session {} is already named", self.inner.addr))
        })
    }

    /// Whether both handles refer to the same connection.
    pub fn is_same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Get the peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Get the connection direction.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// When the session was opened.
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.inner.opened_at
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Whether frames can still be sent.
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Number of frames waiting to be written.
    pub async fn pending(&self) -> usize {
        self.inner.outbox.lock().await.frames.len()
    }

    /// Queue a relayed message for this peer.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.enqueue(Frame::Relay(message)).await
    }

    /// Queue a raw input line (chat text or command) for this peer.
    pub async fn send_input(&self, line: impl Into<String>) -> Result<()> {
        self.enqueue(Frame::Input(line.into())).await
    }

    async fn enqueue(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(PeerchatError::Send(format!(
                "session {} is closed",
                self.id()
            )));
        }
        self.inner.codec.validate(&frame)?;

        let mut outbox = self.inner.outbox.lock().await;
        if outbox.frames.len() >= self.inner.capacity {
            outbox.frames.pop_front();
            outbox.dropped += 1;
            debug!(
                "Outbound queue for {} full; dropped oldest frame ({} pending drops)",
                self.id(), outbox.dropped
            );
        }
        outbox.frames.push_back(frame);
        drop(outbox);

        self.inner.notify.notify_one();
        Ok(())
    }

    /// Close the session.
    ///
    /// Idempotent: closing a session that is already closing or closed does
    /// nothing.
    pub fn close(&self) {
        let changed = self.inner.state.send_if_modified(|state| match state {
            SessionState::Connecting | SessionState::Open => {
                *state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        });
        if changed {
            debug!("Closing session {}", self.id());
        }
        self.inner.cancel.cancel();
    }

    /// Wait until the connection has been released.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }
}

/// Receiving half of a session.
pub struct SessionReader {
    frames: FramedRead<OwnedReadHalf, FrameCodec>,
    cancel: CancellationToken,
}

impl SessionReader {
    /// Receive the next frame.
    ///
    /// Returns `None` at end of stream or once the session is closed.
    pub async fn recv(&mut self) -> Option<Result<Frame>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.frames.next() => item,
        }
    }
}

/// Take everything queued, prefixed by a drop warning if frames were lost.
async fn take_pending(inner: &Inner) -> Vec<Frame> {
    let mut outbox = inner.outbox.lock().await;
    let mut batch = Vec::with_capacity(outbox.frames.len() + 1);
    if outbox.dropped > 0 {
        match inner.direction {
            Direction::Inbound => batch.push(Frame::Relay(Message::system(format!(
                "{} message(s) dropped: you are receiving faster than you read",
                outbox.dropped
            )))),
            // A server would relay an input frame as chat, so only log it.
            Direction::Outbound => warn!(
                "Dropped {} outbound message(s) to {}",
                outbox.dropped, inner.addr
            ),
        }
        outbox.dropped = 0;
    }
    batch.extend(outbox.frames.drain(..));
    batch
}

async fn write_batch(
    writer: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
    batch: Vec<Frame>,
) -> Result<()> {
    for frame in batch {
        writer.feed(frame).await?;
    }
    writer.flush().await
}

async fn drain_and_close(
    inner: &Inner,
    writer: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
) -> Result<()> {
    let batch = take_pending(inner).await;
    write_batch(writer, batch).await?;
    writer.close().await
}

async fn write_loop(
    inner: Arc<Inner>,
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    flush_timeout: Duration,
) {
    let mut healthy = true;

    loop {
        let batch = take_pending(&inner).await;
        if batch.is_empty() {
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => break,
                _ = inner.notify.notified() => continue,
            }
        }

        let result = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            result = write_batch(&mut writer, batch) => result,
        };
        if let Err(e) = result {
            warn!("Write to {} failed: {}", inner.addr, e);
            healthy = false;
            break;
        }
    }

    if healthy {
        match tokio::time::timeout(flush_timeout, drain_and_close(&inner, &mut writer)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Final flush to {} failed: {}", inner.addr, e),
            Err(_) => debug!("Flush for {} did not finish before the deadline", inner.addr),
        }
    }

    inner.state.send_if_modified(|state| match state {
        SessionState::Closed => false,
        _ => {
            *state = SessionState::Closed;
            true
        }
    });
    inner.cancel.cancel();
    debug!("Session {} closed", inner.addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_config(queue_capacity: usize) -> SessionConfig {
        SessionConfig {
            queue_capacity,
            max_payload_bytes: 256,
            connect_timeout_secs: 1,
            flush_timeout_ms: 200,
            name_timeout_secs: 1,
        }
    }

    /// Returns the session for the accepted side and the raw client stream.
    async fn create_test_session(queue_capacity: usize) -> (Session, SessionReader, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let (session, reader) = Session::open(
            stream,
            Direction::Inbound,
            &test_config(queue_capacity),
            CancellationToken::new(),
        )
        .unwrap();
        (session, reader, client)
    }

    async fn read_frames(client: TcpStream, count: usize) -> Vec<Frame> {
        let mut frames = FramedRead::new(client, FrameCodec::new(256));
        let mut out = Vec::new();
        while out.len() < count {
            let next = tokio::time::timeout(Duration::from_secs(2), frames.next())
                .await
                .expect("timed out waiting for frame");
            match next {
                Some(Ok(frame)) => out.push(frame),
                other => panic!("unexpected read result: {other:?}"),
            }
        }
        out
    }

    #[tokio::test]
    async fn test_session_open_state() {
        let (session, _reader, client) = create_test_session(8).await;

        assert_eq!(session.state(), SessionState::Open);
        assert!(session.is_open());
        assert_eq!(session.direction(), Direction::Inbound);
        assert_eq!(session.id(), client.local_addr().unwrap().to_string());
        assert_eq!(session.name(), None);
    }

    #[tokio::test]
    async fn test_assign_name_once() {
        let (session, _reader, _client) = create_test_session(8).await;

        session.assign_name("alice").unwrap();
        assert_eq!(session.id(), "alice");
        assert_eq!(session.name(), Some("alice"));

        assert!(session.assign_name("bob").is_err());
        assert_eq!(session.id(), "alice");
    }

    #[tokio::test]
    async fn test_is_same() {
        let (a, _ra, _ca) = create_test_session(8).await;
        let (b, _rb, _cb) = create_test_session(8).await;

        assert!(a.is_same(&a.clone()));
        assert!(!a.is_same(&b));
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (session, _reader, client) = create_test_session(8).await;

        session.send(Message::chat("alice", "hello")).await.unwrap();
        session.send(Message::chat("alice", "again")).await.unwrap();

        let frames = read_frames(client, 2).await;
        match (&frames[0], &frames[1]) {
            (Frame::Relay(a), Frame::Relay(b)) => {
                assert_eq!(a.payload, "hello");
                assert_eq!(b.payload, "again");
            }
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recv_reads_peer_lines() {
        let (_session, mut reader, mut client) = create_test_session(8).await;

        tokio::io::AsyncWriteExt::write_all(&mut client, b"hi\n/list\n")
            .await
            .unwrap();

        let first = reader.recv().await.unwrap().unwrap();
        let second = reader.recv().await.unwrap().unwrap();
        assert_eq!(first, Frame::Input("hi".to_string()));
        assert_eq!(second, Frame::Input("/list".to_string()));
    }

    #[tokio::test]
    async fn test_recv_none_on_eof() {
        let (_session, mut reader, client) = create_test_session(8).await;
        drop(client);
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_protocol_error() {
        let (_session, mut reader, mut client) = create_test_session(8).await;

        tokio::io::AsyncWriteExt::write_all(&mut client, b"bad \\q\n")
            .await
            .unwrap();

        let result = reader.recv().await.unwrap();
        assert!(matches!(result, Err(PeerchatError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, mut reader, _client) = create_test_session(8).await;

        session.close();
        session.close();
        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("session did not close");
        session.close();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (session, _reader, _client) = create_test_session(8).await;

        session.close();
        let err = session.send(Message::chat("a", "late")).await.unwrap_err();
        assert!(matches!(err, PeerchatError::Send(_)));
    }

    #[tokio::test]
    async fn test_send_too_large() {
        let (session, _reader, _client) = create_test_session(8).await;

        let err = session
            .send(Message::chat("a", "x".repeat(257)))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerchatError::MessageTooLarge { .. }));
        assert_eq!(session.pending().await, 0);
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let (session, _reader, mut client) = create_test_session(8).await;

        session.close();
        session.closed().await;

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_flood_against_stalled_peer_drops_oldest() {
        const TOTAL: usize = 20_000;
        const CAPACITY: usize = 16;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let config = SessionConfig {
            queue_capacity: CAPACITY,
            max_payload_bytes: 4096,
            connect_timeout_secs: 1,
            flush_timeout_ms: 200,
            name_timeout_secs: 1,
        };
        let (session, _reader) =
            Session::open(stream, Direction::Inbound, &config, CancellationToken::new()).unwrap();

        // The client reads nothing until every send has returned, so the
        // socket buffers fill and the writer stalls.
        let filler = "x".repeat(2000);
        tokio::time::timeout(Duration::from_secs(10), async {
            for i in 0..TOTAL {
                session
                    .send(Message::chat("a", format!("{i} {filler}")))
                    .await
                    .unwrap();
            }
        })
        .await
        .expect("send blocked on a stalled peer");
        assert!(session.pending().await <= CAPACITY);

        let mut frames = FramedRead::new(client, FrameCodec::new(4096));
        let mut received = Vec::new();
        let mut reported_drops = 0;
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), frames.next())
                .await
                .expect("timed out waiting for frame");
            let message = match next {
                Some(Ok(Frame::Relay(message))) => message,
                other => panic!("unexpected read result: {other:?}"),
            };
            if message.kind == crate::chat::MessageKind::System {
                let count = message
                    .payload
                    .split(' ')
                    .next()
                    .and_then(|n| n.parse::<usize>().ok())
                    .expect("drop warning without a count");
                assert!(message.payload.contains("message(s) dropped"));
                reported_drops += count;
                continue;
            }
            let index: usize = message
                .payload
                .split(' ')
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap();
            received.push(index);
            if index == TOTAL - 1 {
                break;
            }
        }

        assert!(reported_drops > 0, "nothing was dropped");
        assert_eq!(received.len() + reported_drops, TOTAL);
        assert!(received.windows(2).all(|w| w[0] < w[1]));

        // What was still queued when the flood ended is the newest run.
        let tail = &received[received.len() - CAPACITY..];
        let expected: Vec<usize> = (TOTAL - CAPACITY..TOTAL).collect();
        assert_eq!(tail, expected.as_slice());
    }

    #[tokio::test]
    async fn test_cancel_token_closes_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let parent = CancellationToken::new();
        let (session, mut reader) = Session::open(
            stream,
            Direction::Inbound,
            &test_config(4),
            parent.child_token(),
        )
        .unwrap();

        parent.cancel();
        assert!(reader.recv().await.is_none());
        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("session did not close after parent cancel");
    }
}
