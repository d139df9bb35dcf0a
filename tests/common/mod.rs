//! Test helpers for integration tests.
//!
//! Provides TestClient, test server startup, and helper functions.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use peerchat::config::{ServerConfig, SessionConfig};
use peerchat::chat::{NAME_PROMPT, WELCOME_PREFIX};
use peerchat::{Frame, FrameCodec, HookChain, Message, MessageKind, RelayServer};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Display name of the local user on test servers.
pub const HOST_NAME: &str = "host";

/// How long to wait before concluding nothing else is coming.
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

/// Raw peer speaking the wire protocol.
pub struct TestClient {
    framed: Framed<TcpStream, FrameCodec>,
    name: String,
}

impl TestClient {
    /// Connect to the server at the given address.
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, FrameCodec::default()),
            name: String::new(),
        })
    }

    /// Connect, pick `name` and consume the welcome message.
    pub async fn join(addr: SocketAddr, name: &str) -> Self {
        let mut client = Self::connect(addr).await.expect("connect failed");
        let prompt = client.recv().await.expect("no name prompt");
        assert_eq!(prompt.payload, NAME_PROMPT);

        let reply = client.pick_name(name).await.expect("no reply to name");
        assert_eq!(reply.payload, format!("{WELCOME_PREFIX} {name}!"));
        client
    }

    /// Answer the name prompt and return the server's reply.
    pub async fn pick_name(&mut self, name: &str) -> Option<Message> {
        self.send_line(name).await.expect("send failed");
        let reply = self.recv().await?;
        assert_eq!(reply.kind, MessageKind::System);
        if reply.payload.starts_with(WELCOME_PREFIX) {
            self.name = name.to_string();
        }
        Some(reply)
    }

    /// Name the server knows this client by.
    pub fn id(&self) -> String {
        self.name.clone()
    }

    /// Send one input line.
    pub async fn send_line(&mut self, line: &str) -> peerchat::Result<()> {
        self.framed.send(Frame::Input(line.to_string())).await
    }

    /// Send raw bytes, bypassing the codec.
    pub async fn send_raw(&mut self, data: &[u8]) -> std::io::Result<()> {
        let stream = self.framed.get_mut();
        stream.write_all(data).await?;
        stream.flush().await
    }

    /// Receive the next relayed message.
    pub async fn recv(&mut self) -> Option<Message> {
        self.recv_timeout(DEFAULT_TIMEOUT).await
    }

    /// Receive the next relayed message, or `None` on timeout or EOF.
    pub async fn recv_timeout(&mut self, duration: Duration) -> Option<Message> {
        match timeout(duration, self.framed.next()).await {
            Ok(Some(Ok(Frame::Relay(message)))) => Some(message),
            Ok(Some(Ok(Frame::Input(line)))) => panic!("server sent an input frame: {line}"),
            Ok(Some(Err(e))) => panic!("protocol error from server: {e}"),
            Ok(None) | Err(_) => None,
        }
    }

    /// Receive the next chat message, skipping system notices.
    pub async fn recv_chat(&mut self) -> Option<Message> {
        loop {
            let message = self.recv().await?;
            if message.kind != MessageKind::System {
                return Some(message);
            }
        }
    }

    /// Assert that no chat message arrives within the quiet period.
    pub async fn expect_no_chat(&mut self) {
        while let Some(message) = self.recv_timeout(QUIET_PERIOD).await {
            assert_eq!(
                message.kind,
                MessageKind::System,
                "unexpected chat: {message:?}"
            );
        }
    }

    /// Wait for the server to close the connection.
    pub async fn expect_closed(&mut self) -> bool {
        let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, self.framed.next()).await {
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }
}

/// Server config bound to an ephemeral loopback port.
pub fn test_server_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        shutdown_timeout_ms: 1000,
        ..ServerConfig::default()
    }
}

/// Start a relay server with the given hooks.
pub async fn start_server(hooks: HookChain) -> (RelayServer, mpsc::UnboundedReceiver<Message>) {
    let (display, display_rx) = mpsc::unbounded_channel();
    let server = RelayServer::start(
        &test_server_config(),
        &SessionConfig::default(),
        HOST_NAME,
        hooks,
        display,
    )
    .await
    .expect("server failed to start");
    (server, display_rx)
}

/// Start a relay server without hooks.
pub async fn start_plain_server() -> (RelayServer, mpsc::UnboundedReceiver<Message>) {
    start_server(HookChain::new(Duration::from_millis(500))).await
}

/// Wait until the server has registered `count` peers.
pub async fn wait_for_peers(server: &RelayServer, count: usize) {
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    while server.peers().await.len() != count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {count} peers, have {:?}",
            server.peers().await
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
