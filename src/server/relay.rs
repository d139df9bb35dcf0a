//! Relay core and server loop.
//!
//! The accept loop turns connections into sessions and spawns one receive
//! task per peer. Every receive task feeds a single event channel, drained
//! by one dispatch task, so messages from one sender reach every other
//! session in the order they were read.
//!
//! A new peer is asked for a name first and only joins the chat once it
//! has picked one that is valid and not in use.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec::Frame;
use super::listener::{ConnectionPermit, RelayListener};
use super::registry::SessionRegistry;
use super::session::{Direction, Session, SessionReader};
use crate::bot::HookChain;
use crate::chat::{
    is_command, validate_name, Message, MessageKind, NAME_PROMPT, SYSTEM_SENDER, WELCOME_PREFIX,
};
use crate::config::{ServerConfig, SessionConfig};
use crate::{PeerchatError, Result};

/// Channel the relay core uses to show messages to the local user.
pub type DisplaySender = mpsc::UnboundedSender<Message>;

const EVENT_QUEUE: usize = 1024;

/// Lifecycle state of the relay server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Listening,
    Stopping,
}

/// Input to the dispatch task.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A peer session was registered.
    Joined(String),
    /// A peer session ended on its own.
    Left { id: String, reason: String },
    /// A line received from a peer, classified as chat or command.
    Inbound(Message),
    /// A chat line typed by the local user.
    Local(Message),
}

/// What a receive task needs from its server.
#[derive(Clone)]
struct PeerContext {
    registry: Arc<SessionRegistry>,
    events: mpsc::Sender<RelayEvent>,
    cancel: CancellationToken,
    /// Names a peer may not take: the host's and the hooks'.
    reserved: Arc<[String]>,
    name_timeout: Duration,
}

impl PeerContext {
    /// Check a requested name and register the session under it.
    async fn claim_name(&self, session: &Session, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.reserved.iter().any(|r| r.eq_ignore_ascii_case(name)) {
            return Err(PeerchatError::Validation(format!("'{name}' is reserved")));
        }
        let welcome = Message::system(format!("{WELCOME_PREFIX} {name}!"));
        self.registry
            .register_named(session.clone(), name, welcome)
            .await
    }
}

struct Tasks {
    accept: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

/// A listening relay server.
pub struct RelayServer {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    events: mpsc::Sender<RelayEvent>,
    state: watch::Sender<ServerState>,
    cancel: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
}

impl RelayServer {
    /// Bind and start serving.
    ///
    /// `host_name` is the local user's display name; peers cannot take it.
    /// Fails with [`PeerchatError::Bind`] and leaves nothing running if the
    /// address cannot be bound.
    pub async fn start(
        server: &ServerConfig,
        session: &SessionConfig,
        host_name: &str,
        hooks: HookChain,
        display: DisplaySender,
    ) -> Result<Self> {
        let listener = RelayListener::bind(server).await?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(SessionRegistry::new());
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let cancel = CancellationToken::new();

        let mut reserved = hooks.names();
        reserved.push(host_name.to_string());
        reserved.push(SYSTEM_SENDER.to_string());

        let router = Router {
            registry: Arc::clone(&registry),
            hooks,
            display,
        };
        let dispatch = tokio::spawn(dispatch_loop(router, events_rx, cancel.clone()));

        let ctx = PeerContext {
            registry: Arc::clone(&registry),
            events: events_tx.clone(),
            cancel: cancel.clone(),
            reserved: reserved.into(),
            name_timeout: session.name_timeout(),
        };
        let accept = tokio::spawn(accept_loop(
            listener,
            ctx,
            session.clone(),
            server.shutdown_timeout(),
        ));

        let (state, _) = watch::channel(ServerState::Listening);
        Ok(Self {
            local_addr,
            registry,
            events: events_tx,
            state,
            cancel,
            tasks: Mutex::new(Some(Tasks { accept, dispatch })),
        })
    }

    /// Get the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the current state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Check if the server is accepting connections.
    pub fn is_listening(&self) -> bool {
        self.state() == ServerState::Listening
    }

    /// Get the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// List connected peer names in join order.
    pub async fn peers(&self) -> Vec<String> {
        self.registry.list().await
    }

    /// Close one peer session by name.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        match self.registry.unregister(id).await {
            Some(_) => {
                info!("Disconnected peer {}", id);
                Ok(())
            }
            None => Err(PeerchatError::Validation(format!("no peer named {id}"))),
        }
    }

    /// Close every peer session, keeping the server listening.
    pub async fn disconnect_all(&self) -> usize {
        self.registry.close_all().await.len()
    }

    /// Hand a locally typed chat message to the relay core.
    pub async fn deliver_local(&self, message: Message) -> Result<()> {
        if !self.is_listening() {
            return Err(PeerchatError::Send("server is not running".to_string()));
        }
        self.events
            .send(RelayEvent::Local(message))
            .await
            .map_err(|_| PeerchatError::Send("relay core has stopped".to_string()))
    }

    /// Stop accepting, drain peer tasks and close every session.
    ///
    /// Peer tasks get `shutdown_timeout` to finish before they are aborted.
    /// Calling `stop` on a stopped server does nothing.
    pub async fn stop(&self) {
        let began = self.state.send_if_modified(|state| {
            if *state == ServerState::Listening {
                *state = ServerState::Stopping;
                true
            } else {
                false
            }
        });
        if !began {
            return;
        }

        info!("Stopping relay server on {}", self.local_addr);
        self.registry
            .broadcast(&Message::system("Server is shutting down"), None)
            .await;
        self.cancel.cancel();

        if let Some(tasks) = self.tasks.lock().await.take() {
            if let Err(e) = tasks.accept.await {
                error!("Accept loop ended abnormally: {}", e);
            }
            if let Err(e) = tasks.dispatch.await {
                error!("Dispatch task ended abnormally: {}", e);
            }
        }

        let stragglers = self.registry.close_all().await;
        if !stragglers.is_empty() {
            debug!("Closed {} remaining session(s)", stragglers.len());
        }

        self.state.send_replace(ServerState::Stopped);
        info!("Relay server on {} stopped", self.local_addr);
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: RelayListener,
    ctx: PeerContext,
    session_config: SessionConfig,
    shutdown_timeout: Duration,
) {
    let mut peers = JoinSet::new();

    loop {
        while let Some(result) = peers.try_join_next() {
            if let Err(e) = result {
                error!("Peer task failed: {}", e);
            }
        }

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr, permit)) => {
                    match Session::open(
                        stream,
                        Direction::Inbound,
                        &session_config,
                        ctx.cancel.child_token(),
                    ) {
                        Ok((session, reader)) => {
                            info!("Peer {} connected", addr);
                            peers.spawn(run_peer(ctx.clone(), session, reader, permit));
                        }
                        Err(e) => warn!("Could not open session for {}: {}", addr, e),
                    }
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }

    drop(listener);

    let drained = tokio::time::timeout(shutdown_timeout, async {
        while peers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "Aborting {} peer task(s) still running after {:?}",
            peers.len(),
            shutdown_timeout
        );
        peers.abort_all();
        while peers.join_next().await.is_some() {}
    }
}

/// Build the prompt repeated after a refused name.
fn name_retry_prompt(reason: &str) -> String {
    let sep = if reason.ends_with('.') { " " } else { ". " };
    format!("{reason}{sep}{NAME_PROMPT}")
}

/// Ask the peer for a name until it picks one that can be registered.
async fn negotiate_name(
    ctx: &PeerContext,
    session: &Session,
    reader: &mut SessionReader,
) -> Result<String> {
    tokio::time::timeout(ctx.name_timeout, request_name(ctx, session, reader))
        .await
        .map_err(|_| PeerchatError::Protocol("no name given in time".to_string()))?
}

async fn request_name(
    ctx: &PeerContext,
    session: &Session,
    reader: &mut SessionReader,
) -> Result<String> {
    let mut prompt = NAME_PROMPT.to_string();
    loop {
        session.send(Message::system(prompt)).await?;
        let name = match reader.recv().await {
            Some(Ok(Frame::Input(line))) => line.trim().to_string(),
            Some(Ok(Frame::Relay(_))) => {
                return Err(PeerchatError::Protocol(
                    "unexpected relay frame".to_string(),
                ))
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(PeerchatError::Protocol(
                    "closed before picking a name".to_string(),
                ))
            }
        };
        match ctx.claim_name(session, &name).await {
            Ok(()) => return Ok(name),
            Err(PeerchatError::Validation(reason)) => {
                debug!("Refused name {:?} from {}: {}", name, session.peer_addr(), reason);
                prompt = name_retry_prompt(&reason);
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_peer(
    ctx: PeerContext,
    session: Session,
    mut reader: SessionReader,
    permit: ConnectionPermit,
) {
    let id = match negotiate_name(&ctx, &session, &mut reader).await {
        Ok(name) => name,
        Err(e) => {
            info!("Peer {} dropped before joining: {}", session.peer_addr(), e);
            session.close();
            return;
        }
    };

    if ctx.events.send(RelayEvent::Joined(id.clone())).await.is_err() {
        ctx.registry.unregister_session(&session).await;
        return;
    }

    let reason = loop {
        match reader.recv().await {
            Some(Ok(Frame::Input(line))) => {
                if line.trim().is_empty() {
                    continue;
                }
                let message = if is_command(&line) {
                    Message::command(&id, line.trim_end())
                } else {
                    Message::chat(&id, line)
                };
                if ctx.events.send(RelayEvent::Inbound(message)).await.is_err() {
                    break "server stopped".to_string();
                }
            }
            Some(Ok(Frame::Relay(_))) => {
                warn!("Peer {} sent a relay frame; closing", id);
                break "protocol error: unexpected relay frame".to_string();
            }
            Some(Err(e)) => {
                warn!("Closing {}: {}", id, e);
                break e.to_string();
            }
            None if session.is_open() => break "connection closed".to_string(),
            None => break "disconnected".to_string(),
        }
    };

    ctx.registry.unregister_session(&session).await;
    session.closed().await;
    drop(permit);
    info!("Peer {} left ({})", id, reason);

    if !ctx.cancel.is_cancelled() {
        let _ = ctx.events.send(RelayEvent::Left { id, reason }).await;
    }
}

/// Applies relay events to the registry, the hooks and the display.
struct Router {
    registry: Arc<SessionRegistry>,
    hooks: HookChain,
    display: DisplaySender,
}

impl Router {
    async fn handle(&self, event: RelayEvent) {
        match event {
            RelayEvent::Inbound(message) if message.kind == MessageKind::Command => {
                warn!("Rejected command from peer {}: {}", message.sender, message.payload);
                let reply = Message::system(format!(
                    "Commands are not accepted from peers: {}",
                    message.payload
                ));
                if let Err(e) = self.registry.send_to(&message.sender, reply).await {
                    debug!("Could not reject command from {}: {}", message.sender, e);
                }
            }
            RelayEvent::Inbound(message) => {
                self.show(message.clone());
                let exclude = message.sender.clone();
                self.relay_chat(message, Some(exclude.as_str())).await;
            }
            RelayEvent::Local(message) => self.relay_chat(message, None).await,
            RelayEvent::Joined(id) => {
                let notice = Message::system(format!("{id} joined the chat"));
                self.registry.broadcast(&notice, Some(id.as_str())).await;
                self.show(notice);
            }
            RelayEvent::Left { id, reason } => {
                let notice = Message::system(format!("{id} left the chat ({reason})"));
                self.registry.broadcast(&notice, Some(id.as_str())).await;
                self.show(notice);
            }
        }
    }

    /// Run hooks, fan the message out, then deliver any replies to everyone.
    async fn relay_chat(&self, message: Message, exclude: Option<&str>) {
        let replies = self.hooks.run(&message).await;
        let delivered = self.registry.broadcast(&message, exclude).await;
        debug!("Relayed message from {} to {} peer(s)", message.sender, delivered);

        for reply in replies {
            self.registry.broadcast(&reply, None).await;
            self.show(reply);
        }
    }

    fn show(&self, message: Message) {
        if self.display.send(message).is_err() {
            debug!("Display channel closed");
        }
    }
}

async fn dispatch_loop(
    router: Router,
    mut events: mpsc::Receiver<RelayEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        router.handle(event).await;
    }
    debug!("Dispatch task finished");
}
