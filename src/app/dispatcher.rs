//! Local command dispatcher.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::outbound;
use crate::bot::{BotHook, CommandBot, HookChain};
use crate::chat::{format_help, format_peers, parse_input, ChatCommand, ChatInput, Message};
use crate::config::Config;
use crate::server::{DisplaySender, RelayServer, Session, SessionRegistry};
use crate::{PeerchatError, Result};

/// Whether the local input loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

struct State {
    server: Option<RelayServer>,
    hooks: HookChain,
}

/// Executes lines typed by the local user.
///
/// Holds the optional local relay server and every outbound session. One
/// line is handled at a time.
pub struct Dispatcher {
    config: Config,
    display: DisplaySender,
    state: Mutex<State>,
    outbound: Arc<SessionRegistry>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher and the receiving end of its display channel.
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (display, display_rx) = mpsc::unbounded_channel();

        let mut hooks = HookChain::new(config.bot.handler_timeout());
        if config.bot.enabled {
            hooks.register(Arc::new(CommandBot::from_config(&config.bot)));
        }

        let dispatcher = Self {
            config,
            display,
            state: Mutex::new(State {
                server: None,
                hooks,
            }),
            outbound: Arc::new(SessionRegistry::new()),
            cancel: CancellationToken::new(),
        };
        (dispatcher, display_rx)
    }

    /// Add a bot hook. Takes effect the next time the server starts.
    pub async fn add_hook(&self, hook: Arc<dyn BotHook>) {
        self.state.lock().await.hooks.register(hook);
    }

    /// Get the registry of outbound sessions.
    pub fn outbound(&self) -> &Arc<SessionRegistry> {
        &self.outbound
    }

    /// Address of the local server, if one is listening.
    pub async fn server_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .await
            .server
            .as_ref()
            .map(|server| server.local_addr())
    }

    /// Handle one typed line; errors are shown as system messages.
    pub async fn submit_local_input(&self, line: &str) -> Flow {
        match self.execute(line).await {
            Ok(flow) => flow,
            Err(e) => {
                debug!("Local input failed: {}", e);
                self.show(Message::system(e.to_string()));
                Flow::Continue
            }
        }
    }

    /// Handle one typed line.
    pub async fn execute(&self, line: &str) -> Result<Flow> {
        let input = parse_input(line)?;
        let mut state = self.state.lock().await;

        match input {
            ChatInput::Chat(text) if text.trim().is_empty() => {}
            ChatInput::Chat(text) => self.send_chat(&state, text).await?,
            ChatInput::Command(command) => {
                debug!("Executing {}", command);
                return self.run_command(&mut state, command).await;
            }
        }
        Ok(Flow::Continue)
    }

    /// Start the local relay server, on `port` or the configured default.
    pub async fn start_server(&self, port: Option<u16>) -> Result<SocketAddr> {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state, port).await
    }

    /// Stop the server and close every outbound session.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        self.shutdown_locked(&mut state).await;
    }

    async fn run_command(&self, state: &mut State, command: ChatCommand) -> Result<Flow> {
        match command {
            ChatCommand::StartServer { port } => {
                let addr = self.start_locked(state, port).await?;
                self.show(Message::system(format!("Server listening on {addr}")));
            }
            ChatCommand::StopServer => match state.server.take() {
                Some(server) => {
                    server.stop().await;
                    self.show(Message::system("Server stopped"));
                }
                None => {
                    return Err(PeerchatError::Validation(
                        "server is not running".to_string(),
                    ))
                }
            },
            ChatCommand::Connect { host, port } => {
                let session = outbound::connect(
                    &host,
                    port,
                    &self.config.chat.name,
                    &self.config.session,
                    &self.outbound,
                    self.display.clone(),
                    self.cancel.child_token(),
                )
                .await?;
                self.show(Message::system(format!("Connected to {}", session.id())));
            }
            ChatCommand::Disconnect { id: Some(id) } => self.disconnect_one(state, &id).await?,
            ChatCommand::Disconnect { id: None } => {
                let mut closed = self.outbound.close_all().await.len();
                if let Some(server) = &state.server {
                    closed += server.disconnect_all().await;
                }
                self.show(Message::system(format!("Closed {closed} connection(s)")));
            }
            ChatCommand::List => {
                let hosted = match &state.server {
                    Some(server) => Some(describe(server.registry()).await),
                    None => None,
                };
                let outbound = describe(&self.outbound).await;
                self.show(Message::system(format_peers(hosted.as_deref(), &outbound)));
            }
            ChatCommand::Help => self.show(Message::system(format_help())),
            ChatCommand::Quit => {
                self.shutdown_locked(state).await;
                return Ok(Flow::Quit);
            }
        }
        Ok(Flow::Continue)
    }

    async fn start_locked(&self, state: &mut State, port: Option<u16>) -> Result<SocketAddr> {
        if let Some(server) = &state.server {
            return Err(PeerchatError::Validation(format!(
                "server already listening on {}",
                server.local_addr()
            )));
        }

        let mut server_config = self.config.server.clone();
        if let Some(port) = port {
            server_config.port = port;
        }

        let server = RelayServer::start(
            &server_config,
            &self.config.session,
            &self.config.chat.name,
            state.hooks.clone(),
            self.display.clone(),
        )
        .await?;
        let addr = server.local_addr();
        state.server = Some(server);
        Ok(addr)
    }

    async fn disconnect_one(&self, state: &State, id: &str) -> Result<()> {
        if let Some(server) = &state.server {
            if server.registry().contains(id).await {
                server.disconnect(id).await?;
                self.show(Message::system(format!("Disconnected peer {id}")));
                return Ok(());
            }
        }
        // The outbound receive task reports the disconnect itself.
        match self.outbound.unregister(id).await {
            Some(_) => Ok(()),
            None => Err(PeerchatError::Validation(format!(
                "no peer or connection named {id}"
            ))),
        }
    }

    async fn send_chat(&self, state: &State, text: String) -> Result<()> {
        let outbound = self.outbound.sessions().await;
        if state.server.is_none() && outbound.is_empty() {
            return Err(PeerchatError::Validation(
                "not connected: use /startserver or /connect <host> <port>".to_string(),
            ));
        }

        let message = Message::chat(&self.config.chat.name, text);
        self.show(message.clone());

        for session in outbound {
            if let Err(e) = session.send_input(message.payload.clone()).await {
                warn!("Could not send to {}: {}", session.id(), e);
            }
        }
        if let Some(server) = &state.server {
            server.deliver_local(message).await?;
        }
        Ok(())
    }

    async fn shutdown_locked(&self, state: &mut State) {
        if let Some(server) = state.server.take() {
            server.stop().await;
        }
        for session in self.outbound.close_all().await {
            session.closed().await;
        }
        self.cancel.cancel();
        info!("Dispatcher shut down");
    }

    fn show(&self, message: Message) {
        let _ = self.display.send(message);
    }
}

/// One `/list` line per session: id, address and when it was opened.
async fn describe(registry: &SessionRegistry) -> Vec<String> {
    registry
        .sessions()
        .await
        .iter()
        .map(describe_session)
        .collect()
}

fn describe_session(session: &Session) -> String {
    let since = session.opened_at().with_timezone(&chrono::Local);
    match session.name() {
        Some(name) => format!(
            "{} ({}, since {})",
            name,
            session.peer_addr(),
            since.format("%H:%M:%S")
        ),
        None => format!("{} (since {})", session.id(), since.format("%H:%M:%S")),
    }
}
