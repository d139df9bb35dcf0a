//! peerchat - a peer-hostable plaintext TCP chat relay.
//!
//! Any instance can host a relay server that accepts peers and fans their
//! chat lines out to each other, connect to other instances, or both.

pub mod app;
pub mod bot;
pub mod chat;
pub mod config;
pub mod error;
pub mod logging;
pub mod server;

pub use app::{Dispatcher, Flow};
pub use bot::{BotHook, CommandBot, HookChain};
pub use chat::{parse_input, ChatCommand, ChatInput, Message, MessageKind};
pub use config::Config;
pub use error::{PeerchatError, Result};
pub use server::{
    Direction, Frame, FrameCodec, RelayServer, ServerState, Session, SessionRegistry,
    SessionState,
};
