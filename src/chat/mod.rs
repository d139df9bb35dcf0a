//! Chat module for peerchat.
//!
//! This module provides the message model and the input parser:
//! - Message kinds (chat, command, system)
//! - Command-vs-chat disambiguation of typed lines
//! - Help and peer-list formatting

mod command;
mod message;

pub use command::{
    format_help, format_peers, get_command_help, is_command, parse_input, ChatCommand, ChatInput,
    CommandInfo, COMMAND_PREFIX,
};
pub use message::{
    validate_name, Message, MessageKind, MAX_NAME_LEN, NAME_PROMPT, NAME_TAKEN, SYSTEM_SENDER,
    WELCOME_PREFIX,
};
