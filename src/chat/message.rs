//! Chat message type.

use chrono::{DateTime, Utc};

use crate::{PeerchatError, Result};

/// Sender name used for messages generated by the relay itself.
pub const SYSTEM_SENDER: &str = "system";

/// Longest display name a peer, the local user or a bot may use, in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Sent by a relay server to a new peer, and repeated after a refused name.
pub const NAME_PROMPT: &str = "What is your name?";

/// Reason given when a peer picks a name that is in use.
pub const NAME_TAKEN: &str = "That name has already been used.";

/// Start of the greeting that confirms a peer's name.
pub const WELCOME_PREFIX: &str = "Welcome to the chat session";

/// Check that a display name can appear as a relay frame sender.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PeerchatError::Validation("name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(PeerchatError::Validation(format!(
            "name must be at most {MAX_NAME_LEN} bytes"
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(PeerchatError::Validation(
            "name must not contain spaces".to_string(),
        ));
    }
    if name.eq_ignore_ascii_case(SYSTEM_SENDER) {
        return Err(PeerchatError::Validation(format!("'{name}' is reserved")));
    }
    Ok(())
}

/// Kind of chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Regular chat text.
    Chat,
    /// An in-band `/command` line.
    Command,
    /// Notice generated by the relay (errors, joins, warnings).
    System,
}

impl MessageKind {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Chat => "chat",
            MessageKind::Command => "command",
            MessageKind::System => "system",
        }
    }

    /// Parse the string representation produced by [`MessageKind::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(MessageKind::Chat),
            "command" => Some(MessageKind::Command),
            "system" => Some(MessageKind::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A chat message.
///
/// Messages are immutable once built and travel through the relay by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Identifier of the sender (session id, display name or [`SYSTEM_SENDER`]).
    pub sender: String,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// Message kind.
    pub kind: MessageKind,
    /// Message text.
    pub payload: String,
}

impl Message {
    /// Create a message with an explicit timestamp.
    pub fn new(
        sender: impl Into<String>,
        kind: MessageKind,
        payload: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sender: sender.into(),
            timestamp,
            kind,
            payload: payload.into(),
        }
    }

    /// Create a chat message stamped now.
    pub fn chat(sender: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(sender, MessageKind::Chat, payload, Utc::now())
    }

    /// Create a command message stamped now.
    pub fn command(sender: impl Into<String>, line: impl Into<String>) -> Self {
        Self::new(sender, MessageKind::Command, line, Utc::now())
    }

    /// Create a system message stamped now.
    pub fn system(payload: impl Into<String>) -> Self {
        Self::new(SYSTEM_SENDER, MessageKind::System, payload, Utc::now())
    }

    /// Whether this is a chat message.
    pub fn is_chat(&self) -> bool {
        self.kind == MessageKind::Chat
    }

    /// Format the message for display.
    pub fn format(&self) -> String {
        match self.kind {
            MessageKind::Chat => format!("<{}> {}", self.sender, self.payload),
            MessageKind::Command => format!("[{}] {}", self.sender, self.payload),
            MessageKind::System => format!("*** {}", self.payload),
        }
    }

    /// Format the message with a local `HH:MM:SS` time prefix.
    pub fn format_with_time(&self) -> String {
        let local = self.timestamp.with_timezone(&chrono::Local);
        format!("[{}] {}", local.format("%H:%M:%S"), self.format())
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format())
    }
}
