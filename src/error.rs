//! Error types for peerchat.

use thiserror::Error;

/// Common error type for peerchat.
#[derive(Error, Debug)]
pub enum PeerchatError {
    /// Malformed frame on the wire.
    ///
    /// Only ever closes the session it was read from.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Payload exceeds the configured frame limit.
    #[error("message too large: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },

    /// Sending on a session failed or the session is closed.
    #[error("send failed: {0}")]
    Send(String),

    /// Outbound connection could not be established.
    #[error("could not connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// Listening socket could not be bound.
    #[error("could not listen on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// Command name not in the known set.
    #[error("unknown command: /{0}")]
    UnknownCommand(String),

    /// A bot hook did not answer in time.
    #[error("bot hook '{0}' timed out")]
    HandlerTimeout(String),

    /// A bot hook returned an error or panicked.
    #[error("bot hook '{name}' failed: {reason}")]
    Hook { name: String, reason: String },

    /// Validation error for user input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for peerchat operations.
pub type Result<T> = std::result::Result<T, PeerchatError>;
