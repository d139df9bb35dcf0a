//! Chat command parser for peerchat.
//!
//! A typed line is split at the boundary into either plain chat text or one
//! of a fixed set of `/commands`. Nothing past this point looks at the raw
//! prefix again.

use crate::{PeerchatError, Result};

/// Character that introduces an in-band command.
pub const COMMAND_PREFIX: char = '/';

/// Result of parsing an input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    /// Regular chat text.
    Chat(String),
    /// Parsed command.
    Command(ChatCommand),
}

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Bind and start listening. `None` means the configured default port.
    StartServer { port: Option<u16> },
    /// Stop the local server.
    StopServer,
    /// Open an outbound session.
    Connect { host: String, port: u16 },
    /// Close one session, or every session when `id` is `None`.
    Disconnect { id: Option<String> },
    /// List peer identifiers.
    List,
    /// Show help message.
    Help,
    /// Shut down and leave the local loop.
    Quit,
}

impl ChatCommand {
    /// Get the command name.
    pub fn name(&self) -> &'static str {
        match self {
            ChatCommand::StartServer { .. } => "startserver",
            ChatCommand::StopServer => "stopserver",
            ChatCommand::Connect { .. } => "connect",
            ChatCommand::Disconnect { .. } => "disconnect",
            ChatCommand::List => "list",
            ChatCommand::Help => "help",
            ChatCommand::Quit => "quit",
        }
    }
}

impl std::fmt::Display for ChatCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatCommand::StartServer { port: Some(port) } => write!(f, "/startserver {port}"),
            ChatCommand::Connect { host, port } => write!(f, "/connect {host} {port}"),
            ChatCommand::Disconnect { id: Some(id) } => write!(f, "/disconnect {id}"),
            other => write!(f, "/{}", other.name()),
        }
    }
}

/// Whether a raw line is a command frame.
pub fn is_command(line: &str) -> bool {
    line.starts_with(COMMAND_PREFIX)
}

/// Parse an input line into chat text or a command.
///
/// Only a line whose first character is the prefix is a command; anything
/// else is returned untouched as chat. Unknown command names fail with [`PeerchatError::UnknownCommand`].
/// Argument errors map to the error the command itself would raise
/// (`Bind` for a bad listen port, `Connect` for a bad remote port).
pub fn parse_input(input: &str) -> Result<ChatInput> {
    if !is_command(input) {
        return Ok(ChatInput::Chat(input.to_string()));
    }

    let mut parts = input[COMMAND_PREFIX.len_utf8()..].split_whitespace();
    let cmd = parts.next().unwrap_or("");
    let args: Vec<&str> = parts.collect();

    let command = match cmd.to_lowercase().as_str() {
        "startserver" | "start" | "s" => {
            let port = match args.first() {
                Some(raw) => Some(raw.parse::<u16>().map_err(|_| PeerchatError::Bind {
                    addr: format!("port {raw}"),
                    reason: "invalid port".to_string(),
                })?),
                None => None,
            };
            ChatCommand::StartServer { port }
        }
        "stopserver" | "killserver" => ChatCommand::StopServer,
        "connect" | "c" => {
            let (host, raw_port) = match (args.first(), args.get(1)) {
                (Some(host), Some(port)) => (*host, *port),
                _ => {
                    return Err(PeerchatError::Validation(
                        "usage: /connect <host> <port>".to_string(),
                    ))
                }
            };
            let port = raw_port.parse::<u16>().map_err(|_| PeerchatError::Connect {
                addr: format!("{host}:{raw_port}"),
                reason: "invalid port".to_string(),
            })?;
            ChatCommand::Connect {
                host: host.to_string(),
                port,
            }
        }
        "disconnect" | "dc" => ChatCommand::Disconnect {
            id: args.first().map(|id| id.to_string()),
        },
        "list" | "who" | "peers" => ChatCommand::List,
        "help" | "h" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        _ => return Err(PeerchatError::UnknownCommand(cmd.to_string())),
    };

    Ok(ChatInput::Command(command))
}

/// Chat command information for help display.
pub struct CommandInfo {
    /// Command name.
    pub name: &'static str,
    /// Command aliases.
    pub aliases: &'static [&'static str],
    /// Command syntax.
    pub syntax: &'static str,
    /// Command description.
    pub description: &'static str,
}

/// Get all available command information.
pub fn get_command_help() -> Vec<CommandInfo> {
    vec![
        CommandInfo {
            name: "startserver",
            aliases: &["start", "s"],
            syntax: "/startserver [port]",
            description: "Start hosting a chat server (default port 8080)",
        },
        CommandInfo {
            name: "stopserver",
            aliases: &["killserver"],
            syntax: "/stopserver",
            description: "Stop the running server and drop its peers",
        },
        CommandInfo {
            name: "connect",
            aliases: &["c"],
            syntax: "/connect <host> <port>",
            description: "Connect to a running server",
        },
        CommandInfo {
            name: "disconnect",
            aliases: &["dc"],
            syntax: "/disconnect [id]",
            description: "Close one connection, or all of them",
        },
        CommandInfo {
            name: "list",
            aliases: &["who", "peers"],
            syntax: "/list",
            description: "List connected peers",
        },
        CommandInfo {
            name: "help",
            aliases: &["h", "?"],
            syntax: "/help",
            description: "Show this help",
        },
        CommandInfo {
            name: "quit",
            aliases: &["exit", "q"],
            syntax: "/quit",
            description: "Close everything and exit",
        },
    ]
}

/// Format the help message for display.
pub fn format_help() -> String {
    let mut lines = Vec::new();
    lines.push("=== Commands ===".to_string());

    for info in get_command_help() {
        let mut line = format!("{:<24} {}", info.syntax, info.description);
        if !info.aliases.is_empty() {
            line.push_str(&format!(" (aliases: /{})", info.aliases.join(", /")));
        }
        lines.push(line);
    }
    lines.push("Lines that do not start with / are sent as chat.".to_string());

    lines.join("\n")
}

/// Format the peer listing for `/list`.
///
/// `hosted` is `None` when no local server is running.
pub fn format_peers(hosted: Option<&[String]>, outbound: &[String]) -> String {
    let mut lines = Vec::new();

    match hosted {
        Some(peers) => {
            lines.push(format!("=== Server peers ({}) ===", peers.len()));
            if peers.is_empty() {
                lines.push("  (no peers connected)".to_string());
            }
            for id in peers {
                lines.push(format!("  {id}"));
            }
        }
        None => lines.push("=== Server not running ===".to_string()),
    }

    lines.push(format!("=== Outbound connections ({}) ===", outbound.len()));
    if outbound.is_empty() {
        lines.push("  (none)".to_string());
    }
    for id in outbound {
        lines.push(format!("  {id}"));
    }

    lines.join("\n")
}
