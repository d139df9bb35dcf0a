//! Networking for peerchat.
//!
//! This module provides the wire codec, sessions and their registry, the
//! TCP listener, and the relay core that ties them together.

pub mod codec;
mod listener;
mod registry;
mod relay;
mod session;

pub use codec::{Frame, FrameCodec};
pub use listener::{ConnectionPermit, RelayListener};
pub use registry::SessionRegistry;
pub use relay::{DisplaySender, RelayEvent, RelayServer, ServerState};
pub use session::{Direction, Session, SessionReader, SessionState};
