//! Application module.
//!
//! Turns local input into server, connection and chat actions.

mod dispatcher;
pub mod outbound;

pub use dispatcher::{Dispatcher, Flow};
