//! Daemon host: Unix socket listener, fd handoff and per-connection bridging.

mod connection;
mod handoff;
mod listener;

pub use connection::{ConnectionError, ConnectionHandler};
pub use handoff::{receive_handoff, Handoff, RequestData};
pub use listener::{AcceptedConnection, HandoffListener};
