//! Streams token-by-token generation to clients as Server-Sent Events.
//!
//! The core is [`streaming::StreamBridge`], which drains generation events
//! in order, writes one SSE frame per token or error, and always leaves its
//! sink closed. The rest of the crate hosts it: a daemon that receives
//! client sockets from Apache via SCM_RIGHTS and runs one bridge per client.

pub mod config;
pub mod error;
pub mod generation;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod streaming;

pub use config::Config;
pub use error::{DaemonError, Result};
