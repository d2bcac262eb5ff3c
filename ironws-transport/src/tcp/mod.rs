//! TCP transport module.
//!
//! Provides the listening socket setup and the WebSocket upgrade that turns
//! an accepted TCP stream into a framed, message-oriented channel.

pub mod listener;
pub mod upgrade;

pub use listener::{
    DEFAULT_BACKLOG, bind_listener, is_resource_exhaustion, is_transient_accept_error,
};
pub use upgrade::{UpgradeConfig, WsMessage, WsStream, is_connection_closed, upgrade};
