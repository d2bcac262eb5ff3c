//! # IronWS
//!
//! Minimal asynchronous WebSocket server for Rust.
//!
//! A server is one listening socket driven by one single-threaded execution
//! context. Every accepted connection is upgraded to a WebSocket and handed
//! to the application as a [`Session`], which receives text messages through
//! a callback and sends them without blocking.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ironws::prelude::*;
//!
//! let server = ServerHandle::new("0.0.0.0", 4321, |session| {
//!     let echo = session.clone();
//!     session.on_message(move |text| {
//!         let _ = echo.send(text);
//!     });
//! })?;
//! server.run()?;
//! ```
//!
//! ## Crate Organization
//!
//! - [`transport`] - Listening sockets and the WebSocket upgrade
//! - [`server`] - Execution context, listener, sessions and the server handle

pub mod prelude;

/// Network transport layer.
pub mod transport {
    pub use ironws_transport::*;
}

/// Server-side engine.
pub mod server {
    pub use ironws_server::*;
}

// Re-export commonly used items at the crate root
pub use ironws_server::{
    ExecutionContext, Listener, ServerBuilder, ServerConfig, ServerError, ServerHandle, Session,
    SessionError, SessionState, WritePolicy,
};
