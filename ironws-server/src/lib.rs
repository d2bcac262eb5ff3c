//! # IronWS Server
//!
//! Server-side engine for WebSocket messaging.
//!
//! This crate provides:
//! - Single-threaded execution context with an explicit start/stop lifecycle
//! - Listener that accepts connections and upgrades them to WebSocket sessions
//! - Sessions with callback-based receive and queued, non-blocking send
//! - Server builder and handle that own shutdown ordering
//!
//! ```ignore
//! use ironws_server::ServerHandle;
//!
//! let server = ServerHandle::new("127.0.0.1", 4321, |session| {
//!     let echo = session.clone();
//!     session.on_message(move |text| {
//!         let _ = echo.send(text);
//!     });
//! })?;
//! server.run()?;
//! ```

pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod listener;
pub mod session;

pub use builder::{ServerBuilder, ServerHandle};
pub use config::{ServerConfig, WritePolicy};
pub use context::{ContextHandle, ExecutionContext};
pub use error::{LifecycleError, ServerError, SessionError};
pub use listener::{AcceptCallback, Listener};
pub use session::{Session, SessionId, SessionState};
