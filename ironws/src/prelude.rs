//! Prelude module for convenient imports.
//!
//! ```ignore
//! use ironws::prelude::*;
//! ```

// Server types
pub use ironws_server::{
    ContextHandle, ExecutionContext, Listener, ServerBuilder, ServerConfig, ServerHandle, Session,
    SessionId, SessionState, WritePolicy,
};

// Errors
pub use ironws_server::{LifecycleError, ServerError, SessionError};
pub use ironws_transport::TransportError;
