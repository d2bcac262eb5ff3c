//! Error types for server operations.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Error type for server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Transport error, including bind, listen and socket I/O failures.
    #[error("transport error: {0}")]
    Transport(#[from] ironws_transport::TransportError),

    /// Execution context lifecycle error.
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// The server was built without an accept callback.
    #[error("no accept callback configured")]
    MissingAcceptHandler,
}

/// Error type for starting and stopping the execution context.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The component is already running.
    #[error("already running")]
    AlreadyRunning,

    /// The component was stopped and cannot be restarted.
    #[error("already stopped")]
    Stopped,

    /// Stop was requested from the worker thread, which cannot join itself.
    #[error("cannot stop the execution context from its own worker thread")]
    JoinFromWorker,

    /// The worker thread panicked.
    #[error("worker thread panicked")]
    WorkerPanicked,

    /// The runtime or worker thread could not be created.
    #[error("runtime error: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Error type for session operations.
///
/// `Closed` and `WriteInProgress` are returned synchronously by
/// [`Session::send`](crate::Session::send). The others are delivered to the
/// session's error handler.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session is not open.
    #[error("session closed")]
    Closed,

    /// A write is already queued or in flight and the session rejects overlap.
    #[error("write already in progress")]
    WriteInProgress,

    /// Reading from the connection failed.
    #[error("read error: {0}")]
    Read(#[source] tungstenite::Error),

    /// Writing to the connection failed.
    #[error("write error: {0}")]
    Write(#[source] tungstenite::Error),

    /// A binary message was not valid UTF-8 text.
    #[error("invalid UTF-8 in message: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}
