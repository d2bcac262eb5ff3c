//! Error types for transport operations.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Stage of listening socket setup.
///
/// Setup runs the stages in declaration order and stops at the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    /// Creating the socket.
    Open,
    /// Enabling `SO_REUSEADDR`.
    ReuseAddress,
    /// Binding to the local address.
    Bind,
    /// Marking the socket as listening.
    Listen,
    /// Switching the socket to non-blocking mode.
    NonBlocking,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::ReuseAddress => "set_option(reuse_address)",
            Self::Bind => "bind",
            Self::Listen => "listen",
            Self::NonBlocking => "set_nonblocking",
        };
        f.write_str(name)
    }
}

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Listening socket setup failed at the given stage.
    #[error("{stage} failed for {addr}: {source}")]
    Setup {
        /// Stage that failed.
        stage: SetupStage,
        /// Address being set up.
        addr: SocketAddr,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Address parse error.
    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// Accepting a connection failed.
    #[error("accept error: {0}")]
    Accept(#[source] std::io::Error),

    /// The WebSocket handshake was rejected or the stream failed during it.
    #[error("handshake error: {0}")]
    Handshake(#[source] tokio_tungstenite::tungstenite::Error),

    /// The WebSocket handshake did not complete in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

impl TransportError {
    /// Creates a setup error for the given stage.
    pub fn setup(stage: SetupStage, addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Setup {
            stage,
            addr,
            source,
        }
    }

    /// Returns the failing setup stage, if this is a setup error.
    #[must_use]
    pub fn setup_stage(&self) -> Option<SetupStage> {
        match self {
            Self::Setup { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Returns true if binding the address failed.
    #[must_use]
    pub fn is_bind_error(&self) -> bool {
        self.setup_stage() == Some(SetupStage::Bind)
    }

    /// Returns true if putting the socket into listening mode failed.
    #[must_use]
    pub fn is_listen_error(&self) -> bool {
        self.setup_stage() == Some(SetupStage::Listen)
    }
}
