//! WebSocket upgrade of accepted TCP streams.
//!
//! The handshake and frame parsing are delegated to `tokio-tungstenite`;
//! this module only bounds the handshake in time and classifies the
//! resulting errors.

use crate::error::TransportError;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

pub use tokio_tungstenite::tungstenite::Message as WsMessage;

/// A server-side WebSocket channel over TCP.
pub type WsStream = WebSocketStream<TcpStream>;

/// Configuration for the WebSocket upgrade.
#[derive(Debug, Clone, Copy)]
pub struct UpgradeConfig {
    /// Maximum size of an inbound message in bytes.
    pub max_message_size: usize,
    /// Time allowed for the client to complete the handshake.
    pub handshake_timeout: Duration,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl UpgradeConfig {
    /// Sets the maximum inbound message size.
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the handshake timeout.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_message_size))
            .max_frame_size(Some(self.max_message_size))
    }
}

/// Performs the server side of the WebSocket handshake on `stream`.
///
/// # Errors
/// Returns [`TransportError::Handshake`] if the client request is not a
/// valid upgrade or the stream fails, and [`TransportError::HandshakeTimeout`]
/// if the client does not finish within `config.handshake_timeout`.
pub async fn upgrade(
    stream: TcpStream,
    config: &UpgradeConfig,
) -> Result<WsStream, TransportError> {
    let handshake =
        tokio_tungstenite::accept_async_with_config(stream, Some(config.websocket_config()));

    match tokio::time::timeout(config.handshake_timeout, handshake).await {
        Ok(Ok(ws)) => Ok(ws),
        Ok(Err(e)) => Err(TransportError::Handshake(e)),
        Err(_) => Err(TransportError::HandshakeTimeout(config.handshake_timeout)),
    }
}

/// Returns true if `err` means the connection is gone rather than broken.
///
/// A peer that closes the TCP stream without a closing handshake, or
/// resets it, ends the session the same way a Close frame does. Writing
/// after the peer's Close frame arrived is treated the same way.
#[must_use]
pub fn is_connection_closed(err: &WsError) -> bool {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(
            ProtocolError::ResetWithoutClosingHandshake | ProtocolError::SendAfterClosing,
        ) => true,
        WsError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}
