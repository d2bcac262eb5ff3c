//! Server configuration.

use ironws_transport::TransportError;
use ironws_transport::tcp::{DEFAULT_BACKLOG, UpgradeConfig};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// How a session handles `send` while a previous write has not completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Append to a FIFO queue drained one write at a time.
    #[default]
    Queue,
    /// Fail with [`SessionError::WriteInProgress`](crate::SessionError::WriteInProgress).
    Reject,
}

/// Configuration for the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Listen backlog.
    pub backlog: i32,
    /// Maximum number of live sessions.
    pub max_connections: usize,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Time allowed for the WebSocket handshake.
    pub handshake_timeout: Duration,
    /// Time allowed for the closing handshake when a session closes locally.
    pub close_timeout: Duration,
    /// Enable TCP_NODELAY on accepted streams.
    pub tcp_nodelay: bool,
    /// Overlapping `send` policy.
    pub write_policy: WritePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let upgrade = UpgradeConfig::default();
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            backlog: DEFAULT_BACKLOG,
            max_connections: 1000,
            max_message_size: upgrade.max_message_size,
            handshake_timeout: upgrade.handshake_timeout,
            close_timeout: Duration::from_secs(2),
            tcp_nodelay: true,
            write_policy: WritePolicy::Queue,
        }
    }
}

impl ServerConfig {
    /// Creates a new server config with the specified bind address.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Creates a config from an IPv4/IPv6 literal and a port.
    ///
    /// # Errors
    /// Returns [`TransportError::AddrParse`] if `address` is not an IP literal.
    pub fn from_parts(address: &str, port: u16) -> Result<Self, TransportError> {
        let ip: IpAddr = address.parse()?;
        Ok(Self::new(SocketAddr::new(ip, port)))
    }

    /// Sets the listen backlog.
    #[must_use]
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Sets the maximum number of live sessions.
    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

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

    /// Sets the closing handshake timeout.
    #[must_use]
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Enables or disables TCP_NODELAY.
    #[must_use]
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Sets the overlapping `send` policy.
    #[must_use]
    pub fn write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    /// Returns the upgrade settings derived from this config.
    #[must_use]
    pub fn upgrade_config(&self) -> UpgradeConfig {
        UpgradeConfig::default()
            .max_message_size(self.max_message_size)
            .handshake_timeout(self.handshake_timeout)
    }
}
