//! Server builder and top-level server handle.

use crate::config::{ServerConfig, WritePolicy};
use crate::context::ExecutionContext;
use crate::error::{LifecycleError, ServerError};
use crate::listener::{AcceptCallback, Listener};
use crate::session::Session;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Builder for configuring and creating a server.
pub struct ServerBuilder {
    config: ServerConfig,
    on_accept: Option<AcceptCallback>,
}

impl ServerBuilder {
    /// Creates a new server builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            on_accept: None,
        }
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the bind address.
    #[must_use]
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Sets the bind port, keeping the bind IP.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.bind_addr.set_port(port);
        self
    }

    /// Sets the listen backlog.
    #[must_use]
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config = self.config.backlog(backlog);
        self
    }

    /// Sets the maximum number of live sessions.
    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config = self.config.max_connections(max);
        self
    }

    /// Sets the maximum inbound message size.
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config = self.config.max_message_size(size);
        self
    }

    /// Sets the handshake timeout.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.handshake_timeout(timeout);
        self
    }

    /// Sets the closing handshake timeout.
    #[must_use]
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.close_timeout(timeout);
        self
    }

    /// Enables or disables TCP_NODELAY on accepted streams.
    #[must_use]
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config = self.config.tcp_nodelay(enabled);
        self
    }

    /// Sets the overlapping `send` policy.
    #[must_use]
    pub fn write_policy(mut self, policy: WritePolicy) -> Self {
        self.config = self.config.write_policy(policy);
        self
    }

    /// Sets the accept callback, invoked once per established session on
    /// the worker thread.
    #[must_use]
    pub fn on_accept<F>(mut self, on_accept: F) -> Self
    where
        F: Fn(Session) + Send + Sync + 'static,
    {
        self.on_accept = Some(Arc::new(on_accept));
        self
    }

    /// Creates the execution context and binds the listening socket.
    ///
    /// Nothing is accepted until [`ServerHandle::run`].
    ///
    /// # Errors
    /// Returns [`ServerError::MissingAcceptHandler`] without an accept
    /// callback, [`ServerError::Transport`] if bind or listen fails, and
    /// [`ServerError::Lifecycle`] if the runtime cannot be created.
    pub fn build(self) -> Result<ServerHandle, ServerError> {
        let on_accept = self.on_accept.ok_or(ServerError::MissingAcceptHandler)?;
        let listener = Listener::bind_shared(self.config.clone(), on_accept)?;
        let context = ExecutionContext::new()?;

        Ok(ServerHandle {
            context,
            listener,
            config: self.config,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A WebSocket server: one listener driven by one execution context.
///
/// Dropping the handle shuts the server down: accepting stops, every
/// session closes, the worker thread is joined, then the listener is
/// released.
pub struct ServerHandle {
    context: ExecutionContext,
    listener: Listener,
    config: ServerConfig,
}

impl ServerHandle {
    /// Binds `address:port` and prepares the server.
    ///
    /// # Arguments
    /// * `address` - IPv4 or IPv6 literal
    /// * `port` - Port to bind; 0 selects an ephemeral port
    /// * `on_accept` - Invoked once per established session
    ///
    /// # Errors
    /// Returns [`ServerError::Transport`] if the address does not parse or
    /// bind/listen fails.
    pub fn new<F>(address: &str, port: u16, on_accept: F) -> Result<Self, ServerError>
    where
        F: Fn(Session) + Send + Sync + 'static,
    {
        let config = ServerConfig::from_parts(address, port)?;
        ServerBuilder::new()
            .config(config)
            .on_accept(on_accept)
            .build()
    }

    /// Starts accepting and spawns the worker thread. Returns immediately.
    ///
    /// # Errors
    /// Returns [`LifecycleError::AlreadyRunning`] on a second call and
    /// [`LifecycleError::Stopped`] after shutdown.
    pub fn run(&self) -> Result<(), ServerError> {
        self.listener.run(&self.context.handle())?;
        self.context.run()?;
        tracing::info!(addr = %self.local_addr(), "server running");
        Ok(())
    }

    /// Returns the bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Returns true while the worker thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.context.is_running()
    }

    /// Returns true while the worker runs and the accept loop has not
    /// stopped, either by shutdown or on an unrecoverable accept error.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.is_running() && !self.listener.is_stopped()
    }

    /// Returns the number of sessions that have not reached `Closed`.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.listener.live_sessions()
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shuts the server down and waits for the worker thread.
    ///
    /// # Errors
    /// Returns [`LifecycleError::JoinFromWorker`] when called from a
    /// callback. The server still shuts down, without being joined.
    pub fn shutdown(self) -> Result<(), ServerError> {
        self.stop()?;
        Ok(())
    }

    fn stop(&self) -> Result<(), LifecycleError> {
        // Order matters: no new sessions, then sessions close and the
        // worker drains, then the listener goes away with `self`.
        self.listener.stop();
        self.context.stop()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "server shutdown incomplete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironws_transport::TransportError;

    fn loopback() -> ServerBuilder {
        ServerBuilder::new().bind("127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn test_server_builder_default() {
        let builder = ServerBuilder::default();
        assert_eq!(builder.config.bind_addr.port(), 9000);
        assert!(builder.on_accept.is_none());
    }

    #[test]
    fn test_server_builder_settings() {
        let builder = loopback()
            .port(4321)
            .backlog(32)
            .max_connections(10)
            .max_message_size(1024)
            .handshake_timeout(Duration::from_secs(3))
            .close_timeout(Duration::from_millis(500))
            .tcp_nodelay(false)
            .write_policy(WritePolicy::Reject);

        let config = &builder.config;
        assert_eq!(config.bind_addr, "127.0.0.1:4321".parse().unwrap());
        assert_eq!(config.backlog, 32);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.close_timeout, Duration::from_millis(500));
        assert!(!config.tcp_nodelay);
        assert_eq!(config.write_policy, WritePolicy::Reject);
    }

    #[test]
    fn test_build_requires_accept_callback() {
        let result = loopback().build();
        assert!(matches!(result, Err(ServerError::MissingAcceptHandler)));
    }

    #[test]
    fn test_build_binds_ephemeral_port() {
        let server = loopback().on_accept(|_| {}).build().unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(!server.is_running());
    }

    #[test]
    fn test_new_rejects_bad_address() {
        let result = ServerHandle::new("not-an-address", 0, |_| {});
        assert!(matches!(
            result,
            Err(ServerError::Transport(TransportError::AddrParse(_)))
        ));
    }

    #[test]
    fn test_new_reports_bind_failure() {
        let first = ServerHandle::new("127.0.0.1", 0, |_| {}).unwrap();
        let port = first.local_addr().port();
        match ServerHandle::new("127.0.0.1", port, |_| {}) {
            Err(ServerError::Transport(e)) => assert!(e.is_bind_error()),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("second bind on port {port} succeeded"),
        }
    }

    #[test]
    fn test_run_and_shutdown() {
        let server = ServerHandle::new("127.0.0.1", 0, |_| {}).unwrap();
        assert!(!server.is_accepting());
        server.run().unwrap();
        assert!(server.is_running());
        assert!(server.is_accepting());
        server.shutdown().unwrap();
    }

    #[test]
    fn test_run_twice_fails() {
        let server = ServerHandle::new("127.0.0.1", 0, |_| {}).unwrap();
        server.run().unwrap();
        assert!(matches!(
            server.run(),
            Err(ServerError::Lifecycle(LifecycleError::AlreadyRunning))
        ));
    }

    #[test]
    fn test_not_accepting_once_listener_stops() {
        let server = ServerHandle::new("127.0.0.1", 0, |_| {}).unwrap();
        server.run().unwrap();
        server.listener.stop();
        assert!(server.is_running());
        assert!(!server.is_accepting());
    }

    #[test]
    fn test_drop_without_run() {
        let server = ServerHandle::new("127.0.0.1", 0, |_| {}).unwrap();
        drop(server);
    }
}
