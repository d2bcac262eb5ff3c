//! Connection acceptor.
//!
//! The [`Listener`] binds its socket synchronously on construction, so
//! address problems surface to the caller immediately. Accepting starts on
//! [`Listener::run`]: the accept loop runs one accept at a time on the
//! execution context and hands each connection to its own task for the
//! WebSocket upgrade, so a slow handshake never delays the next accept.

use crate::config::ServerConfig;
use crate::context::ContextHandle;
use crate::error::LifecycleError;
use crate::session::{Session, SessionId, SessionSettings};
use ironws_transport::TransportError;
use ironws_transport::tcp::{
    bind_listener, is_resource_exhaustion, is_transient_accept_error, upgrade,
};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Callback invoked once per established session.
pub type AcceptCallback = Arc<dyn Fn(Session) + Send + Sync>;

/// Pause before accepting again after running out of file descriptors or
/// memory.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What the accept loop does after a failed accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Only the connection being accepted was affected.
    Retry,
    /// Resources are exhausted; retry after [`ACCEPT_BACKOFF`].
    Backoff,
    /// The listening socket is unusable.
    Fatal,
}

impl AcceptFailure {
    fn classify(err: &io::Error) -> Self {
        if is_transient_accept_error(err) {
            Self::Retry
        } else if is_resource_exhaustion(err) {
            Self::Backoff
        } else {
            Self::Fatal
        }
    }
}

/// Counts a session against `max_connections` until dropped.
pub(crate) struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn try_acquire(live: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        live.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < max).then_some(n + 1)
        })
        .ok()
        .map(|_| Self(Arc::clone(live)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Owns the listening socket and the accept loop.
pub struct Listener {
    local_addr: SocketAddr,
    socket: Mutex<Option<std::net::TcpListener>>,
    on_accept: AcceptCallback,
    config: Arc<ServerConfig>,
    stop: CancellationToken,
    live: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
}

impl Listener {
    /// Binds and listens on `config.bind_addr`.
    ///
    /// # Errors
    /// Returns [`TransportError::Setup`] naming the failed setup stage.
    pub fn bind<F>(config: ServerConfig, on_accept: F) -> Result<Self, TransportError>
    where
        F: Fn(Session) + Send + Sync + 'static,
    {
        Self::bind_shared(config, Arc::new(on_accept))
    }

    pub(crate) fn bind_shared(
        config: ServerConfig,
        on_accept: AcceptCallback,
    ) -> Result<Self, TransportError> {
        let socket = bind_listener(config.bind_addr, config.backlog)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            local_addr,
            socket: Mutex::new(Some(socket)),
            on_accept,
            config: Arc::new(config),
            stop: CancellationToken::new(),
            live: Arc::new(AtomicUsize::new(0)),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Returns the bound address, with the actual port if 0 was requested.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the number of sessions that have not reached `Closed`.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Schedules the accept loop on `context`.
    ///
    /// # Errors
    /// Returns [`LifecycleError::AlreadyRunning`] on a second call and
    /// [`LifecycleError::Stopped`] after [`stop`](Self::stop) or once the
    /// context is shutting down.
    pub fn run(&self, context: &ContextHandle) -> Result<(), LifecycleError> {
        if self.stop.is_cancelled() {
            return Err(LifecycleError::Stopped);
        }
        let socket = self
            .socket
            .lock()
            .take()
            .ok_or(LifecycleError::AlreadyRunning)?;

        let acceptor = Acceptor {
            local_addr: self.local_addr,
            context: context.clone(),
            on_accept: Arc::clone(&self.on_accept),
            config: Arc::clone(&self.config),
            stop: self.stop.clone(),
            live: Arc::clone(&self.live),
            next_id: Arc::clone(&self.next_id),
        };
        context.spawn(acceptor.run(socket))
    }

    /// Cancels the accept loop and closes the listening socket.
    ///
    /// Sessions already accepted are not affected.
    pub fn stop(&self) {
        self.stop.cancel();
        self.socket.lock().take();
    }

    /// Returns true once [`stop`](Self::stop) was called or the accept loop
    /// ended on an unrecoverable error.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct Acceptor {
    local_addr: SocketAddr,
    context: ContextHandle,
    on_accept: AcceptCallback,
    config: Arc<ServerConfig>,
    stop: CancellationToken,
    live: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
}

impl Acceptor {
    async fn run(self, socket: std::net::TcpListener) {
        let listener = match TcpListener::from_std(socket) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(addr = %self.local_addr, error = %e, "failed to register listener");
                self.stop.cancel();
                return;
            }
        };
        tracing::info!(addr = %self.local_addr, "listening");

        let shutdown = self.context.shutdown_token().clone();
        loop {
            let accepted = tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let e = match accepted {
                Ok((stream, peer)) => {
                    self.admit(stream, peer);
                    continue;
                }
                Err(e) => e,
            };

            let failure = AcceptFailure::classify(&e);
            let error = TransportError::Accept(e);
            match failure {
                AcceptFailure::Retry => {
                    tracing::warn!(addr = %self.local_addr, %error, "accept failed");
                }
                AcceptFailure::Backoff => {
                    tracing::warn!(addr = %self.local_addr, %error, backoff = ?ACCEPT_BACKOFF, "accept failed, backing off");
                    tokio::select! {
                        biased;
                        () = self.stop.cancelled() => break,
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
                AcceptFailure::Fatal => {
                    tracing::error!(addr = %self.local_addr, %error, "accept failed, listener stopping");
                    self.stop.cancel();
                    break;
                }
            }
        }

        tracing::info!(addr = %self.local_addr, "listener stopped");
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let max = self.config.max_connections;
        let Some(slot) = ConnectionSlot::try_acquire(&self.live, max) else {
            tracing::warn!(%peer, max, "max connections reached, rejecting");
            return;
        };
        if let Err(e) = stream.set_nodelay(self.config.tcp_nodelay) {
            tracing::warn!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let lane = establish(
            stream,
            peer,
            id,
            slot,
            self.context.clone(),
            Arc::clone(&self.on_accept),
            Arc::clone(&self.config),
        );
        if let Err(e) = self.context.spawn(lane) {
            tracing::debug!(%peer, error = %e, "dropping connection during shutdown");
        }
    }
}

/// Upgrades one accepted connection and hands the session to the
/// application.
async fn establish(
    stream: TcpStream,
    peer: SocketAddr,
    id: SessionId,
    slot: ConnectionSlot,
    context: ContextHandle,
    on_accept: AcceptCallback,
    config: Arc<ServerConfig>,
) {
    let upgrade_config = config.upgrade_config();
    let upgraded = tokio::select! {
        biased;
        () = context.shutdown_token().cancelled() => return,
        upgraded = upgrade(stream, &upgrade_config) => upgraded,
    };

    let ws = match upgraded {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };

    let settings = SessionSettings {
        write_policy: config.write_policy,
        close_timeout: config.close_timeout,
    };
    match Session::open(ws, id, peer, &context, settings, slot) {
        Ok(session) => {
            tracing::debug!(session_id = id, %peer, "session accepted");
            on_accept(session);
        }
        Err(e) => tracing::debug!(session_id = id, %peer, error = %e, "session not started"),
    }
}
