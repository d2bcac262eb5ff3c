//! Listening socket setup.

use crate::error::{SetupStage, TransportError};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Opens, configures, binds and listens on `addr`.
///
/// The steps run in order: open → `SO_REUSEADDR` → bind → listen →
/// non-blocking. The returned listener is ready to be registered with a
/// tokio reactor via [`tokio::net::TcpListener::from_std`].
///
/// # Arguments
/// * `addr` - Local address to bind; port 0 selects an ephemeral port
/// * `backlog` - Maximum length of the pending connection queue
///
/// # Errors
/// Returns [`TransportError::Setup`] naming the stage that failed.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, TransportError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| TransportError::setup(SetupStage::Open, addr, e))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| TransportError::setup(SetupStage::ReuseAddress, addr, e))?;

    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::setup(SetupStage::Bind, addr, e))?;

    socket
        .listen(backlog)
        .map_err(|e| TransportError::setup(SetupStage::Listen, addr, e))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::setup(SetupStage::NonBlocking, addr, e))?;

    let listener: TcpListener = socket.into();
    tracing::debug!(%addr, backlog, "listening socket ready");
    Ok(listener)
}

/// Returns true if an accept error only affects the connection being
/// accepted, so the accept loop may keep running.
#[must_use]
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Returns true if an accept error comes from exhausted process or system
/// resources, such as the file descriptor limit. These clear once other
/// connections close, so the accept loop backs off instead of stopping.
#[must_use]
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    #[cfg(unix)]
    {
        matches!(
            err.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
        )
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind_listener(addr, DEFAULT_BACKLOG).unwrap();
        let local = listener.local_addr().unwrap();
        assert_eq!(local.ip(), addr.ip());
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_bind_is_nonblocking() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind_listener(addr, 16).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_bind_address_in_use_reports_bind_stage() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = bind_listener(addr, DEFAULT_BACKLOG).unwrap();
        let taken = first.local_addr().unwrap();

        let err = bind_listener(taken, DEFAULT_BACKLOG).unwrap_err();
        assert_eq!(err.setup_stage(), Some(SetupStage::Bind));
        assert!(err.is_bind_error());
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::Interrupted
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(!is_transient_accept_error(&io::Error::other("fd limit")));
    }

    #[test]
    fn test_resource_exhaustion_errors() {
        assert!(is_resource_exhaustion(&io::Error::from(
            io::ErrorKind::OutOfMemory
        )));
        #[cfg(unix)]
        {
            assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(
                libc::EMFILE
            )));
            assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(
                libc::ENFILE
            )));
        }
        assert!(!is_resource_exhaustion(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::OutOfMemory
        )));
    }
}
