//! Listening socket ownership.
//!
//! # Responsibilities
//! - Bind to the configured address, or adopt an inherited descriptor
//! - Keep the master copy of the socket that survives listener restarts and
//!   upgrade handoff
//! - Hand out runtime clones for the accept loop
//! - Classify accept errors

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use thiserror::Error;
use tokio::net::TcpListener;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Configured address does not parse.
    #[error("Invalid listen address '{address}': {source}")]
    InvalidAddress {
        address: String,
        source: std::net::AddrParseError,
    },

    /// Failed to bind to address.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: io::Error,
    },

    /// Descriptor is not a usable listening socket.
    #[error("Failed to adopt listener: {0}")]
    Adopt(io::Error),
}

/// The master copy of a bound, listening TCP socket.
///
/// Dropping it closes this process's reference to the socket. Other
/// references (runtime clones, a handoff copy held by the next generation)
/// keep the socket itself open.
#[derive(Debug)]
pub struct BoundListener {
    inner: StdTcpListener,
    local_addr: SocketAddr,
}

impl BoundListener {
    /// Bind a fresh listening socket.
    pub fn bind(address: &str) -> Result<Self, ListenerError> {
        let addr: SocketAddr = address.parse().map_err(|source| ListenerError::InvalidAddress {
            address: address.to_string(),
            source,
        })?;

        let inner = StdTcpListener::bind(addr).map_err(|source| ListenerError::Bind { address: addr, source })?;
        let listener = Self::adopt(inner)?;

        tracing::info!(address = %listener.local_addr, "Listener bound");
        Ok(listener)
    }

    /// Take ownership of an already-listening socket.
    pub fn adopt(inner: StdTcpListener) -> Result<Self, ListenerError> {
        let local_addr = inner.local_addr().map_err(ListenerError::Adopt)?;
        inner.set_nonblocking(true).map_err(ListenerError::Adopt)?;
        Ok(Self { inner, local_addr })
    }

    /// Address this socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Create a runtime listener sharing this socket.
    pub fn to_tokio(&self) -> io::Result<TcpListener> {
        TcpListener::from_std(self.inner.try_clone()?)
    }

    /// Duplicate the descriptor for transfer to another process.
    pub fn duplicate_fd(&self) -> io::Result<OwnedFd> {
        Ok(OwnedFd::from(self.inner.try_clone()?))
    }
}

impl AsRawFd for BoundListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// What an accept error means for the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorKind {
    /// The listener went away because shutdown was already in progress.
    ExpectedShutdown,
    /// Affects one connection or is resource pressure; keep accepting.
    Transient,
    /// The listener is unusable.
    Fatal,
}

/// Classify an accept error.
///
/// `stopping` is whether a stop had been requested when the error surfaced;
/// any failure after that point is part of closing the listener.
pub fn classify_accept_error(err: &io::Error, stopping: bool) -> AcceptErrorKind {
    if stopping {
        return AcceptErrorKind::ExpectedShutdown;
    }

    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => AcceptErrorKind::Transient,
        _ => match err.raw_os_error() {
            // Descriptor or buffer exhaustion clears as connections finish.
            Some(code) if code == nix::libc::EMFILE
                || code == nix::libc::ENFILE
                || code == nix::libc::ENOBUFS
                || code == nix::libc::ENOMEM => AcceptErrorKind::Transient,
            _ => AcceptErrorKind::Fatal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_reports_invalid_address() {
        let err = BoundListener::bind("localhost").unwrap_err();
        assert!(matches!(err, ListenerError::InvalidAddress { .. }));
    }

    #[test]
    fn bind_conflict_is_bind_error() {
        let first = BoundListener::bind("127.0.0.1:0").unwrap();
        let err = BoundListener::bind(&first.local_addr().to_string()).unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }

    #[tokio::test]
    async fn runtime_clone_shares_socket() {
        let listener = BoundListener::bind("127.0.0.1:0").unwrap();
        let runtime = listener.to_tokio().unwrap();
        assert_eq!(runtime.local_addr().unwrap(), listener.local_addr());
        assert_ne!(runtime.as_raw_fd(), listener.as_raw_fd());
    }

    #[test]
    fn classify_errors() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(classify_accept_error(&reset, false), AcceptErrorKind::Transient);

        let emfile = io::Error::from_raw_os_error(nix::libc::EMFILE);
        assert_eq!(classify_accept_error(&emfile, false), AcceptErrorKind::Transient);

        let badf = io::Error::from_raw_os_error(nix::libc::EBADF);
        assert_eq!(classify_accept_error(&badf, false), AcceptErrorKind::Fatal);
        assert_eq!(classify_accept_error(&badf, true), AcceptErrorKind::ExpectedShutdown);
    }
}
