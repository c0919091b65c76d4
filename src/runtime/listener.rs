//! Listening-socket acquisition.
//!
//! Resolves a hostname/port into candidate local addresses (both address
//! families) and tries each in order: create the socket, enable address
//! reuse, bind. The first candidate that binds is put into listening mode;
//! if none binds the server cannot start.

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::debug;

/// A bound, listening socket together with its resolved local address.
#[derive(Debug)]
pub struct BoundListener {
    pub listener: TcpListener,
    pub local_addr: SocketAddr,
}

/// Resolve `host:port` and bind the first workable candidate address.
///
/// Candidates that fail to bind are closed and skipped. The returned
/// listener is non-blocking and ready for poll registration.
pub fn acquire(host: &str, port: u16, backlog: i32) -> Result<BoundListener, AcquireError> {
    let candidates = (host, port)
        .to_socket_addrs()
        .map_err(|e| AcquireError::Resolve(host.to_string(), port, e))?;

    for addr in candidates {
        match bind_candidate(addr, backlog) {
            Ok(listener) => {
                let local_addr = listener
                    .local_addr()
                    .map_err(AcquireError::Listen)?;
                return Ok(BoundListener {
                    listener: TcpListener::from_std(listener),
                    local_addr,
                });
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "Candidate address failed, trying next");
            }
        }
    }

    Err(AcquireError::NoBindableAddress(host.to_string(), port))
}

fn bind_candidate(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    // Dropping the socket on any error closes the partial fd.
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Errors from listening-socket acquisition. All are fatal at startup.
#[derive(Debug)]
pub enum AcquireError {
    /// Hostname resolution failed outright.
    Resolve(String, u16, io::Error),
    /// Every resolved candidate failed to bind.
    NoBindableAddress(String, u16),
    /// The bound socket could not report its local address.
    Listen(io::Error),
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquireError::Resolve(host, port, e) => {
                write!(f, "Failed to resolve {}:{}: {}", host, port, e)
            }
            AcquireError::NoBindableAddress(host, port) => {
                write!(f, "No suitable address available for {}:{}", host, port)
            }
            AcquireError::Listen(e) => write!(f, "Listening socket unusable: {}", e),
        }
    }
}

impl std::error::Error for AcquireError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_ephemeral_port() {
        let bound = acquire("localhost", 0, 5).unwrap();
        assert_ne!(bound.local_addr.port(), 0);
        assert!(bound.local_addr.ip().is_loopback());
    }

    #[test]
    fn test_acquire_unresolvable_host() {
        let err = acquire("no-such-host.invalid", 0, 5).unwrap_err();
        match err {
            AcquireError::Resolve(host, _, _) | AcquireError::NoBindableAddress(host, _) => {
                assert_eq!(host, "no-such-host.invalid");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_acquired_listener_accepts() {
        let bound = acquire("127.0.0.1", 0, 5).unwrap();
        let client = std::net::TcpStream::connect(bound.local_addr).unwrap();
        assert_eq!(client.peer_addr().unwrap(), bound.local_addr);
    }
}
