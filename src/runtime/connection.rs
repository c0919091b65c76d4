//! Connection registry for sockets under poll monitoring.
//!
//! Client connections are stored in a slab so the poll token doubles as the
//! slab key, giving O(1) insert, lookup, and remove. Slab slots may be
//! reused after removal; the `serial` carried by each connection is a
//! monotonically increasing identifier that never is, so log lines always
//! name a connection unambiguously.

use mio::net::TcpStream;
use slab::Slab;
use std::net::SocketAddr;

/// A single accepted client connection.
#[derive(Debug)]
pub struct Connection {
    /// The non-blocking client socket.
    pub stream: TcpStream,
    /// Peer address captured at accept time.
    pub peer: SocketAddr,
    /// Monotonic identifier, unique for the lifetime of the registry.
    pub serial: u64,
}

/// Registry of active client connections keyed by poll token.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    next_serial: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Slab::new(),
            next_serial: 0,
        }
    }

    /// Insert a newly accepted connection, returning its poll token key.
    pub fn insert(&mut self, stream: TcpStream, peer: SocketAddr) -> usize {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.connections.insert(Connection {
            stream,
            peer,
            serial,
        })
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, key: usize) -> Option<&mut Connection> {
        self.connections.get_mut(key)
    }

    /// Remove a connection from the registry.
    ///
    /// Removing an absent key is a no-op returning `None`; a stale poll
    /// event may race with an earlier removal in the same round.
    pub fn remove(&mut self, key: usize) -> Option<Connection> {
        self.connections.try_remove(key)
    }

    /// Check if a connection exists.
    pub fn contains(&self, key: usize) -> bool {
        self.connections.contains(key)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Remove and return every connection, oldest first.
    ///
    /// Shutdown closes connections in arrival order; slab iteration order
    /// is slot order, so sort by serial.
    pub fn drain(&mut self) -> Vec<Connection> {
        let mut drained: Vec<Connection> = self.connections.drain().collect();
        drained.sort_by_key(|c| c.serial);
        drained
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
