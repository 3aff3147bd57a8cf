//! Connection state machine for accepted TCP connections.
//!
//! Each connection alternates between awaiting a receive completion and
//! awaiting a send completion. The connection also tracks which operation
//! contexts are currently outstanding against it, so teardown can be
//! deferred until every in-flight operation has been observed.

use slab::Slab;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Current state of the per-connection echo exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoState {
    /// A receive is outstanding; waiting for the next client message.
    AwaitingRecv,
    /// A send is outstanding; the echo reply is being written.
    AwaitingSend {
        /// Bytes already written.
        written: usize,
        /// Total bytes to write.
        total: usize,
    },
    /// Terminal state: the endpoint is closed (or closing) and the
    /// connection is waiting only for outstanding completions to drain.
    Closed,
}

/// A single accepted connection.
#[derive(Debug)]
pub struct Connection {
    /// File descriptor for the socket.
    pub fd: RawFd,
    /// Peer address, captured at accept time.
    pub peer: Option<SocketAddr>,
    /// Current echo exchange state.
    pub state: EchoState,
    /// Token of the outstanding receive context, if any.
    pub recv_ctx: Option<u64>,
    /// Token of the outstanding send context, if any.
    pub send_ctx: Option<u64>,
}

impl Connection {
    /// Create a new connection; the caller posts the first receive.
    pub fn new(fd: RawFd, peer: Option<SocketAddr>) -> Self {
        Self {
            fd,
            peer,
            state: EchoState::AwaitingRecv,
            recv_ctx: None,
            send_ctx: None,
        }
    }

    /// Transition to awaiting a send of `total` bytes.
    pub fn start_sending(&mut self, total: usize) {
        self.state = EchoState::AwaitingSend { written: 0, total };
    }

    /// Transition back to awaiting a receive.
    pub fn start_receiving(&mut self) {
        self.state = EchoState::AwaitingRecv;
    }

    /// Mark the connection closed. Outstanding completions still drain.
    pub fn close(&mut self) {
        self.state = EchoState::Closed;
    }

    /// Whether any operation context still references this connection.
    ///
    /// The connection must not be destroyed while this is true.
    pub fn has_outstanding(&self) -> bool {
        self.recv_ctx.is_some() || self.send_ctx.is_some()
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        if self.connections.contains(id) {
            Some(self.connections.remove(id))
        } else {
            None
        }
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection)> {
        self.connections.iter()
    }

    /// Iterate over all connections mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Connection)> {
        self.connections.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_state_transitions() {
        let mut conn = Connection::new(42, None);

        assert_eq!(conn.state, EchoState::AwaitingRecv);

        conn.start_sending(100);
        assert_eq!(
            conn.state,
            EchoState::AwaitingSend {
                written: 0,
                total: 100
            }
        );

        conn.start_receiving();
        assert_eq!(conn.state, EchoState::AwaitingRecv);

        conn.close();
        assert_eq!(conn.state, EchoState::Closed);
    }

    #[test]
    fn test_outstanding_tracking() {
        let mut conn = Connection::new(7, None);
        assert!(!conn.has_outstanding());

        conn.recv_ctx = Some(3);
        assert!(conn.has_outstanding());

        conn.send_ctx = Some(4);
        conn.recv_ctx = None;
        assert!(conn.has_outstanding());

        conn.send_ctx = None;
        assert!(!conn.has_outstanding());
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let c1 = Connection::new(10, None);
        let c2 = Connection::new(11, None);
        let c3 = Connection::new(12, None);

        let id1 = registry.insert(c1).unwrap();
        let id2 = registry.insert(c2).unwrap();

        // At capacity
        assert!(registry.insert(c3).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(id1).unwrap().fd, 10);
        assert_eq!(registry.get(id2).unwrap().fd, 11);

        registry.remove(id1);
        assert!(registry.get(id1).is_none());
        assert_eq!(registry.len(), 1);

        // Removing twice is rejected
        assert!(registry.remove(id1).is_none());
    }
}
