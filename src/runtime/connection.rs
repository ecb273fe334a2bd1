//! Connection state machine and the registry of live connections.
//!
//! A connection is owned by whichever pending operation currently
//! references it. Closing consumes the connection, so a closed
//! connection can never be handed to another operation.

use slab::Slab;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Identifier of a live connection, stable until it closes.
pub type ConnectionId = usize;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted and registered, no operation submitted yet.
    Accepted,
    /// A read is in flight.
    ReadPending,
    /// A worker is handling a completed read.
    Processing,
    /// A write is in flight.
    WritePending,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
    registry: Arc<ConnectionRegistry>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Transition to waiting for a read completion.
    pub fn start_reading(&mut self) {
        debug_assert!(
            !matches!(self.state, ConnState::ReadPending),
            "second read submitted on connection {}",
            self.id
        );
        self.state = ConnState::ReadPending;
    }

    /// Transition to handling a completed read.
    pub fn start_processing(&mut self) {
        debug_assert_eq!(self.state, ConnState::ReadPending);
        self.state = ConnState::Processing;
    }

    /// Transition to waiting for a write completion.
    pub fn start_writing(&mut self) {
        debug_assert!(
            matches!(self.state, ConnState::Processing | ConnState::WritePending),
            "write submitted from {:?}",
            self.state
        );
        self.state = ConnState::WritePending;
    }

    /// Close the connection.
    pub fn close(self) {
        drop(self);
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Unregister before the stream field drops and the fd number can be reused.
        self.registry.unregister(self.id);
        debug!(conn_id = self.id, peer = %self.peer, state = ?self.state, "Connection closed");
    }
}

/// Registry of live connections using slab allocation.
///
/// Registering a connection associates it with the server's completion
/// queue; the registry is what shutdown walks to force pending operations
/// on live sockets to complete.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<Slab<RawFd>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(Slab::with_capacity(max_connections.min(1024))),
            max_connections,
        })
    }

    /// Register an accepted stream.
    ///
    /// Returns `None` if the registry is at capacity, in which case the
    /// stream has been closed.
    pub fn register(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Option<Connection> {
        let id = {
            let mut connections = self.lock();
            if connections.len() >= self.max_connections {
                return None;
            }
            connections.insert(stream.as_raw_fd())
        };

        Some(Connection {
            id,
            stream,
            peer,
            state: ConnState::Accepted,
            registry: Arc::clone(self),
        })
    }

    fn unregister(&self, id: ConnectionId) {
        let mut connections = self.lock();
        if connections.contains(id) {
            connections.remove(id);
        }
    }

    /// Shut down both directions of every live socket.
    ///
    /// Operations in flight on those sockets complete with zero bytes or an
    /// error. Returns the number of sockets shut down.
    pub fn shutdown_all(&self) -> usize {
        let connections = self.lock();
        for (_, &fd) in connections.iter() {
            // The fd stays open while it is registered, so it cannot refer to another socket.
            unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
        }
        connections.len()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    fn lock(&self) -> MutexGuard<'_, Slab<RawFd>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
