//! Live switch connections keyed by id.
//!
//! The protocol server inserts and removes entries; outbound listeners look a
//! connection up by the id carried on an event and queue bytes for its writer
//! task.

use crate::error::ConnectionError;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::debug;

/// Identifier assigned to a connection when it is accepted.
pub type ConnectionId = u64;

/// State kept for one open connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub connected_at: SystemTime,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl ConnectionHandle {
    /// `sender` feeds the connection's writer task.
    pub fn new(id: ConnectionId, peer_addr: SocketAddr, sender: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id,
            peer_addr,
            connected_at: SystemTime::now(),
            sender,
        }
    }
}

/// Concurrent map of open connections.
#[derive(Debug)]
pub struct ConnectionPool {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates a fresh, never reused connection id.
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Makes a connection reachable through [`ConnectionPool::send`].
    ///
    /// # Arguments
    ///
    /// * `handle` - The connection's id, peer and writer queue. A handle with
    ///   an id already in the pool replaces the old one, closing its writer.
    pub fn insert(&self, handle: ConnectionHandle) {
        debug!(connection = handle.id, peer = %handle.peer_addr, "Connection registered");
        self.connections.insert(handle.id, handle);
    }

    /// Forgets a connection. Once the returned handle is dropped the writer
    /// task flushes what is queued and closes the socket.
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    /// Queues `data` for the connection's writer task.
    pub fn send(&self, id: ConnectionId, data: Vec<u8>) -> Result<(), ConnectionError> {
        let sender = self
            .connections
            .get(&id)
            .map(|entry| entry.sender.clone())
            .ok_or(ConnectionError::NotFound(id))?;

        sender.send(data).map_err(|_| ConnectionError::Closed(id))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&id).map(|entry| entry.peer_addr)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drops every handle, which closes the writer side of each connection.
    pub fn close_all(&self) -> usize {
        let closed = self.connections.len();
        self.connections.clear();
        closed
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}
