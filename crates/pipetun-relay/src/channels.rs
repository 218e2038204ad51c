//! Channel pairing table
//!
//! Tracks every socket an engine owns and which sockets are paired. Pairing
//! is symmetric: if A is paired with B then B is paired with A, and closing
//! either side removes both entries at once. Only the engine's event loop
//! touches the table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Identifier of a tracked socket
pub type SocketId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    /// Accepted from a local listener
    Client,
    /// Dialed towards the remote side
    Remote,
    /// Pre-established tunnel connection waiting in a pool
    Pooled,
}

#[derive(Debug, Clone)]
pub struct TrackedSocket {
    pub role: SocketRole,
    /// Listener port the socket belongs to
    pub port: u16,
    pub peer: Option<SocketAddr>,
    pub since: Instant,
}

#[derive(Debug, Default)]
pub struct ChannelTable {
    next_id: SocketId,
    sockets: HashMap<SocketId, TrackedSocket>,
    peers: HashMap<SocketId, SocketId>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a socket
    pub fn track(&mut self, role: SocketRole, port: u16, peer: Option<SocketAddr>) -> SocketId {
        self.next_id += 1;
        let id = self.next_id;
        self.sockets.insert(
            id,
            TrackedSocket {
                role,
                port,
                peer,
                since: Instant::now(),
            },
        );
        id
    }

    /// Pair two tracked sockets
    ///
    /// Returns false if either socket is unknown or already paired.
    pub fn pair(&mut self, a: SocketId, b: SocketId) -> bool {
        if a == b
            || !self.sockets.contains_key(&a)
            || !self.sockets.contains_key(&b)
            || self.peers.contains_key(&a)
            || self.peers.contains_key(&b)
        {
            return false;
        }
        self.peers.insert(a, b);
        self.peers.insert(b, a);
        true
    }

    pub fn peer(&self, id: SocketId) -> Option<SocketId> {
        self.peers.get(&id).copied()
    }

    pub fn get(&self, id: SocketId) -> Option<&TrackedSocket> {
        self.sockets.get(&id)
    }

    /// Forget a socket and its peer
    ///
    /// Returns the ids that were removed.
    pub fn close(&mut self, id: SocketId) -> Vec<SocketId> {
        let mut closed = Vec::with_capacity(2);
        if self.sockets.remove(&id).is_some() {
            closed.push(id);
        }
        if let Some(peer) = self.peers.remove(&id) {
            self.peers.remove(&peer);
            if self.sockets.remove(&peer).is_some() {
                closed.push(peer);
            }
        }
        closed
    }

    /// Number of tracked sockets
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Number of established pairings
    pub fn pairings(&self) -> usize {
        self.peers.len() / 2
    }

    /// Number of tracked sockets with the given role on `port`
    pub fn count(&self, role: SocketRole, port: u16) -> usize {
        self.sockets
            .values()
            .filter(|s| s.role == role && s.port == port)
            .count()
    }
}
