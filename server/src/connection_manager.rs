//! Registry of live WebSocket connections
//!
//! This module tracks every accepted control connection:
//! - Connection id allocation and capacity enforcement
//! - The outbound queue used to reach each connection
//! - Activity tracking for idle-connection reaping
//!
//! The transport is the only owner of this registry; everything else refers
//! to connections by id.

use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Fired to make a connection's reader send `CloseFrame` and stop.
pub type CloseSignal = oneshot::Sender<CloseFrame<'static>>;

/// One accepted control connection
#[derive(Debug)]
pub struct Connection {
    /// Unique id assigned by the server
    pub id: u32,
    /// Peer address, for logging
    pub addr: SocketAddr,
    pub connected_at: Instant,
    /// Last time a frame arrived from this peer
    pub last_seen: Instant,
    /// Queue drained by the connection's writer task
    pub sender: mpsc::UnboundedSender<Message>,
    closer: CloseSignal,
}

impl Connection {
    /// Creates a connection record stamped with the current time.
    ///
    /// `closer` is the only way to stop the connection's reader from the
    /// outside; it travels with the record until the connection is reaped.
    pub fn new(
        id: u32,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Message>,
        closer: CloseSignal,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            connected_at: now,
            last_seen: now,
            sender,
            closer,
        }
    }

    /// Records inbound activity, postponing idle reaping.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// True when nothing arrived from the peer within `timeout`
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all live connections and enforces the connection limit.
///
/// Ids start at 1 and are never reused during the life of the server, so a
/// stale id held by a slow handler can never reach a newer connection.
pub struct ConnectionManager {
    connections: HashMap<u32, Connection>,
    next_connection_id: u32,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            next_connection_id: 1,
            max_connections,
        }
    }

    /// Registers a connection.
    ///
    /// Returns the new id together with the receiving end of its close
    /// signal, or `None` when the server is at capacity. The signal fires
    /// when the connection is reaped by [`check_idle`](Self::check_idle) or
    /// [`drain`](Self::drain).
    pub fn add_connection(
        &mut self,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Option<(u32, oneshot::Receiver<CloseFrame<'static>>)> {
        if self.connections.len() >= self.max_connections {
            return None;
        }

        let id = self.next_connection_id;
        self.next_connection_id += 1;

        let (closer, closed) = oneshot::channel();
        info!("Connection {} opened from {}", id, addr);
        self.connections.insert(id, Connection::new(id, addr, sender, closer));
        Some((id, closed))
    }

    /// Forgets a connection. Returns false if it was already gone.
    pub fn remove_connection(&mut self, id: u32) -> bool {
        match self.connections.remove(&id) {
            Some(connection) => {
                info!(
                    "Connection {} from {} closed after {:.1}s",
                    id,
                    connection.addr,
                    connection.connected_at.elapsed().as_secs_f32()
                );
                true
            }
            None => false,
        }
    }

    /// Marks a connection as active. Returns false for unknown ids.
    pub fn touch(&mut self, id: u32) -> bool {
        match self.connections.get_mut(&id) {
            Some(connection) => {
                connection.touch();
                true
            }
            None => false,
        }
    }

    /// Outbound queue of one connection, if it is still registered.
    pub fn sender(&self, id: u32) -> Option<mpsc::UnboundedSender<Message>> {
        self.connections.get(&id).map(|c| c.sender.clone())
    }

    /// Snapshot of every live connection's queue, for broadcasting.
    pub fn senders(&self) -> Vec<(u32, mpsc::UnboundedSender<Message>)> {
        self.connections
            .iter()
            .map(|(id, c)| (*id, c.sender.clone()))
            .collect()
    }

    /// Removes connections idle for longer than `timeout` and returns their
    /// close signals so the caller can shut their readers down.
    pub fn check_idle(&mut self, timeout: Duration) -> Vec<(u32, CloseSignal)> {
        let idle: Vec<u32> = self
            .connections
            .iter()
            .filter(|(_, c)| c.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();

        idle.into_iter()
            .filter_map(|id| {
                let connection = self.connections.remove(&id)?;
                info!("Connection {} idle for over {:?}", id, timeout);
                Some((id, connection.closer))
            })
            .collect()
    }

    /// Removes every connection, returning their close signals.
    pub fn drain(&mut self) -> Vec<(u32, CloseSignal)> {
        self.connections
            .drain()
            .map(|(id, c)| (id, c.closer))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}
