//! Bounded connection registry with completion-channel routing.

use std::collections::HashMap;

use rclink_fabric::cm::CmIdHandle;
use rclink_fabric::types::CompChannelHandle;

use crate::conn::Connection;

/// Holds every live connection, keyed by connection-manager identity, with
/// a secondary index from notification channel to identity for routing
/// completion events.
pub struct Registry {
    max_connections: usize,
    conns: HashMap<CmIdHandle, Connection>,
    by_channel: HashMap<CompChannelHandle, CmIdHandle>,
}

impl Registry {
    /// Empty registry admitting at most `max_connections` entries.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            conns: HashMap::new(),
            by_channel: HashMap::new(),
        }
    }

    /// True when no further connection may be admitted.
    pub fn at_capacity(&self) -> bool {
        self.conns.len() >= self.max_connections
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// True when no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Admit a connection. At capacity the connection is handed back
    /// unchanged so the caller can release its resources.
    pub fn insert(&mut self, conn: Connection) -> std::result::Result<(), Connection> {
        if self.at_capacity() {
            return Err(conn);
        }
        self.conns.insert(conn.id, conn);
        Ok(())
    }

    /// Remove and return a connection, dropping its channel route first.
    pub fn remove(&mut self, id: CmIdHandle) -> Option<Connection> {
        let conn = self.conns.remove(&id)?;
        self.by_channel.remove(&conn.channel);
        Some(conn)
    }

    /// Borrow a connection by identity.
    pub fn get_mut(&mut self, id: CmIdHandle) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    /// True if the identity is registered.
    pub fn contains(&self, id: CmIdHandle) -> bool {
        self.conns.contains_key(&id)
    }

    /// Start routing a channel's notifications to its connection.
    pub fn register_channel(&mut self, channel: CompChannelHandle, id: CmIdHandle) {
        self.by_channel.insert(channel, id);
    }

    /// Resolve a notification to the connection it belongs to. Unroutable
    /// notifications are stale by definition and the caller drops them.
    pub fn route(&mut self, channel: CompChannelHandle) -> Option<&mut Connection> {
        let id = *self.by_channel.get(&channel)?;
        self.conns.get_mut(&id)
    }

    /// Identities of every registered connection.
    pub fn ids(&self) -> Vec<CmIdHandle> {
        self.conns.keys().copied().collect()
    }
}
