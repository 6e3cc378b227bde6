//! Which logical id is currently served by which live connection.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::client::{Connection, ConnectionId};

/// Lock-free map of logical id to live connection.
///
/// At most one connection is held per logical id; registering again
/// replaces the previous entry.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection`, returning the connection it replaced.
    pub fn register(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let replaced = self
            .connections
            .insert(connection.logical_id.clone(), connection.clone());
        match &replaced {
            Some(old) => info!(
                "Connection {} replaces {} for {}",
                connection.id, old.id, connection.logical_id
            ),
            None => info!(
                "Connection {} registered for {}",
                connection.id, connection.logical_id
            ),
        }
        replaced
    }

    /// Remove the entry for `logical_id` only if it still belongs to
    /// `connection_id`, so a stale socket cannot evict its replacement.
    pub fn unregister(&self, logical_id: &str, connection_id: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(logical_id, |_, current| current.id == connection_id)
            .is_some();
        if removed {
            info!("Connection {connection_id} unregistered from {logical_id}");
        } else {
            debug!("Connection {connection_id} was not registered for {logical_id}");
        }
        removed
    }

    pub fn get(&self, logical_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(logical_id).map(|c| c.clone())
    }

    pub fn contains(&self, logical_id: &str) -> bool {
        self.connections.contains_key(logical_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
