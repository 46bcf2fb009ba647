//! Live connection registry
//!
//! Each server keeps the set of its open connections here. Membership is
//! mutated from two directions:
//!
//! - the upgrade path adds a connection right after its 101 is written
//! - a connection's driver removes it when the transport goes away
//!
//! Removal is idempotent, so the driver and [`ConnectionRegistry::close_all`]
//! can race without double counting. Once `close_all` has run the registry
//! refuses new members.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::connection::{Connection, ConnectionId};

#[derive(Default)]
struct Members {
    connections: HashMap<ConnectionId, Connection>,
    closed: bool,
}

/// Set of live connections owned by one server
#[derive(Default)]
pub struct ConnectionRegistry {
    members: Mutex<Members>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection
    ///
    /// Returns `false` if the registry was already closed; the caller then
    /// owns tearing the connection down.
    pub fn add(&self, conn: Connection) -> bool {
        let mut members = self.members.lock();
        if members.closed {
            return false;
        }
        members.connections.insert(conn.id(), conn);
        true
    }

    /// Remove a connection
    ///
    /// Returns `true` if it was a member. Removing an absent connection is
    /// a no-op.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.members.lock().connections.remove(&id).is_some();
        if removed {
            debug!("Connection {} left the registry", id);
        }
        removed
    }

    /// Returns true if the connection is a member
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.lock().connections.contains_key(&id)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.members.lock().connections.len()
    }

    /// Returns true if there are no live connections
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once `close_all` has run
    pub fn is_closed(&self) -> bool {
        self.members.lock().closed
    }

    /// Visit every connection
    ///
    /// The visitor runs on a snapshot, outside the lock, so it may call back
    /// into the registry.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&Connection),
    {
        for conn in self.snapshot() {
            visit(&conn);
        }
    }

    /// Copy of the current members
    pub fn snapshot(&self) -> Vec<Connection> {
        self.members.lock().connections.values().cloned().collect()
    }

    /// Terminate every member and close the registry
    ///
    /// Members are taken out under the lock before any is terminated, so
    /// removals racing in from closing connections find nothing to remove.
    /// Returns the terminated connections.
    pub fn close_all(&self) -> Vec<Connection> {
        let drained: Vec<Connection> = {
            let mut members = self.members.lock();
            members.closed = true;
            members.connections.drain().map(|(_, conn)| conn).collect()
        };

        for conn in &drained {
            conn.terminate();
        }
        if !drained.is_empty() {
            debug!("Terminated {} connections", drained.len());
        }
        drained
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let members = self.members.lock();
        f.debug_struct("ConnectionRegistry")
            .field("len", &members.connections.len())
            .field("closed", &members.closed)
            .finish()
    }
}
