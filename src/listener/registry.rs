//! Registry of live limited connections
//!
//! One registry per listener. It exists so a limit change can reach every open
//! connection; it never owns the connections themselves, only their
//! per-connection limiters, so there is no listener -> connection -> listener cycle.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::limiter::RateLimiter;

/// Identity of a registered connection, unique per registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mutex-guarded set of open connections
///
/// All three operations take the same lock, so `for_each` observes a
/// consistent snapshot relative to concurrent register/deregister calls.
pub struct ConnectionRegistry {
    /// Connection id -> per-connection limiter
    connections: Mutex<HashMap<ConnectionId, Arc<RateLimiter>>>,
    /// Next id to hand out
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection's limiter and return its id
    pub fn register(&self, limiter: Arc<RateLimiter>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut connections = self.connections.lock();
        connections.insert(id, limiter);
        debug!(conn_id = %id, active = connections.len(), "Connection registered");
        id
    }

    /// Remove a connection
    ///
    /// Returns `false` if it was not registered (already removed or never added).
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.lock();
        let removed = connections.remove(&id).is_some();
        if removed {
            debug!(conn_id = %id, active = connections.len(), "Connection deregistered");
        }
        removed
    }

    /// Visit every registered connection under the registry lock
    ///
    /// The visitor must not call back into the registry.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(ConnectionId, &RateLimiter),
    {
        let connections = self.connections.lock();
        for (id, limiter) in connections.iter() {
            visitor(*id, limiter);
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}
