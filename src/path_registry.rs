//! Path-based multiplexing of one listener
//!
//! Several WebSocket servers can share an [`HttpListener`](crate::HttpListener)
//! by claiming different request paths. The listener owns one
//! [`PathRegistry`]; every upgrade request is resolved against it by the path
//! component of its target (query strings never affect routing).
//!
//! - A server without a path claims the catch-all entry
//! - Exact path entries win over the catch-all
//! - At most one server may claim a given path on a listener
//! - Once the last server unregisters, the backing map is dropped entirely
//!
//! Entries hold weak references, so a server that is gone never receives
//! dispatches.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::request::{Request, request_path};
use crate::transport::Socket;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique listener identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Receiver of upgrade requests dispatched by a listener
pub trait UpgradeHandler: Send + Sync + 'static {
    /// Take over an upgrade request and its socket
    fn handle_upgrade(
        self: Arc<Self>,
        request: Request,
        socket: Socket,
        head: Bytes,
    ) -> BoxFuture<'static, ()>;

    /// The listener this handler is registered on failed to accept
    fn listener_error(&self, error: io::Error);
}

type Paths = HashMap<Option<String>, Weak<dyn UpgradeHandler>>;

/// Mapping from request path to the server that owns it, for one listener
pub struct PathRegistry {
    listener: ListenerId,
    entries: RwLock<Option<Paths>>,
}

impl PathRegistry {
    pub(crate) fn new(listener: ListenerId) -> Self {
        Self {
            listener,
            entries: RwLock::new(None),
        }
    }

    /// Identity of the listener this registry belongs to
    pub fn listener_id(&self) -> ListenerId {
        self.listener
    }

    /// Claim a path (or the catch-all entry for `None`)
    ///
    /// Fails with [`Error::PathConflict`] if a live handler already holds it.
    pub fn register(&self, path: Option<&str>, handler: Weak<dyn UpgradeHandler>) -> Result<()> {
        let key = path.map(String::from);
        let mut entries = self.entries.write();
        let paths = entries.get_or_insert_with(HashMap::new);

        match paths.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().strong_count() > 0 {
                    return Err(Error::PathConflict {
                        path: entry.key().clone(),
                    });
                }
                entry.insert(handler);
            }
            Entry::Vacant(entry) => {
                entry.insert(handler);
            }
        }

        debug!("{} claimed path {:?}", self.listener, path);
        Ok(())
    }

    /// Release a path held by `handler`
    ///
    /// Does nothing if the path is held by someone else. Returns `true` if
    /// an entry was removed.
    pub fn unregister(&self, path: Option<&str>, handler: &Weak<dyn UpgradeHandler>) -> bool {
        let mut entries = self.entries.write();
        let Some(paths) = entries.as_mut() else {
            return false;
        };

        let key = path.map(String::from);
        let owned = paths
            .get(&key)
            .is_some_and(|current| Weak::ptr_eq(current, handler));
        if !owned {
            return false;
        }

        paths.remove(&key);
        if paths.is_empty() {
            *entries = None;
        }
        debug!("{} released path {:?}", self.listener, path);
        true
    }

    /// Find the handler for a request target
    pub fn resolve(&self, target: &str) -> Option<Arc<dyn UpgradeHandler>> {
        let path = request_path(target);
        let entries = self.entries.read();
        let paths = entries.as_ref()?;

        paths
            .get(&Some(path.to_string()))
            .and_then(Weak::upgrade)
            .or_else(|| paths.get(&None).and_then(Weak::upgrade))
    }

    /// Number of claimed paths
    pub fn len(&self) -> usize {
        self.entries.read().as_ref().map_or(0, HashMap::len)
    }

    /// Returns true if no path is claimed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true while at least one server is registered
    ///
    /// Becomes false again once the last registration is removed.
    pub fn is_attached(&self) -> bool {
        self.entries.read().is_some()
    }

    /// Claimed paths (`None` is the catch-all entry)
    pub fn paths(&self) -> Vec<Option<String>> {
        self.entries
            .read()
            .as_ref()
            .map(|paths| paths.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every live handler
    pub(crate) fn handlers(&self) -> Vec<Arc<dyn UpgradeHandler>> {
        self.entries
            .read()
            .as_ref()
            .map(|paths| paths.values().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Report an accept failure to every registered handler
    pub(crate) fn notify_error(&self, error: &io::Error) {
        for handler in self.handlers() {
            handler.listener_error(io::Error::new(error.kind(), error.to_string()));
        }
    }
}

impl fmt::Debug for PathRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathRegistry")
            .field("listener", &self.listener)
            .field("paths", &self.paths())
            .finish()
    }
}
