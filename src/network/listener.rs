//! Listener registration and isolated dispatch
//!
//! Callbacks run on the connection's dispatch task. Each one is invoked
//! against a snapshot of the registry, and a failing or panicking callback
//! is logged without affecting the others.

use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::connection::Connection;
use super::message::{Block, FilteredBlock, Tx};

/// Outcome of a listener callback
pub type ListenerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Connection lifecycle callback
pub type ConnectionCallback = dyn Fn(ConnectionEvent, &Connection) -> ListenerResult + Send + Sync;

/// Transaction callback
pub type TransactionCallback = dyn Fn(&Tx, &Connection) -> ListenerResult + Send + Sync;

/// Block callback, for full and filtered blocks
pub type BlockCallback = dyn Fn(&BlockEvent, &Connection) -> ListenerResult + Send + Sync;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned on registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Verack,
    Disconnected,
}

/// A block delivered to block listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockEvent {
    Full(Block),
    /// Merkle proof already verified against the header
    Filtered(FilteredBlock),
}

impl BlockEvent {
    pub fn hash(&self) -> crate::crypto::Sha256Hash {
        match self {
            BlockEvent::Full(block) => block.hash(),
            BlockEvent::Filtered(block) => block.hash(),
        }
    }
}

/// Ordered set of callbacks
pub struct ListenerRegistry<F: ?Sized> {
    listeners: RwLock<Vec<(ListenerId, Arc<F>)>>,
}

impl<F: ?Sized> Default for ListenerRegistry<F> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> ListenerRegistry<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<F>) -> ListenerId {
        let id = ListenerId::next();
        self.write().push((id, listener));
        id
    }

    /// Returns false if `id` was not registered here
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the current registrations
    pub fn snapshot(&self) -> Vec<(ListenerId, Arc<F>)> {
        self.read().clone()
    }

    /// Invoke `call` for every listener in the snapshot
    pub fn notify(&self, kind: &str, mut call: impl FnMut(&F) -> ListenerResult) {
        for (id, listener) in self.snapshot() {
            match panic::catch_unwind(AssertUnwindSafe(|| call(&listener))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("{} listener {} failed: {}", kind, id, e),
                Err(_) => log::warn!("{} listener {} panicked", kind, id),
            }
        }
    }

    // Private helpers

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<(ListenerId, Arc<F>)>> {
        // A poisoned list is still structurally valid
        self.listeners.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<(ListenerId, Arc<F>)>> {
        self.listeners.write().unwrap_or_else(|e| e.into_inner())
    }
}
