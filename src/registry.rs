//! Registry of currently claimed node names
//!
//! The pod controller queries this on every pod event, so reads dominate
//! writes by orders of magnitude; a reader/writer lock fits.

use std::collections::HashSet;

use parking_lot::RwLock;

/// The set of node names this process currently owns
#[derive(Debug, Default)]
pub struct NodeRegistry {
    inner: RwLock<HashSet<String>>,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a node. Returns true if the node was not already claimed.
    pub fn claim(&self, name: &str) -> bool {
        self.inner.write().insert(name.to_string())
    }

    /// Release a node. Returns true if the node was claimed.
    pub fn release(&self, name: &str) -> bool {
        self.inner.write().remove(name)
    }

    /// True when the named node is owned by this process
    pub fn has(&self, name: &str) -> bool {
        self.inner.read().contains(name)
    }

    /// Number of claimed nodes
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True when no node is claimed
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Snapshot of all claimed node names
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.read().iter().cloned().collect()
    }
}
