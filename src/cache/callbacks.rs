//! Callback Chain Module
//!
//! Ordered handler lists used for entry expire hooks and table added/removed hooks.

use std::sync::Arc;

use crate::cache::CacheItem;

/// Handler run with a key right before its entry leaves the table.
pub type ExpireCallback<K> = Arc<dyn Fn(&K) + Send + Sync>;

/// Handler run with an entry on insertion or removal.
pub type ItemCallback<K, V> = Arc<dyn Fn(&CacheItem<K, V>) + Send + Sync>;

// == Callback Chain ==
/// Ordered list of handlers.
///
/// Handlers run in registration order. Callers take a [`snapshot`](Self::snapshot)
/// under their lock and invoke it after releasing the lock.
pub struct CallbackChain<F: ?Sized> {
    handlers: Vec<Arc<F>>,
}

impl<F: ?Sized> CallbackChain<F> {
    // == Constructor ==
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    // == Set ==
    /// Replaces the whole chain with a single handler.
    pub fn set(&mut self, handler: Arc<F>) {
        self.handlers.clear();
        self.handlers.push(handler);
    }

    // == Add ==
    /// Appends a handler to the end of the chain.
    pub fn add(&mut self, handler: Arc<F>) {
        self.handlers.push(handler);
    }

    // == Clear ==
    /// Removes every handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    // == Snapshot ==
    /// Clones the handler list so it can be run without holding a lock.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.handlers.clone()
    }

    // == Length ==
    /// Returns the number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<F: ?Sized> Default for CallbackChain<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> std::fmt::Debug for CallbackChain<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackChain")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
