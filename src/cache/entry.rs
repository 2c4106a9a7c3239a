//! Cache Item Module
//!
//! Defines a single cached entry with idle-time TTL and access metadata.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::cache::{CallbackChain, ExpireCallback};

/// Mutable access metadata, guarded by the entry-local lock.
#[derive(Debug, Clone, Copy)]
struct AccessInfo {
    accessed_on: Instant,
    access_count: u64,
}

// == Cache Item ==
/// One cached key/value pair.
///
/// Key, data, life span and creation time never change after construction and
/// are read without locking. Access time, access count and the expire
/// callbacks sit behind locks owned by the item itself, so touching one item
/// never contends with the table's map or with other items.
pub struct CacheItem<K, V> {
    key: K,
    data: V,
    /// How long the item may stay idle before it is expired. Zero = never.
    life_span: Duration,
    created_on: Instant,
    access: RwLock<AccessInfo>,
    about_to_expire: Mutex<CallbackChain<dyn Fn(&K) + Send + Sync>>,
}

impl<K, V> CacheItem<K, V> {
    // == Constructor ==
    /// Creates a new item; creation and access time are both set to now.
    ///
    /// # Arguments
    /// * `key` - The item's cache key
    /// * `life_span` - Allowed idle time, `Duration::ZERO` for no expiry
    /// * `data` - The stored value
    pub fn new(key: K, life_span: Duration, data: V) -> Self {
        let now = Instant::now();
        Self {
            key,
            data,
            life_span,
            created_on: now,
            access: RwLock::new(AccessInfo {
                accessed_on: now,
                access_count: 0,
            }),
            about_to_expire: Mutex::new(CallbackChain::new()),
        }
    }

    // == Touch ==
    /// Marks the item as accessed, restarting its idle countdown (keep-alive).
    pub fn touch(&self) {
        let mut access = self.access.write();
        access.accessed_on = Instant::now();
        access.access_count += 1;
    }

    // == Key ==
    /// Returns the item's cache key.
    pub fn key(&self) -> &K {
        &self.key
    }

    // == Data ==
    /// Returns the stored value.
    pub fn data(&self) -> &V {
        &self.data
    }

    // == Life Span ==
    /// Returns the allowed idle time; zero means the item never expires.
    pub fn life_span(&self) -> Duration {
        self.life_span
    }

    // == Created On ==
    /// Returns when the item was added to the table.
    pub fn created_on(&self) -> Instant {
        self.created_on
    }

    // == Accessed On ==
    /// Last time the item was read or kept alive.
    pub fn accessed_on(&self) -> Instant {
        self.access.read().accessed_on
    }

    // == Access Count ==
    /// How often the item was read or kept alive.
    pub fn access_count(&self) -> u64 {
        self.access.read().access_count
    }

    // == Expiry ==
    /// Checks if the item has a reachable deadline at all.
    ///
    /// False for a zero life span and for a life span so large that the
    /// deadline does not fit in an `Instant`.
    pub fn can_expire(&self) -> bool {
        !self.life_span.is_zero() && self.created_on.checked_add(self.life_span).is_some()
    }

    /// Instant after which the item is expired, or None if it never expires.
    pub fn expires_at(&self) -> Option<Instant> {
        if !self.can_expire() {
            return None;
        }
        self.accessed_on().checked_add(self.life_span)
    }

    /// Checks if the item's deadline is at or before `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at().is_some_and(|deadline| deadline <= now)
    }

    // == Expire Callbacks ==
    /// Replaces all expire callbacks with `f`.
    pub fn set_expire_callback<F>(&self, f: F)
    where
        F: Fn(&K) + Send + Sync + 'static,
    {
        let handler: ExpireCallback<K> = Arc::new(f);
        self.about_to_expire.lock().set(handler);
    }

    /// Appends `f` to the expire callbacks.
    pub fn add_expire_callback<F>(&self, f: F)
    where
        F: Fn(&K) + Send + Sync + 'static,
    {
        let handler: ExpireCallback<K> = Arc::new(f);
        self.about_to_expire.lock().add(handler);
    }

    /// Empties the expire callbacks.
    pub fn clear_expire_callbacks(&self) {
        self.about_to_expire.lock().clear();
    }

    /// Runs the expire callbacks with this item's key, with no lock held.
    pub(crate) fn run_expire_callbacks(&self) {
        let handlers = self.about_to_expire.lock().snapshot();
        for handler in handlers {
            handler(&self.key);
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for CacheItem<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = *self.access.read();
        f.debug_struct("CacheItem")
            .field("key", &self.key)
            .field("data", &self.data)
            .field("life_span", &self.life_span)
            .field("created_on", &self.created_on)
            .field("accessed_on", &access.accessed_on)
            .field("access_count", &access.access_count)
            .finish()
    }
}
