//! Cache Table Module
//!
//! A named map of cache items with added/removed callbacks and a single
//! self-adjusting expiry scheduler.
//!
//! Locking is two-tier: the table's `RwLock` guards only the map structure,
//! each item guards its own access metadata. Callbacks always run with no
//! lock held, so they may call back into the table.

use std::borrow::Borrow;
use std::collections::hash_map::{self, HashMap};
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::cache::{CacheItem, CacheStats, CallbackChain, ItemCallback};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::tasks::{ExpiryScheduler, Sweep};

/// Produces a value for a key that missed the cache.
pub type DataLoader<K, V> = Arc<dyn Fn(&K) -> Option<V> + Send + Sync>;

type ItemChain<K, V> = CallbackChain<dyn Fn(&CacheItem<K, V>) + Send + Sync>;

// == Cache Table ==
/// Handle to a named cache table.
///
/// Cloning is cheap and every clone refers to the same table. The expiry task
/// only holds a weak reference, so the table (and its task) go away with the
/// last handle.
pub struct CacheTable<K, V> {
    inner: Arc<TableInner<K, V>>,
}

pub(crate) struct TableInner<K, V> {
    name: String,
    config: Config,
    items: RwLock<ItemMap<K, V>>,
    added_item: Mutex<ItemChain<K, V>>,
    about_to_delete_item: Mutex<ItemChain<K, V>>,
    load_data: RwLock<Option<DataLoader<K, V>>>,
    stats: Mutex<CacheStats>,
    scheduler: ExpiryScheduler,
}

/// The key → item map plus a count of items that can expire.
///
/// Reads go through `Deref`; every mutation goes through the methods below so
/// the count stays exact.
struct ItemMap<K, V> {
    entries: HashMap<K, Arc<CacheItem<K, V>>>,
    /// Items with a reachable deadline. Zero means the scheduler can idle.
    expiring: usize,
}

impl<K: Eq + Hash, V> ItemMap<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            expiring: 0,
        }
    }

    fn insert(&mut self, key: K, item: Arc<CacheItem<K, V>>) -> Option<Arc<CacheItem<K, V>>> {
        if item.can_expire() {
            self.expiring += 1;
        }
        let replaced = self.entries.insert(key, item);
        self.forget(replaced.as_deref());
        replaced
    }

    /// Inserts only if `key` is vacant; returns the new item.
    fn insert_vacant(
        &mut self,
        key: K,
        make: impl FnOnce(&K) -> CacheItem<K, V>,
    ) -> Option<Arc<CacheItem<K, V>>> {
        match self.entries.entry(key) {
            hash_map::Entry::Occupied(_) => None,
            hash_map::Entry::Vacant(slot) => {
                let item = Arc::new(make(slot.key()));
                if item.can_expire() {
                    self.expiring += 1;
                }
                slot.insert(item.clone());
                Some(item)
            }
        }
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<Arc<CacheItem<K, V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = self.entries.remove(key);
        self.forget(removed.as_deref());
        removed
    }

    fn take_all(&mut self) -> HashMap<K, Arc<CacheItem<K, V>>> {
        self.expiring = 0;
        std::mem::take(&mut self.entries)
    }

    /// True once no item in the map can ever expire.
    fn nothing_expiring(&self) -> bool {
        self.expiring == 0
    }

    fn forget(&mut self, item: Option<&CacheItem<K, V>>) {
        if item.is_some_and(|item| item.can_expire()) {
            self.expiring -= 1;
        }
    }
}

impl<K, V> Deref for ItemMap<K, V> {
    type Target = HashMap<K, Arc<CacheItem<K, V>>>;

    fn deref(&self) -> &Self::Target {
        &self.entries
    }
}

/// Outcome of a lookup under the read lock.
enum Lookup<K, V> {
    Hit(Arc<CacheItem<K, V>>),
    Expired(Arc<CacheItem<K, V>>),
    Miss,
}

impl<K, V> CacheTable<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    // == Constructor ==
    /// Creates an empty table with default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, Config::default())
    }

    /// Creates an empty table using `config` for its defaults.
    pub fn with_config(name: impl Into<String>, config: Config) -> Self {
        Self {
            inner: Arc::new(TableInner {
                name: name.into(),
                config,
                items: RwLock::new(ItemMap::new()),
                added_item: Mutex::new(CallbackChain::new()),
                about_to_delete_item: Mutex::new(CallbackChain::new()),
                load_data: RwLock::new(None),
                stats: Mutex::new(CacheStats::new()),
                scheduler: ExpiryScheduler::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // == Insert ==
    /// Stores `data` under `key` and returns the new item.
    ///
    /// An existing item under the same key is replaced silently: neither its
    /// expire callbacks nor the table's removed callbacks run. Added callbacks
    /// run after the item is visible in the map.
    ///
    /// # Arguments
    /// * `key` - The key to store
    /// * `life_span` - Allowed idle time, `Duration::ZERO` for no expiry
    /// * `data` - The value to store
    pub fn insert(&self, key: K, life_span: Duration, data: V) -> Arc<CacheItem<K, V>> {
        let item = Arc::new(CacheItem::new(key.clone(), life_span, data));
        {
            let mut items = self.inner.items.write();
            let replaced = items.insert(key, item.clone());
            // Overwrote the last expiring item with one that never expires.
            if replaced.is_some_and(|old| old.can_expire()) && items.nothing_expiring() {
                self.inner.scheduler.disarm();
            }
        }

        self.inner.run_added_callbacks(&item);
        self.schedule(&item);
        item
    }

    /// Stores `data` with the table's default life span.
    pub fn add(&self, key: K, data: V) -> Arc<CacheItem<K, V>> {
        self.insert(key, self.inner.config.life_span(), data)
    }

    // == Insert If Absent ==
    /// Stores `data` only if `key` has no current item.
    ///
    /// Returns true if the item was inserted. The check and the insertion
    /// happen under one write lock.
    pub fn insert_if_absent(&self, key: K, life_span: Duration, data: V) -> bool {
        let inserted = self
            .inner
            .items
            .write()
            .insert_vacant(key, |key| CacheItem::new(key.clone(), life_span, data));
        let Some(item) = inserted else {
            return false;
        };

        self.inner.run_added_callbacks(&item);
        self.schedule(&item);
        true
    }

    // == Get ==
    /// Returns the item for `key` and marks it as accessed.
    ///
    /// An item whose deadline has already passed is removed (running its
    /// callbacks) instead of being revived. On a miss the data loader, if
    /// set, may supply a value, which is inserted with the default life span.
    pub fn get<Q>(&self, key: &Q) -> Result<Arc<CacheItem<K, V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        loop {
            match self.inner.lookup_and_touch(key) {
                Lookup::Hit(item) => {
                    self.inner.stats.lock().record_hit();
                    return Ok(item);
                }
                Lookup::Expired(item) => {
                    self.inner.expire_item(&item);
                }
                Lookup::Miss => break,
            }
        }

        self.inner.stats.lock().record_miss();

        let loader = self.inner.load_data.read().clone();
        if let Some(loader) = loader {
            let key = key.to_owned();
            if let Some(data) = loader(&key) {
                trace!(table = %self.inner.name, "Loaded missing key through data loader");
                return Ok(self.add(key, data));
            }
        }

        Err(self.inner.not_found())
    }

    // == Remove ==
    /// Removes the item for `key`.
    ///
    /// The item's expire callbacks run first, then the table's removed
    /// callbacks; by then the key is already gone from the map.
    pub fn remove<Q>(&self, key: &Q) -> Result<Arc<CacheItem<K, V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = {
            let mut items = self.inner.items.write();
            let removed = items.remove(key);
            if removed.is_some() && items.nothing_expiring() {
                self.inner.scheduler.disarm();
            }
            removed
        };

        match removed {
            Some(item) => {
                self.inner.stats.lock().record_removal();
                debug!(table = %self.inner.name, "Removed item");
                self.inner.run_removal_callbacks(&item);
                Ok(item)
            }
            None => Err(self.inner.not_found()),
        }
    }

    // == Exists ==
    /// Checks membership without touching the item.
    pub fn exists<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.items.read().contains_key(key)
    }

    // == Count ==
    /// Returns the number of items currently stored.
    pub fn count(&self) -> usize {
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.read().is_empty()
    }

    // == For Each ==
    /// Calls `f` for every item in a point-in-time snapshot.
    ///
    /// The map lock is released before `f` runs.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<CacheItem<K, V>>),
    {
        for item in self.inner.snapshot() {
            f(&item);
        }
    }

    // == Most Accessed ==
    /// Returns up to `count` items, most accessed first.
    pub fn most_accessed(&self, count: usize) -> Vec<Arc<CacheItem<K, V>>> {
        let mut items: Vec<_> = self
            .inner
            .snapshot()
            .into_iter()
            .map(|item| (item.access_count(), item))
            .collect();
        items.sort_by(|a, b| b.0.cmp(&a.0));
        items.into_iter().take(count).map(|(_, item)| item).collect()
    }

    // == Flush ==
    /// Drops every item and returns the scheduler to idle.
    ///
    /// No per-item callbacks run; the table's callback chains are kept.
    pub fn flush(&self) {
        let discarded = {
            let mut items = self.inner.items.write();
            self.inner.scheduler.disarm();
            items.take_all()
        };
        self.inner.stats.lock().set_total_entries(0);
        debug!(table = %self.inner.name, discarded = discarded.len(), "Flushed table");
    }

    // == Stats ==
    /// Returns current table statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.set_total_entries(self.count());
        stats
    }

    /// Instant of the pending expiry wake-up, None when the scheduler is idle.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.inner.scheduler.deadline()
    }

    // == Added Callbacks ==
    /// Replaces all added callbacks with `f`.
    pub fn set_added_callback<F>(&self, f: F)
    where
        F: Fn(&CacheItem<K, V>) + Send + Sync + 'static,
    {
        let handler: ItemCallback<K, V> = Arc::new(f);
        self.inner.added_item.lock().set(handler);
    }

    /// Appends `f` to the added callbacks.
    pub fn add_added_callback<F>(&self, f: F)
    where
        F: Fn(&CacheItem<K, V>) + Send + Sync + 'static,
    {
        let handler: ItemCallback<K, V> = Arc::new(f);
        self.inner.added_item.lock().add(handler);
    }

    pub fn clear_added_callbacks(&self) {
        self.inner.added_item.lock().clear();
    }

    // == Removed Callbacks ==
    /// Replaces all removed callbacks with `f`.
    pub fn set_removed_callback<F>(&self, f: F)
    where
        F: Fn(&CacheItem<K, V>) + Send + Sync + 'static,
    {
        let handler: ItemCallback<K, V> = Arc::new(f);
        self.inner.about_to_delete_item.lock().set(handler);
    }

    /// Appends `f` to the removed callbacks.
    pub fn add_removed_callback<F>(&self, f: F)
    where
        F: Fn(&CacheItem<K, V>) + Send + Sync + 'static,
    {
        let handler: ItemCallback<K, V> = Arc::new(f);
        self.inner.about_to_delete_item.lock().add(handler);
    }

    pub fn clear_removed_callbacks(&self) {
        self.inner.about_to_delete_item.lock().clear();
    }

    // == Data Loader ==
    /// Sets the function consulted when `get` misses.
    pub fn set_data_loader<F>(&self, f: F)
    where
        F: Fn(&K) -> Option<V> + Send + Sync + 'static,
    {
        *self.inner.load_data.write() = Some(Arc::new(f));
    }

    pub fn clear_data_loader(&self) {
        *self.inner.load_data.write() = None;
    }

    /// Returns true if both handles refer to the same table.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Tells the scheduler about a (possibly earlier) deadline.
    fn schedule(&self, item: &CacheItem<K, V>) {
        if let Some(deadline) = item.expires_at() {
            self.inner.scheduler.arm(deadline, &self.inner);
        }
    }
}

impl<K, V> TableInner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn not_found(&self) -> CacheError {
        CacheError::NotFound(self.name.clone())
    }

    fn snapshot(&self) -> Vec<Arc<CacheItem<K, V>>> {
        self.items.read().values().cloned().collect()
    }

    /// Touches under the read lock so a concurrent sweep sees the new access time.
    fn lookup_and_touch<Q>(&self, key: &Q) -> Lookup<K, V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let items = self.items.read();
        match items.get(key) {
            Some(item) if item.is_expired_at(Instant::now()) => Lookup::Expired(item.clone()),
            Some(item) => {
                item.touch();
                Lookup::Hit(item.clone())
            }
            None => Lookup::Miss,
        }
    }

    /// Removes `item` if it is still the current, expired item for its key.
    fn expire_item(&self, item: &Arc<CacheItem<K, V>>) -> bool {
        let removed = {
            let mut items = self.items.write();
            let still_expired = items.get(item.key()).is_some_and(|current| {
                Arc::ptr_eq(current, item) && current.is_expired_at(Instant::now())
            });
            if still_expired {
                items.remove(item.key());
                if items.nothing_expiring() {
                    self.scheduler.disarm();
                }
            }
            still_expired
        };

        if removed {
            self.stats.lock().record_expirations(1);
            debug!(table = %self.name, "Expired item on access");
            self.run_removal_callbacks(item);
        }
        removed
    }

    fn run_added_callbacks(&self, item: &CacheItem<K, V>) {
        let handlers = self.added_item.lock().snapshot();
        for handler in handlers {
            handler(item);
        }
    }

    /// Item expire callbacks first, then the table's removed callbacks.
    fn run_removal_callbacks(&self, item: &CacheItem<K, V>) {
        item.run_expire_callbacks();

        let handlers = self.about_to_delete_item.lock().snapshot();
        for handler in handlers {
            handler(item);
        }
    }
}

impl<K, V> Sweep for TableInner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn sweep(&self, now: Instant) -> Option<Instant> {
        let (expired, next, remaining) = {
            let mut items = self.items.write();
            let expired_keys: Vec<K> = items
                .iter()
                .filter(|(_, item)| item.is_expired_at(now))
                .map(|(key, _)| key.clone())
                .collect();
            let expired: Vec<_> = expired_keys
                .iter()
                .filter_map(|key| items.remove(key))
                .collect();
            let next = items.values().filter_map(|item| item.expires_at()).min();
            (expired, next, items.len())
        };

        if expired.is_empty() {
            trace!(table = %self.name, "Expiry sweep: nothing to remove");
        } else {
            self.stats.lock().record_expirations(expired.len());
            info!(
                table = %self.name,
                removed = expired.len(),
                remaining,
                "Expiry sweep: removed expired items"
            );
        }

        for item in &expired {
            self.run_removal_callbacks(item);
        }
        next
    }

    fn label(&self) -> &str {
        &self.name
    }
}

impl<K, V> Clone for CacheTable<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for CacheTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTable")
            .field("name", &self.inner.name)
            .field("items", &self.inner.items.read().len())
            .field("next_expiry", &self.inner.scheduler.deadline())
            .finish()
    }
}
