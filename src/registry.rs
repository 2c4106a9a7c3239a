//! Table Registry
//!
//! Name → table directory. Tables are created on first use and live as long
//! as the registry does; there is no way to drop a single table.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use parking_lot::RwLock;
use tracing::debug;

use crate::cache::CacheTable;
use crate::config::Config;

// == Registry ==
/// Directory of named cache tables sharing one key and value type.
///
/// Construct one per process (or per test) and share it; a fresh registry is
/// an empty directory.
pub struct Registry<K, V> {
    tables: RwLock<HashMap<String, CacheTable<K, V>>>,
    config: Config,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates an empty registry; tables get `Config::default()`.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates an empty registry handing `config` to every table it creates.
    pub fn with_config(config: Config) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            config,
        }
    }

    // == Get Or Create ==
    /// Returns the table called `name`, creating it if it does not exist yet.
    ///
    /// Concurrent first calls for the same name all get the same table: the
    /// shared read misses, then the name is checked again under the write
    /// lock before anything is created.
    pub fn get_or_create(&self, name: &str) -> CacheTable<K, V> {
        if let Some(table) = self.tables.read().get(name) {
            return table.clone();
        }

        let mut tables = self.tables.write();
        // Double check: another caller may have created it in the meantime.
        if let Some(table) = tables.get(name) {
            return table.clone();
        }

        let table = CacheTable::with_config(name, self.config.clone());
        tables.insert(name.to_string(), table.clone());
        debug!(table = name, "Created cache table");
        table
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    /// Names of all tables, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for Registry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tables", &self.tables.read().len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry: Registry<String, u32> = Registry::new();

        let first = registry.get_or_create("users");
        first.insert("a".to_string(), Duration::ZERO, 1);
        let second = registry.get_or_create("users");

        assert!(first.ptr_eq(&second));
        assert_eq!(*second.get("a").unwrap().data(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_tables_are_independent() {
        let registry: Registry<String, u32> = Registry::new();

        let users = registry.get_or_create("users");
        let orders = registry.get_or_create("orders");
        users.insert("k".to_string(), Duration::ZERO, 1);

        assert!(!users.ptr_eq(&orders));
        assert!(!orders.exists("k"));

        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["orders".to_string(), "users".to_string()]);
        assert!(registry.contains("users"));
        assert!(!registry.contains("missing"));
    }

    #[test]
    fn test_tables_inherit_config() {
        let registry: Registry<String, u32> =
            Registry::with_config(Config { default_life_span: 12 });
        let table = registry.get_or_create("t");

        assert_eq!(table.config().life_span(), Duration::from_secs(12));
        assert_eq!(table.name(), "t");
    }

    #[test]
    fn test_concurrent_first_access_creates_one_table() {
        let registry: Arc<Registry<String, u32>> = Arc::new(Registry::new());
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_create("shared")
                })
            })
            .collect();

        let tables: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.len(), 1);
        assert!(tables.iter().all(|table| table.ptr_eq(&tables[0])));
    }
}
