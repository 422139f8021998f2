//! Key-value backends for the module store
//!
//! The module store persists a single serialized record under one key. Any
//! backend offering get/set/remove/clear on string keys will do: an in-process
//! map, or a redb file behind the `redb` feature.

use anyhow::Result;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::config::{StoreBackend, StoreConfig};

/// Key-value storage abstraction
pub trait KeyValueStore {
    /// Get a value by key
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace a value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key
    fn remove(&self, key: &str) -> Result<()>;

    /// Clear all entries
    fn clear(&self) -> Result<()>;
}

/// Create the backend selected by configuration
pub fn create_store(config: &StoreConfig) -> Result<Rc<dyn KeyValueStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Rc::new(MemoryStore::new())),
        #[cfg(feature = "redb")]
        StoreBackend::Redb => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("redb store backend requires store.path"))?;
            Ok(Rc::new(redb_impl::RedbStore::open(path)?))
        }
        #[cfg(not(feature = "redb"))]
        StoreBackend::Redb => Err(anyhow::anyhow!(
            "Redb backend not available (feature not enabled)"
        )),
    }
}

/// In-process backend
///
/// Can be switched unavailable (every operation fails) and given a quota (a
/// `set` whose value exceeds it fails), to exercise the store's error paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RefCell<HashMap<String, String>>,
    unavailable: Cell<bool>,
    quota: Cell<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.set(unavailable);
    }

    pub fn set_quota(&self, quota: Option<usize>) {
        self.quota.set(quota);
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.get() {
            anyhow::bail!("storage is unavailable");
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        if let Some(quota) = self.quota.get() {
            if value.len() > quota {
                anyhow::bail!("quota exceeded: {} > {} bytes", value.len(), quota);
            }
        }
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.borrow_mut().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.check_available()?;
        self.entries.borrow_mut().clear();
        Ok(())
    }
}

#[cfg(feature = "redb")]
pub use redb_impl::RedbStore;

// Redb implementation
#[cfg(feature = "redb")]
mod redb_impl {
    use super::KeyValueStore;
    use anyhow::Result;
    use redb::{Database as RedbDb, ReadableTable, TableDefinition};
    use std::path::Path;

    static MODULE_STORE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("module_store");

    /// Single-table redb file
    pub struct RedbStore {
        db: RedbDb,
    }

    impl RedbStore {
        pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
            let db = RedbDb::create(path.as_ref())?;

            // Make sure the table exists so reads never fail on a fresh file
            let write_txn = db.begin_write()?;
            {
                let _ = write_txn.open_table(MODULE_STORE_TABLE)?;
            }
            write_txn.commit()?;

            Ok(Self { db })
        }
    }

    impl KeyValueStore for RedbStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(MODULE_STORE_TABLE)?;
            let result = table.get(key)?.map(|v| v.value().to_string());
            Ok(result)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(MODULE_STORE_TABLE)?;
                table.insert(key, value)?;
            }
            write_txn.commit()?;
            Ok(())
        }

        fn remove(&self, key: &str) -> Result<()> {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(MODULE_STORE_TABLE)?;
                table.remove(key)?;
            }
            write_txn.commit()?;
            Ok(())
        }

        fn clear(&self) -> Result<()> {
            let write_txn = self.db.begin_write()?;
            write_txn.delete_table(MODULE_STORE_TABLE)?;
            {
                let _ = write_txn.open_table(MODULE_STORE_TABLE)?;
            }
            write_txn.commit()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_basic_operations() {
        let store = MemoryStore::new();
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("a", "1").unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_unavailable_and_quota() {
        let store = MemoryStore::new();
        store.set_quota(Some(3));
        assert!(store.set("k", "1234").is_err());
        assert!(store.set("k", "123").is_ok());

        store.set_unavailable(true);
        assert!(store.get("k").is_err());
        store.set_unavailable(false);
        assert_eq!(store.get("k").unwrap().as_deref(), Some("123"));
    }

    #[cfg(feature = "redb")]
    #[test]
    fn test_redb_store_persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.set("ModuleStore", "{}").unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get("ModuleStore").unwrap().as_deref(), Some("{}"));
        store.clear().unwrap();
        assert_eq!(store.get("ModuleStore").unwrap(), None);
    }
}
