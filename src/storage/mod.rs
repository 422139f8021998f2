//! Local module store
//!
//! Write-through cache of executed module implementations, keyed by
//! `name@version`. Each item is the source of an implement call that
//! reproduces the registry entry. The whole store is persisted as one record
//! in a [`KeyValueStore`] backend; writes are queued and flushed once per
//! debounce window by the loader.

pub mod codec;
pub mod database;

pub use database::{create_store, KeyValueStore, MemoryStore};
#[cfg(feature = "redb")]
pub use database::RedbStore;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::module::loader::tracking::{ErrorSource, TrackedError};
use crate::module::registry::{split_module_key, Registry};
use crate::module::traits::{ModuleError, ModuleState};
use crate::utils::log_error;

/// `asOf` is recorded in units of 10^7 ms
const AS_OF_UNIT_MS: u64 = 10_000_000;

/// Store counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub failed: u64,
}

#[derive(Deserialize)]
struct StoreRecord {
    items: IndexMap<String, String>,
    vary: String,
    #[serde(rename = "asOf")]
    as_of: u64,
}

#[derive(Serialize)]
struct StoreRecordRef<'a> {
    items: &'a IndexMap<String, String>,
    vary: &'a str,
    #[serde(rename = "asOf")]
    as_of: u64,
}

/// Module store
pub struct ModuleStore {
    config: StoreConfig,
    backend: Rc<dyn KeyValueStore>,
    /// `None` until initialised
    enabled: Option<bool>,
    items: IndexMap<String, String>,
    queue: Vec<String>,
    pending_writes: bool,
    stats: StoreStats,
}

impl ModuleStore {
    pub fn new(config: StoreConfig, backend: Rc<dyn KeyValueStore>) -> Self {
        Self {
            config,
            backend,
            enabled: None,
            items: IndexMap::new(),
            queue: Vec::new(),
            pending_writes: false,
            stats: StoreStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled == Some(true)
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    /// Flush delay configured for this store
    pub fn flush_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.flush_delay_ms)
    }

    /// Initialise once per session: load the persisted record, or wipe it when disabled.
    pub fn init(&mut self, now_ms: u64) -> Option<TrackedError> {
        if self.enabled.is_some() {
            return None;
        }
        self.enabled = Some(false);
        if self.config.enabled {
            self.load(now_ms)
        } else {
            self.clear();
            None
        }
    }

    fn load(&mut self, now_ms: u64) -> Option<TrackedError> {
        let raw = match self.backend.get(&self.config.key) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Module store unavailable, caching disabled: {:#}", e);
                return None;
            }
        };
        self.enabled = Some(true);

        let raw = raw?;
        match serde_json::from_str::<StoreRecord>(&raw) {
            Ok(record) => {
                let max_age_ms = self.config.max_age_secs.saturating_mul(1000);
                let expires = record
                    .as_of
                    .saturating_mul(AS_OF_UNIT_MS)
                    .saturating_add(max_age_ms);
                if record.vary == self.config.vary && now_ms < expires {
                    info!("Loaded {} cached modules", record.items.len());
                    self.items = record.items;
                } else {
                    debug!(
                        "Discarding module store (vary {:?}, asOf {})",
                        record.vary, record.as_of
                    );
                }
                None
            }
            Err(e) => {
                let error = ModuleError::CacheCorruption(e.to_string());
                Some(TrackedError::new(ErrorSource::StoreInit, None, &error))
            }
        }
    }

    /// Cached implement source for the module's current key
    pub fn get(&mut self, registry: &Registry, module: &str) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        let key = registry.module_key(module)?;
        match self.items.get(&key) {
            Some(source) => {
                self.stats.hits += 1;
                Some(source.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Queue a module for the next flush.
    ///
    /// Returns true when this is the first pending write, meaning the caller
    /// must schedule a flush.
    pub fn add(&mut self, module: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.queue.push(module.to_string());
        if self.pending_writes {
            return false;
        }
        self.pending_writes = true;
        true
    }

    /// Encode one ready module into the store, unless it is ineligible.
    pub fn set(&mut self, registry: &Registry, module: &str) -> Option<TrackedError> {
        let descriptor = registry.get(module)?;
        let key = registry.module_key(module)?;
        if self.items.contains_key(&key)
            || descriptor.state() != ModuleState::Ready
            || descriptor.version().is_empty()
            || descriptor
                .group()
                .is_some_and(|g| self.config.uncacheable_groups.contains(&g))
        {
            return None;
        }
        let implementation = descriptor.payload.as_ref()?;

        let source = match codec::encode_implement(&key, implementation) {
            Ok(source) => source,
            Err(e) => {
                return Some(TrackedError::new(ErrorSource::StoreJson, Some(module), &e));
            }
        };
        if source.len() > self.config.max_entry_size {
            debug!(
                "Not caching {}: {} bytes exceeds {}",
                key,
                source.len(),
                self.config.max_entry_size
            );
            return None;
        }
        self.items.insert(key, source);
        None
    }

    /// Drop items whose key no longer matches the registry's current version.
    pub fn prune(&mut self, registry: &Registry) {
        let before = self.items.len();
        self.items.retain(|key, _| {
            let (name, _) = split_module_key(key);
            registry.module_key(name).as_deref() == Some(key.as_str())
        });
        self.stats.expired += (before - self.items.len()) as u64;
    }

    /// Forget every item and remove the persisted record.
    pub fn clear(&mut self) {
        self.items.clear();
        log_error(
            || self.backend.remove(&self.config.key),
            "Failed to remove module store record",
        );
    }

    /// Count a failed evaluation of cached implementations
    pub fn record_failure(&mut self) {
        self.stats.failed += 1;
    }

    /// Prune, encode queued modules and persist the record.
    pub fn flush(&mut self, registry: &Registry, now_ms: u64) -> Vec<TrackedError> {
        self.prune(registry);
        let mut errors = Vec::new();
        for module in std::mem::take(&mut self.queue) {
            if let Some(e) = self.set(registry, &module) {
                errors.push(e);
            }
        }
        if let Err(e) = self.persist(now_ms) {
            errors.push(TrackedError::new(
                ErrorSource::StoreUpdate,
                None,
                &format!("{:#}", e),
            ));
        }
        self.pending_writes = false;
        errors
    }

    fn persist(&self, now_ms: u64) -> anyhow::Result<()> {
        self.backend.remove(&self.config.key)?;
        let record = StoreRecordRef {
            items: &self.items,
            vary: &self.config.vary,
            as_of: now_ms.div_ceil(AS_OF_UNIT_MS),
        };
        let data = serde_json::to_string(&record)?;
        self.backend.set(&self.config.key, &data)?;
        debug!("Persisted {} cached modules", self.items.len());
        Ok(())
    }
}
