//! Configuration management for the resource loader
//!
//! Handles configuration loading and validation: base modules, sources,
//! request context, query budget, module store and logging.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default query-string budget for one batch request
pub const DEFAULT_MAX_QUERY_LENGTH: usize = 5000;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Loader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Modules every other module implicitly depends on
    #[serde(default = "default_base_modules")]
    pub base_modules: Vec<String>,

    /// Source id to load endpoint; modules default to the `local` source
    #[serde(default = "default_sources")]
    pub sources: IndexMap<String, String>,

    /// Upper bound on a batch request's query string
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,

    /// Parameters sent with every batch request
    #[serde(default)]
    pub request: RequestContext,

    /// Local module store
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

fn default_base_modules() -> Vec<String> {
    vec!["jquery".to_string(), "mediawiki.base".to_string()]
}

fn default_sources() -> IndexMap<String, String> {
    let mut sources = IndexMap::new();
    sources.insert("local".to_string(), "/w/load.php".to_string());
    sources
}

fn default_max_query_length() -> usize {
    DEFAULT_MAX_QUERY_LENGTH
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            base_modules: default_base_modules(),
            sources: default_sources(),
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
            request: RequestContext::default(),
            store: StoreConfig::default(),
            logging: None,
        }
    }
}

impl LoaderConfig {
    /// Load configuration from a TOML or JSON file, chosen by extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_toml_str(&content)?,
        };
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LoaderConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: LoaderConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_query_length == 0 {
            return Err(ConfigError::Invalid(
                "max_query_length must be greater than zero".to_string(),
            ));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid("no sources configured".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for base in &self.base_modules {
            if base.is_empty() {
                return Err(ConfigError::Invalid("empty base module name".to_string()));
            }
            if !seen.insert(base.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate base module: {}",
                    base
                )));
            }
        }
        if self.store.key.is_empty() {
            return Err(ConfigError::Invalid("store key cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Request parameters sent with every batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default = "default_lang")]
    pub lang: String,

    #[serde(default = "default_skin")]
    pub skin: String,

    /// Adds `debug=1` to every request
    #[serde(default)]
    pub debug: bool,

    /// Sent as `user` on requests for the user-specific group
    #[serde(default)]
    pub user_name: Option<String>,

    /// Group whose requests carry the user name
    #[serde(default)]
    pub user_group: i64,
}

fn default_lang() -> String {
    "en".to_string()
}

fn default_skin() -> String {
    "vector".to_string()
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            lang: default_lang(),
            skin: default_skin(),
            debug: false,
            user_name: None,
            user_group: 0,
        }
    }
}

/// Module store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map; contents live as long as the loader
    Memory,
    /// redb file at `store.path`
    Redb,
}

/// Local module store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// Database file for the redb backend
    #[serde(default)]
    pub path: Option<String>,

    /// Key the store record is persisted under
    #[serde(default = "default_store_key")]
    pub key: String,

    /// Invalidation token; a persisted record with a different vary is discarded
    #[serde(default = "default_vary")]
    pub vary: String,

    /// Largest encoded implementation that will be cached, in bytes
    #[serde(default = "default_max_entry_size")]
    pub max_entry_size: usize,

    /// Persisted records older than this are discarded
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Debounce window for persisting the store
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,

    /// Groups whose modules are never cached
    #[serde(default = "default_uncacheable_groups")]
    pub uncacheable_groups: Vec<i64>,
}

fn default_true() -> bool {
    true
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_store_key() -> String {
    "ModuleStore".to_string()
}

fn default_vary() -> String {
    "vector:1:en".to_string()
}

fn default_max_entry_size() -> usize {
    100_000
}

fn default_max_age_secs() -> u64 {
    30 * 24 * 3600
}

fn default_flush_delay_ms() -> u64 {
    2000
}

fn default_uncacheable_groups() -> Vec<i64> {
    vec![0, 1]
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: default_store_backend(),
            path: None,
            key: default_store_key(),
            vary: default_vary(),
            max_entry_size: default_max_entry_size(),
            max_age_secs: default_max_age_secs(),
            flush_delay_ms: default_flush_delay_ms(),
            uncacheable_groups: default_uncacheable_groups(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter, e.g. "info" or "resource_loader=debug". RUST_LOG takes precedence.
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the json-logging feature)
    #[serde(default)]
    pub json_format: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoaderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_query_length, 5000);
        assert_eq!(config.store.max_entry_size, 100_000);
        assert_eq!(config.store.uncacheable_groups, vec![0, 1]);
        assert_eq!(config.store.max_age_secs * 1000, 2_592_000_000);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = LoaderConfig::from_toml_str(
            r#"
            base_modules = ["base"]
            max_query_length = 2000

            [request]
            lang = "de"

            [store]
            vary = "vector:2:de"
            "#,
        )
        .unwrap();
        assert_eq!(config.base_modules, vec!["base"]);
        assert_eq!(config.request.lang, "de");
        assert_eq!(config.request.skin, "vector");
        assert_eq!(config.store.vary, "vector:2:de");
        assert_eq!(config.store.flush_delay_ms, 2000);
        assert!(config.sources.contains_key("local"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = LoaderConfig::from_toml_str("max_query_length = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = LoaderConfig::from_toml_str(r#"base_modules = ["a", "a"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mut config = LoaderConfig::default();
        config.sources.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_config() {
        let config =
            LoaderConfig::from_json_str(r#"{"request": {"debug": true, "user_name": "Alice"}}"#)
                .unwrap();
        assert!(config.request.debug);
        assert_eq!(config.request.user_name.as_deref(), Some("Alice"));
    }
}
