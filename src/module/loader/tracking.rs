//! Error tracking channel
//!
//! Failures that must not interrupt the caller (callback errors, module
//! execution failures, cache problems) are logged and recorded here. The
//! embedder drains them with [`crate::ModuleLoader::take_tracked_errors`].

use serde::Serialize;
use std::fmt;
use tracing::warn;

/// Topic every tracked loader exception is published under
pub const EXCEPTION_TOPIC: &str = "resourceloader.exception";

/// Where a tracked error was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorSource {
    /// A job's ready or error callback failed
    LoadCallback,
    /// A module script failed while executing
    ModuleExecute,
    /// A registered module could not be resolved during a stubborn load
    Resolve,
    /// Evaluating cached implementations failed
    StoreEval,
    /// A module payload could not be encoded for the cache
    #[serde(rename = "store-localstorage-json")]
    StoreJson,
    /// Writing the cache record to the backend failed
    #[serde(rename = "store-localstorage-update")]
    StoreUpdate,
    /// The persisted cache record could not be parsed
    #[serde(rename = "store-localstorage-init")]
    StoreInit,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSource::LoadCallback => "load-callback",
            ErrorSource::ModuleExecute => "module-execute",
            ErrorSource::Resolve => "resolve",
            ErrorSource::StoreEval => "store-eval",
            ErrorSource::StoreJson => "store-localstorage-json",
            ErrorSource::StoreUpdate => "store-localstorage-update",
            ErrorSource::StoreInit => "store-localstorage-init",
        }
    }
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracked loader exception
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedError {
    pub topic: &'static str,
    pub source: ErrorSource,
    pub module: Option<String>,
    pub message: String,
}

impl TrackedError {
    pub fn new(source: ErrorSource, module: Option<&str>, error: &dyn fmt::Display) -> Self {
        Self {
            topic: EXCEPTION_TOPIC,
            source,
            module: module.map(str::to_string),
            message: error.to_string(),
        }
    }

    pub(crate) fn log(&self) {
        match &self.module {
            Some(module) => warn!(
                topic = self.topic,
                "Exception in {} in module {}: {}", self.source, module, self.message
            ),
            None => warn!(
                topic = self.topic,
                "Exception in {}: {}", self.source, self.message
            ),
        }
    }
}
