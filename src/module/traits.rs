//! Module system traits and interfaces
//!
//! Defines the lifecycle state machine, the engine error type and the host
//! interface that module code runs against.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::module::script::{Messages, ModuleFunction, Templates};

/// Module lifecycle state
///
/// `registered → loading → loaded → executing → ready`, with `error` and
/// `missing` as terminal failure states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    /// Known to the registry, no code requested yet
    Registered,
    /// Enqueued into a network batch or cache lookup
    Loading,
    /// Code attached via implement, dependencies may still be pending
    Loaded,
    /// Code is running
    Executing,
    /// Executed successfully, exports available
    Ready,
    /// The module or one of its dependencies failed
    Error,
    /// The server denied knowledge of the module
    Missing,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Registered => "registered",
            ModuleState::Loading => "loading",
            ModuleState::Loaded => "loaded",
            ModuleState::Executing => "executing",
            ModuleState::Ready => "ready",
            ModuleState::Error => "error",
            ModuleState::Missing => "missing",
        }
    }

    /// `error` or `missing`
    pub fn is_failed(&self) -> bool {
        matches!(self, ModuleState::Error | ModuleState::Missing)
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModuleState::Ready | ModuleState::Error | ModuleState::Missing
        )
    }

    /// Whether a job waiting on a module in this state still has something to wait for
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ModuleState::Registered
                | ModuleState::Loading
                | ModuleState::Loaded
                | ModuleState::Executing
        )
    }

    /// Whether entering this state requires a propagation pass.
    ///
    /// `loading` and `executing` are short-lived and never schedule one.
    pub fn triggers_propagation(&self) -> bool {
        matches!(
            self,
            ModuleState::Loaded | ModuleState::Ready | ModuleState::Error | ModuleState::Missing
        )
    }

    fn rank(&self) -> u8 {
        match self {
            ModuleState::Registered => 0,
            ModuleState::Loading => 1,
            ModuleState::Loaded => 2,
            ModuleState::Executing => 3,
            ModuleState::Ready | ModuleState::Error | ModuleState::Missing => 4,
        }
    }

    /// Forward-only transition rule.
    pub fn can_transition_to(&self, next: ModuleState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            ModuleState::Error | ModuleState::Missing => true,
            ModuleState::Loading => *self == ModuleState::Registered,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleState {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(ModuleState::Registered),
            "loading" => Ok(ModuleState::Loading),
            "loaded" => Ok(ModuleState::Loaded),
            "executing" => Ok(ModuleState::Executing),
            "ready" => Ok(ModuleState::Ready),
            "error" => Ok(ModuleState::Error),
            "missing" => Ok(ModuleState::Missing),
            other => Err(ModuleError::InvalidState(other.to_string())),
        }
    }
}

/// Module system errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    #[error("module already registered: {0}")]
    DuplicateRegistration(String),

    #[error("source already registered: {0}")]
    DuplicateSource(String),

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Circular reference detected: {module} -> {dependency}")]
    CircularDependency { module: String, dependency: String },

    #[error("module already implemented: {0}")]
    AlreadyImplemented(String),

    #[error("Module in state \"{state}\" may not execute: {module}")]
    InvalidStateForExecution { module: String, state: ModuleState },

    #[error("Exception in module {module}: {message}")]
    ExecutionFailure { module: String, message: String },

    #[error("Failed dependency: {0}")]
    DependencyFailed(String),

    #[error("Module \"{0}\" is not loaded")]
    NotReady(String),

    #[error("Cannot require undefined file {0}")]
    UndefinedFile(String),

    #[error("Invalid type {0}")]
    InvalidContentType(String),

    #[error("Invalid module state: {0}")]
    InvalidState(String),

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Module store corrupted: {0}")]
    CacheCorruption(String),

    #[error("Malformed loader call: {0}")]
    Codec(String),

    #[error("Loader was dropped before the request settled")]
    LoaderGone,
}

impl From<crate::storage::codec::CodecError> for ModuleError {
    fn from(e: crate::storage::codec::CodecError) -> Self {
        ModuleError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for ModuleError {
    fn from(e: serde_json::Error) -> Self {
        ModuleError::Codec(e.to_string())
    }
}

/// Page-side collaborator that module payloads are applied to
///
/// Implemented by the embedder. The loader never holds internal borrows while
/// calling into the host, so implementations may call back into the loader.
pub trait ScriptHost {
    /// Evaluate legacy source text in the global scope
    fn eval(&self, source: &str) -> anyhow::Result<()>;

    /// Turn function source text (from the cache or a response) into a callable module function
    fn compile(&self, source: &str) -> anyhow::Result<ModuleFunction>;

    /// Insert a block of CSS text as one stylesheet
    fn insert_style(&self, css: &str);

    /// Insert a stylesheet link
    fn insert_link(&self, url: &str, media: Option<&str>);

    /// Fetch and run a script URL, then call `done` (on success or failure)
    fn add_script(&self, url: &str, done: Box<dyn FnOnce()>);

    /// Add localisation messages
    fn set_messages(&self, messages: &Messages);

    /// Register templates for a module
    fn set_templates(&self, module: &str, templates: &Templates);
}
