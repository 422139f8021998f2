//! Resource Loader - client-side module loading runtime
//!
//! This crate maintains a registry of named, versioned modules, resolves their
//! dependency graphs, fetches their code in size-bounded batches (or from a
//! write-through local cache) and executes them once their dependencies are
//! satisfied.
//!
//! ## Architecture
//!
//! 1. **Registry** (`module::registry`): per-module metadata and lifecycle state
//! 2. **Dependency Resolver** (`module::registry::dependencies`): topological sort with cycle detection
//! 3. **Propagation Engine** (`module::loader`): fixed-point loop advancing states and firing callbacks
//! 4. **Request Batcher** (`network::batch`): groups fetches per source and group under a query budget
//! 5. **Local Cache Store** (`storage`): persisted `implement()` sources keyed by `name@version`
//!
//! ## Execution Model
//!
//! Everything runs on one thread. [`ModuleLoader`] is a cloneable handle over
//! interior state; deferred work (style flushes, cached evaluation, cache
//! persistence) is queued as tasks that the embedder drives with
//! [`ModuleLoader::run_pending_tasks`].

pub mod config;
pub mod module;
pub mod network;
pub mod storage;
pub mod utils;

// Re-export config module
pub use config::*;

pub use module::{
    Capabilities, ErrorSource, HeadlessHost, Implementation, ModuleError, ModuleFunction,
    ModuleHandle, ModuleInfo, ModuleLoader, ModuleScript, ModuleState, PackageFile, Registration,
    Require, ScriptHost, StartupManifest, StylePayload, TrackedError, Using,
};
pub use network::{BatchRequest, RecordingTransport, Transport};
pub use storage::{KeyValueStore, MemoryStore, ModuleStore, StoreStats};
