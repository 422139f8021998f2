//! Module loading engine
//!
//! The [`ModuleLoader`] owns the registry, the load queue, pending jobs, the
//! module store and the deferred task queue. State changes run through the
//! propagation loop, which fails dependents, executes modules whose
//! dependencies are ready and settles jobs.

mod execute;
pub mod loader;
mod propagation;
pub mod tasks;
pub mod tracking;

pub use loader::{ModuleLoader, Using, SITE_MODULE, USER_MODULE};
pub(crate) use loader::WeakLoader;
pub use tasks::TaskQueue;
pub use tracking::{ErrorSource, TrackedError, EXCEPTION_TOPIC};
