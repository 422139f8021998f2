//! Module system for the resource loader
//!
//! Modules are named, versioned units of script, style, messages and
//! templates. The registry tracks what is known about each module, the loader
//! moves modules through their lifecycle and the host applies payloads.

pub mod host;
pub mod loader;
pub mod registry;
pub mod require;
pub mod script;
pub mod traits;

pub use host::HeadlessHost;
pub use loader::{
    ErrorSource, ModuleLoader, TrackedError, Using, EXCEPTION_TOPIC, SITE_MODULE, USER_MODULE,
};
pub use registry::{
    Capabilities, DependencyRef, ModuleInfo, Registration, StartupManifest, LOCAL_SOURCE,
};
pub use require::Require;
pub use script::{
    Implementation, Messages, ModuleFunction, ModuleHandle, ModuleScript, PackageFile,
    StylePayload, Templates,
};
pub use traits::{ModuleError, ModuleState, ScriptHost};
