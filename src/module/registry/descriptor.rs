//! Registry entries and registration requests

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::rc::Rc;

use crate::module::script::{Implementation, ModuleHandle, ModuleScript};
use crate::module::traits::ModuleState;

/// Source every module belongs to unless registered otherwise
pub const LOCAL_SOURCE: &str = "local";

/// Environment probe deciding whether a module is already satisfied.
///
/// Predicates run while the registry is being resolved and must not call back
/// into the loader.
pub type SkipCheck = Rc<dyn Fn() -> bool>;

/// Lazy skip predicate, evaluated at most once
#[derive(Clone, Default)]
pub(crate) enum Skip {
    #[default]
    None,
    Pending(SkipCheck),
    Evaluated(bool),
}

/// Dependency reference in a registration
///
/// Indices refer to the position of another entry in the same bulk
/// registration and are resolved to names before insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyRef {
    Name(String),
    Index(usize),
}

impl From<&str> for DependencyRef {
    fn from(name: &str) -> Self {
        DependencyRef::Name(name.to_string())
    }
}

impl From<String> for DependencyRef {
    fn from(name: String) -> Self {
        DependencyRef::Name(name)
    }
}

impl From<usize> for DependencyRef {
    fn from(index: usize) -> Self {
        DependencyRef::Index(index)
    }
}

/// Module registration request
#[derive(Clone)]
pub struct Registration {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) dependencies: Vec<DependencyRef>,
    pub(crate) group: Option<i64>,
    pub(crate) source: Option<String>,
    pub(crate) skip: Option<SkipCheck>,
}

impl Registration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            dependencies: Vec::new(),
            group: None,
            source: None,
            skip: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn dependencies<I, D>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DependencyRef>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn group(mut self, group: i64) -> Self {
        self.group = Some(group);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn skip<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + 'static,
    {
        self.skip = Some(Rc::new(check));
        self
    }

    pub(crate) fn skip_check(mut self, check: SkipCheck) -> Self {
        self.skip = Some(check);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("dependencies", &self.dependencies)
            .field("group", &self.group)
            .field("source", &self.source)
            .field("skip", &self.skip.is_some())
            .finish()
    }
}

/// Registry entry for one module
pub struct ModuleDescriptor {
    pub(crate) version: String,
    pub(crate) dependencies: Vec<String>,
    pub(crate) group: Option<i64>,
    pub(crate) source: String,
    pub(crate) skip: Skip,
    pub(crate) state: ModuleState,
    pub(crate) payload: Option<Implementation>,
    pub(crate) module: ModuleHandle,
    pub(crate) package_exports: IndexMap<String, Value>,
}

impl ModuleDescriptor {
    pub(crate) fn new(
        version: String,
        dependencies: Vec<String>,
        group: Option<i64>,
        source: String,
        skip: Option<SkipCheck>,
    ) -> Self {
        Self {
            version,
            dependencies,
            group,
            source,
            skip: skip.map_or(Skip::None, Skip::Pending),
            state: ModuleState::Registered,
            payload: None,
            module: ModuleHandle::new(),
            package_exports: IndexMap::new(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn group(&self) -> Option<i64> {
        self.group
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn is_implemented(&self) -> bool {
        self.payload.is_some()
    }

    pub fn script(&self) -> Option<&ModuleScript> {
        self.payload.as_ref().and_then(|p| p.script.as_ref())
    }

    pub fn exports(&self) -> &Value {
        &self.module.exports
    }
}

/// Read-only snapshot of a registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub group: Option<i64>,
    pub source: String,
    pub state: ModuleState,
    pub implemented: bool,
}

impl ModuleInfo {
    pub(crate) fn from_descriptor(name: &str, descriptor: &ModuleDescriptor) -> Self {
        Self {
            name: name.to_string(),
            version: descriptor.version.clone(),
            dependencies: descriptor.dependencies.clone(),
            group: descriptor.group,
            source: descriptor.source.clone(),
            state: descriptor.state,
            implemented: descriptor.is_implemented(),
        }
    }
}
