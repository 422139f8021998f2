//! Module registry
//!
//! Holds per-module metadata, lifecycle state and implementation payloads,
//! plus the source table that maps source ids to load endpoints.

pub mod dependencies;
pub mod descriptor;
pub mod manifest;

pub use dependencies::ModuleDependencies;
pub use descriptor::{
    DependencyRef, ModuleDescriptor, ModuleInfo, Registration, SkipCheck, LOCAL_SOURCE,
};
pub use manifest::{Capabilities, ManifestEntry, StartupManifest};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::module::traits::{ModuleError, ModuleState};

/// Registry of known modules, in registration order
#[derive(Default)]
pub struct Registry {
    modules: IndexMap<String, ModuleDescriptor>,
    sources: IndexMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a source id to its load endpoint
    pub fn add_source(&mut self, id: &str, url: &str) -> Result<(), ModuleError> {
        if self.sources.contains_key(id) {
            return Err(ModuleError::DuplicateSource(id.to_string()));
        }
        debug!("Registered source {} -> {}", id, url);
        self.sources.insert(id.to_string(), url.to_string());
        Ok(())
    }

    pub fn source_url(&self, id: &str) -> Option<&str> {
        self.sources.get(id).map(String::as_str)
    }

    /// Register one module. Index dependencies are only valid in bulk registration.
    pub fn register(&mut self, registration: Registration) -> Result<(), ModuleError> {
        let dependencies = registration
            .dependencies
            .iter()
            .map(|dep| match dep {
                DependencyRef::Name(name) => Ok(name.clone()),
                DependencyRef::Index(i) => Err(ModuleError::InvalidRegistration(format!(
                    "{}: dependency index {} outside a bulk registration",
                    registration.name, i
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.insert(registration, dependencies)
    }

    /// Register a list of modules whose dependencies may be given as indices into the list.
    ///
    /// Indices are resolved up front. Insertion stops at the first duplicate,
    /// leaving earlier entries registered.
    pub fn register_many(&mut self, registrations: Vec<Registration>) -> Result<(), ModuleError> {
        let names: Vec<String> = registrations.iter().map(|r| r.name.clone()).collect();
        let mut resolved = Vec::with_capacity(registrations.len());
        for registration in registrations {
            let dependencies = registration
                .dependencies
                .iter()
                .map(|dep| match dep {
                    DependencyRef::Name(name) => Ok(name.clone()),
                    DependencyRef::Index(i) => names.get(*i).cloned().ok_or_else(|| {
                        ModuleError::InvalidRegistration(format!(
                            "{}: dependency index {} out of range",
                            registration.name, i
                        ))
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?;
            resolved.push((registration, dependencies));
        }
        for (registration, dependencies) in resolved {
            self.insert(registration, dependencies)?;
        }
        Ok(())
    }

    fn insert(
        &mut self,
        registration: Registration,
        dependencies: Vec<String>,
    ) -> Result<(), ModuleError> {
        if self.modules.contains_key(&registration.name) {
            return Err(ModuleError::DuplicateRegistration(registration.name));
        }
        let source = registration
            .source
            .unwrap_or_else(|| LOCAL_SOURCE.to_string());
        let descriptor = ModuleDescriptor::new(
            registration.version,
            dependencies,
            registration.group,
            source,
            registration.skip,
        );
        self.modules.insert(registration.name, descriptor);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut ModuleDescriptor> {
        self.modules.get_mut(name)
    }

    pub(crate) fn get_index(&self, index: usize) -> Option<(&String, &ModuleDescriptor)> {
        self.modules.get_index(index)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ModuleDescriptor)> {
        self.modules.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ModuleDescriptor)> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    pub fn state(&self, name: &str) -> Option<ModuleState> {
        self.modules.get(name).map(|d| d.state)
    }

    /// Apply a state push if the transition rules allow it.
    ///
    /// Returns whether the state changed. Rejected pushes are logged and ignored.
    pub(crate) fn set_state(&mut self, name: &str, state: ModuleState) -> bool {
        let Some(descriptor) = self.modules.get_mut(name) else {
            warn!("State push for unknown module {}: {}", name, state);
            return false;
        };
        if descriptor.state == state {
            return false;
        }
        if !descriptor.state.can_transition_to(state) {
            warn!(
                "Ignoring state push for {}: {} -> {}",
                name, descriptor.state, state
            );
            return false;
        }
        debug!("Module {}: {} -> {}", name, descriptor.state, state);
        descriptor.state = state;
        true
    }

    /// `name@version` (the version may be empty)
    pub fn module_key(&self, name: &str) -> Option<String> {
        self.modules
            .get(name)
            .map(|d| format!("{}@{}", name, d.version))
    }

    /// True when every listed module is `ready`
    pub fn all_ready<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names
            .iter()
            .all(|name| self.state(name.as_ref()) == Some(ModuleState::Ready))
    }

    /// First listed module in `error` or `missing`
    pub fn any_failed<'a, S: AsRef<str>>(&self, names: &'a [S]) -> Option<&'a str> {
        names
            .iter()
            .map(|name| name.as_ref())
            .find(|name| self.state(name).is_some_and(|s| s.is_failed()))
    }

    /// Snapshot of one entry
    pub fn info(&self, name: &str) -> Option<ModuleInfo> {
        self.modules
            .get(name)
            .map(|d| ModuleInfo::from_descriptor(name, d))
    }
}

/// Split a module key on its last `@` into name and version.
pub fn split_module_key(key: &str) -> (&str, &str) {
    match key.rfind('@') {
        Some(at) if at > 0 => (&key[..at], &key[at + 1..]),
        _ => (key, ""),
    }
}
