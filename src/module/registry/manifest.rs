//! Startup manifest parsing
//!
//! The startup manifest is the JSON document a server embeds to seed the
//! registry: either a bare array of module tuples, or an object carrying
//! `sources` and `modules`. Each tuple is
//! `[name, version?, dependencies?, group?, source?, skip?]`, where
//! dependencies may be names or indices into the same array and `skip` names a
//! capability probe.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use tracing::warn;

use crate::module::registry::descriptor::{DependencyRef, Registration, SkipCheck};
use crate::module::traits::ModuleError;

/// Named environment probes that manifest entries can reference as skip predicates
#[derive(Clone, Default)]
pub struct Capabilities {
    probes: HashMap<String, SkipCheck>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a probe. A probe returning true means the module is already satisfied.
    pub fn insert<F>(&mut self, name: impl Into<String>, probe: F)
    where
        F: Fn() -> bool + 'static,
    {
        self.probes.insert(name.into(), Rc::new(probe));
    }

    /// Register a probe with a fixed answer
    pub fn set(&mut self, name: impl Into<String>, present: bool) {
        self.insert(name, move || present);
    }

    fn get(&self, name: &str) -> Option<SkipCheck> {
        self.probes.get(name).cloned()
    }
}

/// One module entry of the startup manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<DependencyRef>,
    pub group: Option<i64>,
    pub source: Option<String>,
    pub skip: Option<String>,
}

impl ManifestEntry {
    fn from_value(position: usize, value: Value) -> Result<Self, ModuleError> {
        let invalid = |what: &str| {
            ModuleError::InvalidRegistration(format!("manifest entry {}: {}", position, what))
        };

        let Value::Array(fields) = value else {
            return Err(invalid("expected an array"));
        };
        let mut fields = fields.into_iter();

        let name = match fields.next() {
            Some(Value::String(name)) if !name.is_empty() => name,
            _ => return Err(invalid("missing module name")),
        };
        let version = match fields.next() {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(v)) => v,
            Some(Value::Number(n)) => n.to_string(),
            Some(_) => return Err(invalid("version must be a string or number")),
        };
        let dependencies = match fields.next() {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(deps)) => deps
                .into_iter()
                .map(|dep| match dep {
                    Value::String(name) => Ok(DependencyRef::Name(name)),
                    Value::Number(n) => n
                        .as_u64()
                        .map(|i| DependencyRef::Index(i as usize))
                        .ok_or_else(|| invalid("dependency index must be a non-negative integer")),
                    _ => Err(invalid("dependency must be a name or index")),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(invalid("dependencies must be an array")),
        };
        let group = match fields.next() {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(
                n.as_i64()
                    .ok_or_else(|| invalid("group must be an integer"))?,
            ),
            Some(_) => return Err(invalid("group must be an integer")),
        };
        let source = match fields.next() {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => return Err(invalid("source must be a string")),
        };
        let skip = match fields.next() {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => return Err(invalid("skip must name a capability")),
        };

        Ok(Self {
            name,
            version,
            dependencies,
            group,
            source,
            skip,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawManifest {
    Modules(Vec<Value>),
    Full {
        #[serde(default)]
        sources: IndexMap<String, String>,
        #[serde(default)]
        modules: Vec<Value>,
    },
}

/// Parsed startup manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupManifest {
    pub sources: IndexMap<String, String>,
    pub modules: Vec<ManifestEntry>,
}

impl StartupManifest {
    /// Load manifest from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModuleError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ModuleError::InvalidRegistration(format!("Failed to read manifest file: {}", e))
        })?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, ModuleError> {
        let raw: RawManifest = serde_json::from_str(contents).map_err(|e| {
            ModuleError::InvalidRegistration(format!("Failed to parse manifest JSON: {}", e))
        })?;
        let (sources, values) = match raw {
            RawManifest::Modules(modules) => (IndexMap::new(), modules),
            RawManifest::Full { sources, modules } => (sources, modules),
        };
        let modules = values
            .into_iter()
            .enumerate()
            .map(|(position, value)| ManifestEntry::from_value(position, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { sources, modules })
    }

    /// Turn entries into bulk registrations, binding skip names to probes.
    ///
    /// A skip name without a matching probe is ignored and the module loads normally.
    pub fn registrations(&self, capabilities: &Capabilities) -> Vec<Registration> {
        self.modules
            .iter()
            .map(|entry| {
                let mut registration = Registration::new(entry.name.clone())
                    .version(entry.version.clone())
                    .dependencies(entry.dependencies.iter().cloned());
                if let Some(group) = entry.group {
                    registration = registration.group(group);
                }
                if let Some(source) = &entry.source {
                    registration = registration.source(source.clone());
                }
                if let Some(skip) = &entry.skip {
                    match capabilities.get(skip) {
                        Some(probe) => registration = registration.skip_check(probe),
                        None => warn!("Unknown capability {} for module {}", skip, entry.name),
                    }
                }
                registration
            })
            .collect()
    }
}
