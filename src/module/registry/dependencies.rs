//! Module dependency resolution
//!
//! Depth-first topological sort over the registry with cycle detection and
//! lazy skip evaluation.

use std::collections::HashSet;
use tracing::{debug, warn};

use crate::module::registry::descriptor::Skip;
use crate::module::registry::Registry;
use crate::module::traits::ModuleError;

/// Accumulated load order
#[derive(Debug, Default)]
struct LoadOrder {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl LoadOrder {
    fn contains(&self, name: &str) -> bool {
        self.seen.contains(name)
    }

    fn push(&mut self, name: &str) {
        if self.seen.insert(name.to_string()) {
            self.order.push(name.to_string());
        }
    }

    fn truncate(&mut self, len: usize) {
        for name in self.order.drain(len..) {
            self.seen.remove(&name);
        }
    }
}

/// Dependency resolver
///
/// Base modules are prefixed to every result. Modules whose skip predicate
/// holds lose their dependencies and are collected in [`Self::into_skipped`]
/// so the caller can mark them `ready`.
pub struct ModuleDependencies<'a> {
    registry: &'a mut Registry,
    base_modules: &'a [String],
    skipped: Vec<String>,
}

impl<'a> ModuleDependencies<'a> {
    pub fn new(registry: &'a mut Registry, base_modules: &'a [String]) -> Self {
        Self {
            registry,
            base_modules,
            skipped: Vec::new(),
        }
    }

    /// Resolve modules and their dependencies into load order.
    ///
    /// Fails on the first unknown module or cycle.
    pub fn resolve<S: AsRef<str>>(&mut self, modules: &[S]) -> Result<Vec<String>, ModuleError> {
        let mut resolved = self.base_order(false)?;
        for module in modules {
            let mut visiting = HashSet::new();
            self.sort_dependencies(module.as_ref(), &mut resolved, &mut visiting)?;
        }
        debug!("Dependency resolution complete: {:?}", resolved.order);
        Ok(resolved.order)
    }

    /// Like [`Self::resolve`] but drops unresolvable modules instead of failing.
    ///
    /// Each failed name is returned with its error; its partial contribution
    /// to the load order is rolled back.
    pub fn resolve_stubbornly<S: AsRef<str>>(
        &mut self,
        modules: &[S],
    ) -> (Vec<String>, Vec<(String, ModuleError)>) {
        let mut resolved = match self.base_order(true) {
            Ok(order) => order,
            Err(_) => LoadOrder::default(),
        };
        let mut failures = Vec::new();
        for module in modules {
            let module = module.as_ref();
            let saved = resolved.order.len();
            let mut visiting = HashSet::new();
            if let Err(e) = self.sort_dependencies(module, &mut resolved, &mut visiting) {
                resolved.truncate(saved);
                warn!("Skipped unavailable module {}: {}", module, e);
                failures.push((module.to_string(), e));
            }
        }
        (resolved.order, failures)
    }

    /// Modules whose skip predicate evaluated to true during this resolver's lifetime
    pub fn into_skipped(self) -> Vec<String> {
        self.skipped
    }

    fn base_order(&self, lenient: bool) -> Result<LoadOrder, ModuleError> {
        let mut order = LoadOrder::default();
        for base in self.base_modules {
            if !self.registry.contains(base) {
                if lenient {
                    warn!("Base module {} is not registered", base);
                    continue;
                }
                return Err(ModuleError::UnknownModule(base.clone()));
            }
            order.push(base);
        }
        Ok(order)
    }

    fn sort_dependencies(
        &mut self,
        module: &str,
        resolved: &mut LoadOrder,
        visiting: &mut HashSet<String>,
    ) -> Result<(), ModuleError> {
        if !self.registry.contains(module) {
            return Err(ModuleError::UnknownModule(module.to_string()));
        }

        if self.should_skip(module) {
            resolved.push(module);
            return Ok(());
        }

        if resolved.contains(module) {
            return Ok(());
        }

        visiting.insert(module.to_string());
        let dependencies = self
            .registry
            .get(module)
            .map(|d| d.dependencies.clone())
            .unwrap_or_default();
        for dependency in &dependencies {
            if resolved.contains(dependency) {
                continue;
            }
            if visiting.contains(dependency) {
                return Err(ModuleError::CircularDependency {
                    module: module.to_string(),
                    dependency: dependency.clone(),
                });
            }
            self.sort_dependencies(dependency, resolved, visiting)?;
        }
        visiting.remove(module);
        resolved.push(module);
        Ok(())
    }

    /// Evaluate the skip predicate once; a hit clears the module's dependencies.
    fn should_skip(&mut self, module: &str) -> bool {
        let Some(descriptor) = self.registry.get_mut(module) else {
            return false;
        };
        match &descriptor.skip {
            Skip::None => false,
            Skip::Evaluated(result) => *result,
            Skip::Pending(check) => {
                let check = check.clone();
                let result = check();
                descriptor.skip = Skip::Evaluated(result);
                if result {
                    debug!("Skipping module {}", module);
                    descriptor.dependencies.clear();
                    self.skipped.push(module.to_string());
                }
                result
            }
        }
    }
}
