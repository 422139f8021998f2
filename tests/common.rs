//! Shared fixtures for loader integration tests
#![allow(dead_code)]

use resource_loader::{
    HeadlessHost, Implementation, LoaderConfig, MemoryStore, ModuleLoader, RecordingTransport,
    Registration,
};
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Loader wired to a headless host, a recording transport and an in-memory store
pub struct Fixture {
    pub loader: ModuleLoader,
    pub host: Rc<HeadlessHost>,
    pub transport: Rc<RecordingTransport>,
    pub backend: Rc<MemoryStore>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: LoaderConfig) -> Self {
        Self::with_backend(config, Rc::new(MemoryStore::new()))
    }

    /// Build on an existing backend, as a fresh session over a persisted store
    pub fn with_backend(config: LoaderConfig, backend: Rc<MemoryStore>) -> Self {
        let host = Rc::new(HeadlessHost::new());
        let transport = Rc::new(RecordingTransport::new());
        let loader =
            ModuleLoader::with_store(config, host.clone(), transport.clone(), backend.clone())
                .unwrap();
        Self {
            loader,
            host,
            transport,
            backend,
        }
    }

    pub fn register(&self, name: &str, version: &str, dependencies: &[&str]) {
        self.loader
            .register(
                Registration::new(name)
                    .version(version)
                    .dependencies(dependencies.iter().copied()),
            )
            .unwrap();
    }

    /// Run tasks that are due now
    pub fn run_tasks(&self) -> usize {
        self.loader.run_pending_tasks()
    }

    /// Run every queued task, delayed ones included
    pub fn run_all_tasks(&self) -> usize {
        self.loader
            .run_pending_tasks_at(Instant::now() + Duration::from_secs(3600))
    }
}

/// Default config without base modules
pub fn test_config() -> LoaderConfig {
    LoaderConfig {
        base_modules: Vec::new(),
        ..LoaderConfig::default()
    }
}

/// Execution log shared by module functions
pub type Trace = Rc<RefCell<Vec<String>>>;

pub fn trace() -> Trace {
    Rc::new(RefCell::new(Vec::new()))
}

/// Function implementation that appends its module name to `trace` and exports `{"name": name}`
pub fn traced(name: &str, trace: &Trace) -> Implementation {
    let name = name.to_string();
    let trace = Rc::clone(trace);
    Implementation::new().function(move |_, module| {
        trace.borrow_mut().push(name.clone());
        module.set_export("name", json!(name));
        Ok(())
    })
}
