//! Module loader implementation
//!
//! Public operation surface of the engine: registration, implementation,
//! state pushes, loading, `using` and `require`, plus the work queue that
//! moves requested modules into the module store or network batches.

use futures::channel::oneshot;
use serde_json::Value;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::LoaderConfig;
use crate::module::loader::execute::{CssBuffer, PendingScript};
use crate::module::loader::propagation::{ErrorCallback, Job, ReadyCallback};
use crate::module::loader::tasks::TaskQueue;
use crate::module::loader::tracking::{ErrorSource, TrackedError};
use crate::module::registry::{
    split_module_key, Capabilities, ModuleDependencies, ModuleInfo, Registration, Registry,
    StartupManifest,
};
use crate::module::require::Require;
use crate::module::script::{Implementation, ModuleHandle, ModuleScript, PackageFile};
use crate::module::traits::{ModuleError, ModuleState, ScriptHost};
use crate::network::{plan_batch, Transport};
use crate::storage::codec::{parse_calls, LoaderCall};
use crate::storage::{create_store, KeyValueStore, MemoryStore, ModuleStore, StoreStats};
use crate::utils::{current_timestamp_millis, with_fallback};

/// Pseudo-module that runs after [`SITE_MODULE`] has settled
pub const USER_MODULE: &str = "user";

/// Pseudo-module [`USER_MODULE`] is ordered after
pub const SITE_MODULE: &str = "site";

/// Mutable engine state, borrowed only between calls into outside code
pub(crate) struct LoaderState {
    pub(crate) registry: Registry,
    /// Modules waiting for the next `work` pass
    pub(crate) queue: Vec<String>,
    pub(crate) jobs: Vec<Job>,
    pub(crate) will_propagate: bool,
    pub(crate) error_modules: VecDeque<String>,
    pub(crate) pending_scripts: VecDeque<PendingScript>,
    pub(crate) handling_pending_scripts: bool,
    pub(crate) css_buffer: Option<Rc<RefCell<CssBuffer>>>,
    pub(crate) tasks: TaskQueue,
    pub(crate) store: ModuleStore,
    pub(crate) tracked: Vec<TrackedError>,
}

impl LoaderState {
    fn new(registry: Registry, store: ModuleStore) -> Self {
        Self {
            registry,
            queue: Vec::new(),
            jobs: Vec::new(),
            will_propagate: false,
            error_modules: VecDeque::new(),
            pending_scripts: VecDeque::new(),
            handling_pending_scripts: false,
            css_buffer: None,
            tasks: TaskQueue::new(),
            store,
            tracked: Vec::new(),
        }
    }

    /// Log and record a recovered failure
    pub(crate) fn track(&mut self, error: TrackedError) {
        error.log();
        self.tracked.push(error);
    }
}

pub(crate) struct LoaderInner {
    config: LoaderConfig,
    host: Rc<dyn ScriptHost>,
    transport: Rc<dyn Transport>,
    state: RefCell<LoaderState>,
}

/// Module loader
///
/// Cheap to clone; all clones share one engine. Not `Send`: the engine runs
/// on a single thread and is driven by the embedder.
#[derive(Clone)]
pub struct ModuleLoader {
    inner: Rc<LoaderInner>,
}

/// Non-owning loader handle held by callbacks the loader stores
#[derive(Clone)]
pub(crate) struct WeakLoader(Weak<LoaderInner>);

impl WeakLoader {
    pub(crate) fn upgrade(&self) -> Option<ModuleLoader> {
        self.0.upgrade().map(|inner| ModuleLoader { inner })
    }
}

impl ModuleLoader {
    /// Create a loader with the store backend selected by configuration.
    ///
    /// Falls back to an in-memory backend when the configured one cannot be opened.
    pub fn new(
        config: LoaderConfig,
        host: Rc<dyn ScriptHost>,
        transport: Rc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let backend = with_fallback(
            || create_store(&config.store),
            || Rc::new(MemoryStore::new()) as Rc<dyn KeyValueStore>,
            "Module store backend unavailable, using in-memory store",
        );
        Self::with_store(config, host, transport, backend)
    }

    /// Create a loader on an explicit store backend
    pub fn with_store(
        config: LoaderConfig,
        host: Rc<dyn ScriptHost>,
        transport: Rc<dyn Transport>,
        backend: Rc<dyn KeyValueStore>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let mut registry = Registry::new();
        for (id, url) in &config.sources {
            registry.add_source(id, url)?;
        }
        let store = ModuleStore::new(config.store.clone(), backend);
        info!(
            "Module loader ready ({} sources, base modules {:?})",
            config.sources.len(),
            config.base_modules
        );
        Ok(Self {
            inner: Rc::new(LoaderInner {
                config,
                host,
                transport,
                state: RefCell::new(LoaderState::new(registry, store)),
            }),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakLoader {
        WeakLoader(Rc::downgrade(&self.inner))
    }

    pub(crate) fn state(&self) -> Ref<'_, LoaderState> {
        self.inner.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, LoaderState> {
        self.inner.state.borrow_mut()
    }

    pub(crate) fn host(&self) -> Rc<dyn ScriptHost> {
        Rc::clone(&self.inner.host)
    }

    pub(crate) fn is_base_module(&self, name: &str) -> bool {
        self.inner.config.base_modules.iter().any(|base| base == name)
    }

    pub(crate) fn track(&self, error: TrackedError) {
        self.state_mut().track(error);
    }

    // Registration

    /// Register a named load endpoint
    pub fn add_source(&self, id: &str, url: &str) -> Result<(), ModuleError> {
        self.state_mut().registry.add_source(id, url)
    }

    pub fn register(&self, registration: Registration) -> Result<(), ModuleError> {
        self.state_mut().registry.register(registration)
    }

    /// Register a list of modules whose dependencies may refer to list positions
    pub fn register_many(&self, registrations: Vec<Registration>) -> Result<(), ModuleError> {
        self.state_mut().registry.register_many(registrations)
    }

    /// Register the sources and modules of a startup manifest
    pub fn register_manifest(
        &self,
        manifest: &StartupManifest,
        capabilities: &Capabilities,
    ) -> Result<(), ModuleError> {
        let mut state = self.state_mut();
        for (id, url) in &manifest.sources {
            if state.registry.source_url(id).is_some() {
                debug!("Source {} already registered", id);
                continue;
            }
            state.registry.add_source(id, url)?;
        }
        state
            .registry
            .register_many(manifest.registrations(capabilities))
    }

    /// Attach a payload to `name@version`, registering the name if needed.
    pub fn implement(&self, key: &str, implementation: Implementation) -> Result<(), ModuleError> {
        let (name, version) = split_module_key(key);
        let state = {
            let mut state = self.state_mut();
            if !state.registry.contains(name) {
                state.registry.register(Registration::new(name))?;
            }
            let Some(descriptor) = state.registry.get_mut(name) else {
                return Err(ModuleError::UnknownModule(name.to_string()));
            };
            if descriptor.payload.is_some() {
                return Err(ModuleError::AlreadyImplemented(name.to_string()));
            }
            if !version.is_empty() {
                descriptor.version = version.to_string();
            }
            descriptor.payload = Some(implementation);
            descriptor.state
        };
        if !state.is_failed() {
            self.set_and_propagate(name, ModuleState::Loaded);
        }
        Ok(())
    }

    /// Push states for modules, registering unknown names
    pub fn set_state<I, S>(&self, states: I)
    where
        I: IntoIterator<Item = (S, ModuleState)>,
        S: Into<String>,
    {
        for (name, state) in states {
            let name = name.into();
            {
                let mut loader_state = self.state_mut();
                if !loader_state.registry.contains(&name) {
                    if let Err(e) = loader_state.registry.register(Registration::new(name.clone())) {
                        warn!("Failed to register {}: {}", name, e);
                        continue;
                    }
                }
            }
            self.set_and_propagate(&name, state);
        }
    }

    /// Apply a response body: a sequence of implement and state calls.
    ///
    /// Every call is applied; the first failure is returned.
    pub fn receive_response(&self, text: &str) -> Result<(), ModuleError> {
        let calls = parse_calls(text)?;
        let host = self.host();
        let mut first_error = None;
        for call in calls {
            let result = match call {
                LoaderCall::Implement {
                    key,
                    implementation,
                } => implementation
                    .into_implementation(host.as_ref())
                    .map_err(ModuleError::from)
                    .and_then(|implementation| self.implement(&key, implementation)),
                LoaderCall::State(states) => {
                    self.set_state(states);
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!("Failed to apply loader call: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // Resolution

    /// Resolve modules and their dependencies, base modules first
    pub fn resolve<S: AsRef<str>>(&self, modules: &[S]) -> Result<Vec<String>, ModuleError> {
        let (result, skipped) = {
            let mut state = self.state_mut();
            let mut resolver =
                ModuleDependencies::new(&mut state.registry, &self.inner.config.base_modules);
            let result = resolver.resolve(modules);
            (result, resolver.into_skipped())
        };
        self.mark_skipped(skipped);
        result
    }

    /// Resolve what can be resolved, dropping names that fail.
    ///
    /// Failures of registered modules are tracked; unknown names only warn.
    pub fn resolve_stubbornly<S: AsRef<str>>(&self, modules: &[S]) -> Vec<String> {
        let (resolved, failures, skipped) = {
            let mut state = self.state_mut();
            let mut resolver =
                ModuleDependencies::new(&mut state.registry, &self.inner.config.base_modules);
            let (resolved, failures) = resolver.resolve_stubbornly(modules);
            (resolved, failures, resolver.into_skipped())
        };
        self.mark_skipped(skipped);
        let mut state = self.state_mut();
        for (name, error) in failures {
            if state.registry.contains(&name) {
                state.track(TrackedError::new(ErrorSource::Resolve, Some(&name), &error));
            }
        }
        resolved
    }

    fn mark_skipped(&self, skipped: Vec<String>) {
        for name in skipped {
            self.set_and_propagate(&name, ModuleState::Ready);
        }
    }

    // Loading

    /// Best-effort load of modules, or of a single script URL. Never fails.
    pub fn load<S: AsRef<str>>(&self, modules: &[S]) {
        if let [single] = modules {
            let single = single.as_ref();
            if is_url(single) {
                if let Err(e) = self.load_url(single, None) {
                    warn!("Failed to load {}: {}", single, e);
                }
                return;
            }
        }
        let resolved = self.resolve_stubbornly(modules);
        self.enqueue(resolved, None, None);
    }

    /// Insert a script or stylesheet by URL
    pub fn load_url(&self, url: &str, content_type: Option<&str>) -> Result<(), ModuleError> {
        match content_type {
            Some("text/css") => self.host().insert_link(url, None),
            None | Some("text/javascript") => self.host().add_script(url, Box::new(|| {})),
            Some(other) => return Err(ModuleError::InvalidContentType(other.to_string())),
        }
        Ok(())
    }

    /// Load modules and resolve to a [`Require`] once all are ready
    pub fn using<S: AsRef<str>>(&self, modules: &[S]) -> Using {
        self.using_then(modules, |_| Ok(()), |_| Ok(()))
    }

    /// Like [`Self::using`], also running `ready` or `error` when the job settles.
    ///
    /// Callback failures are tracked and never reach the future.
    pub fn using_then<S, R, E>(&self, modules: &[S], ready: R, error: E) -> Using
    where
        S: AsRef<str>,
        R: FnOnce(&Require) -> anyhow::Result<()> + 'static,
        E: FnOnce(&ModuleError) -> anyhow::Result<()> + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let sender = Rc::new(RefCell::new(Some(sender)));

        let dependencies = match self.resolve(modules) {
            Ok(dependencies) => dependencies,
            Err(e) => {
                self.invoke_callback(|| error(&e));
                if let Some(sender) = sender.borrow_mut().take() {
                    let _ = sender.send(Err(e));
                }
                return Using { receiver };
            }
        };

        let loader = self.downgrade();
        let ready_sender = Rc::clone(&sender);
        let on_ready: ReadyCallback = Box::new(move || {
            let require = Require::new(loader);
            let result = ready(&require);
            if let Some(sender) = ready_sender.borrow_mut().take() {
                let _ = sender.send(Ok(require));
            }
            result
        });
        let on_error: ErrorCallback = Box::new(move |e: ModuleError| {
            let result = error(&e);
            if let Some(sender) = sender.borrow_mut().take() {
                let _ = sender.send(Err(e));
            }
            result
        });
        self.enqueue(dependencies, Some(on_ready), Some(on_error));
        Using { receiver }
    }

    /// Process the load queue: serve cached modules, batch the rest.
    pub fn work(&self) {
        let now_ms = current_timestamp_millis();
        let request_names = {
            let mut guard = self.state_mut();
            let state = &mut *guard;
            if let Some(e) = state.store.init(now_ms) {
                state.track(e);
            }

            let queue = std::mem::take(&mut state.queue);
            let mut batch = HashSet::new();
            let mut stored_implementations = Vec::new();
            let mut stored_names = Vec::new();
            let mut request_names = Vec::new();
            for module in queue.into_iter().rev() {
                if state.registry.state(&module) != Some(ModuleState::Registered)
                    || !batch.insert(module.clone())
                {
                    continue;
                }
                state.registry.set_state(&module, ModuleState::Loading);
                match state.store.get(&state.registry, &module) {
                    Some(implementation) => {
                        stored_implementations.push(implementation);
                        stored_names.push(module);
                    }
                    None => request_names.push(module),
                }
            }

            if !stored_implementations.is_empty() {
                debug!("Serving {} modules from the module store", stored_names.len());
                state.tasks.push(Box::new(move |loader: &ModuleLoader| {
                    loader.eval_stored(stored_implementations, stored_names)
                }));
            }
            request_names
        };
        self.batch_request(request_names);
    }

    fn eval_stored(&self, implementations: Vec<String>, names: Vec<String>) {
        let Err(e) = self.receive_response(&implementations.join(";")) else {
            return;
        };
        let failed: Vec<String> = {
            let mut guard = self.state_mut();
            let state = &mut *guard;
            state.store.record_failure();
            state.store.clear();
            state.track(TrackedError::new(ErrorSource::StoreEval, None, &e));
            names
                .into_iter()
                .filter(|name| state.registry.state(name) == Some(ModuleState::Loading))
                .collect()
        };
        if !failed.is_empty() {
            info!("Requesting {} modules from the network after store failure", failed.len());
        }
        self.batch_request(failed);
    }

    fn batch_request(&self, batch: Vec<String>) {
        if batch.is_empty() {
            return;
        }
        let plan = {
            let state = self.state();
            plan_batch(
                &state.registry,
                &self.inner.config.request,
                self.inner.config.max_query_length,
                batch,
            )
        };
        for request in plan.requests {
            debug!("Sending batch request {}", request.url);
            self.inner.transport.send(request);
        }
        for name in plan.unroutable {
            error!("Cannot request module {}: unknown source", name);
            self.set_and_propagate(&name, ModuleState::Error);
        }
    }

    /// Persist queued module store writes
    pub(crate) fn flush_store(&self) {
        let now_ms = current_timestamp_millis();
        let mut guard = self.state_mut();
        let state = &mut *guard;
        for e in state.store.flush(&state.registry, now_ms) {
            state.track(e);
        }
    }

    // Exports

    /// Exports of a ready module
    pub fn require(&self, name: &str) -> Result<Value, ModuleError> {
        let state = self.state();
        match state.registry.get(name) {
            Some(descriptor) if descriptor.state() == ModuleState::Ready => {
                Ok(descriptor.exports().clone())
            }
            _ => Err(ModuleError::NotReady(name.to_string())),
        }
    }

    /// Run (once) and return one file of a packaged module
    pub(crate) fn require_package_file(&self, module: &str, file: &str) -> Result<Value, ModuleError> {
        let entry = {
            let state = self.state();
            let descriptor = state
                .registry
                .get(module)
                .ok_or_else(|| ModuleError::UnknownModule(module.to_string()))?;
            if let Some(cached) = descriptor.package_exports.get(file) {
                return Ok(cached.clone());
            }
            match descriptor.script() {
                Some(ModuleScript::Package { files, .. }) => files.get(file).cloned(),
                _ => None,
            }
        };
        let entry = entry.ok_or_else(|| ModuleError::UndefinedFile(file.to_string()))?;

        let value = match entry {
            PackageFile::Data(value) => value,
            PackageFile::Function(function) => {
                let require = Require::scoped(self.downgrade(), module, file);
                let mut handle = ModuleHandle::new();
                function
                    .call(&require, &mut handle)
                    .map_err(|e| ModuleError::ExecutionFailure {
                        module: module.to_string(),
                        message: format!("{:#}", e),
                    })?;
                handle.exports
            }
        };
        if let Some(descriptor) = self.state_mut().registry.get_mut(module) {
            descriptor
                .package_exports
                .insert(file.to_string(), value.clone());
        }
        Ok(value)
    }

    // Diagnostics

    pub fn get_state(&self, name: &str) -> Option<ModuleState> {
        self.state().registry.state(name)
    }

    /// Snapshot of one registry entry
    pub fn inspect(&self, name: &str) -> Option<ModuleInfo> {
        self.state().registry.info(name)
    }

    /// Registered module names in registration order
    pub fn module_names(&self) -> Vec<String> {
        self.state().registry.names()
    }

    /// Number of jobs still waiting
    pub fn pending_jobs(&self) -> usize {
        self.state().jobs.len()
    }

    /// Whether the module's current `name@version` is in the module store
    pub fn is_stored(&self, name: &str) -> bool {
        let state = self.state();
        state
            .registry
            .module_key(name)
            .is_some_and(|key| state.store.contains_key(&key))
    }

    pub fn store_stats(&self) -> StoreStats {
        self.state().store.stats()
    }

    /// Drain the tracked errors recorded so far
    pub fn take_tracked_errors(&self) -> Vec<TrackedError> {
        std::mem::take(&mut self.state_mut().tracked)
    }

    // Task driving

    /// When the next deferred task becomes due, if any is queued
    pub fn next_task_due(&self) -> Option<Instant> {
        self.state().tasks.next_due()
    }

    /// Run every task due now. Returns how many ran.
    pub fn run_pending_tasks(&self) -> usize {
        self.run_pending_tasks_at(Instant::now())
    }

    /// Run every task due at `now`, including tasks queued while running.
    pub fn run_pending_tasks_at(&self, now: Instant) -> usize {
        let mut ran = 0;
        loop {
            let task = self.state_mut().tasks.pop_due(now);
            let Some(task) = task else {
                break;
            };
            task(self);
            ran += 1;
        }
        ran
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("ModuleLoader")
            .field("modules", &state.registry.len())
            .field("jobs", &state.jobs.len())
            .field("tasks", &state.tasks.len())
            .finish()
    }
}

fn is_url(name: &str) -> bool {
    name.starts_with("http://") || name.starts_with("https://") || name.starts_with('/')
}

/// Future returned by [`ModuleLoader::using`]
///
/// Resolves to a [`Require`] once every requested module is ready, or to the
/// resolution or dependency error.
#[must_use = "futures do nothing unless polled"]
pub struct Using {
    receiver: oneshot::Receiver<Result<Require, ModuleError>>,
}

impl Using {
    /// Take the outcome if the job already settled
    pub fn try_take(&mut self) -> Option<Result<Require, ModuleError>> {
        match self.receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::Canceled) => Some(Err(ModuleError::LoaderGone)),
        }
    }
}

impl Future for Using {
    type Output = Result<Require, ModuleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(ModuleError::LoaderGone)),
            Poll::Pending => Poll::Pending,
        }
    }
}
