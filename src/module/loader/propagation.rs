//! State propagation
//!
//! Every state change that can unblock or fail other work funnels through
//! [`ModuleLoader::set_and_propagate`]. A propagation pass repeats three
//! stages until nothing changes: failed modules fail their dependents, loaded
//! modules with ready dependencies execute, and settled jobs fire.

use tracing::{debug, error};

use crate::module::loader::loader::ModuleLoader;
use crate::module::loader::tracking::{ErrorSource, TrackedError};
use crate::module::registry::{ModuleDescriptor, Registry};
use crate::module::traits::{ModuleError, ModuleState};

pub(crate) type ReadyCallback = Box<dyn FnOnce() -> anyhow::Result<()>>;
pub(crate) type ErrorCallback = Box<dyn FnOnce(ModuleError) -> anyhow::Result<()>>;

/// Callbacks waiting on a set of modules
pub(crate) struct Job {
    pub(crate) dependencies: Vec<String>,
    pub(crate) ready: Option<ReadyCallback>,
    pub(crate) error: Option<ErrorCallback>,
}

enum Readiness {
    Ready,
    Failed(String),
    Pending,
}

fn readiness<S: AsRef<str>>(registry: &Registry, modules: &[S]) -> Readiness {
    if let Some(failed) = registry.any_failed(modules) {
        Readiness::Failed(failed.to_string())
    } else if registry.all_ready(modules) {
        Readiness::Ready
    } else {
        Readiness::Pending
    }
}

impl ModuleLoader {
    /// Apply a state change and run propagation unless a pass is already active.
    pub(crate) fn set_and_propagate(&self, module: &str, state: ModuleState) {
        {
            let mut guard = self.state_mut();
            let st = &mut *guard;
            if !st.registry.set_state(module, state) {
                return;
            }
            match state {
                ModuleState::Ready => {
                    if st.store.add(module) {
                        let delay = st.store.flush_delay();
                        st.tasks
                            .push_after(delay, Box::new(|loader: &ModuleLoader| loader.flush_store()));
                    }
                }
                ModuleState::Error | ModuleState::Missing => {
                    st.error_modules.push_back(module.to_string());
                }
                _ => {}
            }
            if !state.triggers_propagation() || st.will_propagate {
                return;
            }
            st.will_propagate = true;
        }
        self.do_propagation();
    }

    fn do_propagation(&self) {
        let mut did_propagate = true;
        while did_propagate {
            did_propagate = false;

            loop {
                let failed = self.state_mut().error_modules.pop_front();
                let Some(failed) = failed else {
                    break;
                };
                if self.fail_dependents(&failed) {
                    did_propagate = true;
                }
            }

            let mut index = 0;
            loop {
                let candidate = {
                    let st = self.state();
                    let Some((name, descriptor)) = st.registry.get_index(index) else {
                        break;
                    };
                    (descriptor.state == ModuleState::Loaded
                        && self.ready_to_execute(&st.registry, name, descriptor))
                    .then(|| name.clone())
                };
                index += 1;
                if let Some(name) = candidate {
                    if let Err(e) = self.execute(&name) {
                        error!("Failed to execute {}: {}", name, e);
                    }
                    did_propagate = true;
                }
            }

            let mut index = 0;
            loop {
                let (job, outcome) = {
                    let mut guard = self.state_mut();
                    let st = &mut *guard;
                    let Some(job) = st.jobs.get(index) else {
                        break;
                    };
                    let outcome = readiness(&st.registry, &job.dependencies);
                    if matches!(outcome, Readiness::Pending) {
                        index += 1;
                        continue;
                    }
                    (st.jobs.remove(index), outcome)
                };
                self.settle(job, outcome);
                did_propagate = true;
            }
        }
        self.state_mut().will_propagate = false;
    }

    /// Mark every dependent of `failed` as errored.
    ///
    /// A failed base module fails every non-base module at once; other base
    /// modules only fail through their own dependencies.
    fn fail_dependents(&self, failed: &str) -> bool {
        let base_failure = self.is_base_module(failed);
        let mut guard = self.state_mut();
        let st = &mut *guard;
        let mut changed = false;
        let mut newly_failed = Vec::new();
        for (name, descriptor) in st.registry.iter_mut() {
            if descriptor.state.is_terminal() {
                continue;
            }
            if base_failure && !self.is_base_module(name) {
                descriptor.state = ModuleState::Error;
                changed = true;
            } else if descriptor.dependencies.iter().any(|d| d == failed) {
                debug!("Module {} failed with its dependency {}", name, failed);
                descriptor.state = ModuleState::Error;
                newly_failed.push(name.clone());
                changed = true;
            }
        }
        st.error_modules.extend(newly_failed);
        changed
    }

    fn ready_to_execute(&self, registry: &Registry, name: &str, descriptor: &ModuleDescriptor) -> bool {
        registry.all_ready(&descriptor.dependencies)
            && (self.is_base_module(name) || registry.all_ready(&self.config().base_modules))
    }

    fn settle(&self, job: Job, outcome: Readiness) {
        match outcome {
            Readiness::Ready => {
                if let Some(ready) = job.ready {
                    self.invoke_callback(ready);
                }
            }
            Readiness::Failed(module) => {
                if let Some(error) = job.error {
                    self.invoke_callback(|| error(ModuleError::DependencyFailed(module)));
                }
            }
            Readiness::Pending => {}
        }
    }

    /// Run a user callback; failures are tracked and re-reported from a task.
    pub(crate) fn invoke_callback<F>(&self, callback: F)
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        if let Err(e) = callback() {
            let message = format!("{:#}", e);
            let mut st = self.state_mut();
            st.track(TrackedError::new(ErrorSource::LoadCallback, None, &message));
            st.tasks.push(Box::new(move |_: &ModuleLoader| {
                error!("Uncaught exception in load callback: {}", message);
            }));
        }
    }

    /// Settle a job immediately or queue it, then request whatever is still registered.
    pub(crate) fn enqueue(
        &self,
        dependencies: Vec<String>,
        ready: Option<ReadyCallback>,
        error: Option<ErrorCallback>,
    ) {
        let outcome = readiness(&self.state().registry, &dependencies);
        if !matches!(outcome, Readiness::Pending) {
            self.settle(
                Job {
                    dependencies,
                    ready,
                    error,
                },
                outcome,
            );
            return;
        }

        {
            let mut guard = self.state_mut();
            let st = &mut *guard;
            if ready.is_some() || error.is_some() {
                let pending: Vec<String> = dependencies
                    .iter()
                    .filter(|d| st.registry.state(d).is_some_and(|s| s.is_pending()))
                    .cloned()
                    .collect();
                st.jobs.push(Job {
                    dependencies: pending,
                    ready,
                    error,
                });
            }
            for dependency in &dependencies {
                if st.registry.state(dependency) == Some(ModuleState::Registered)
                    && !st.queue.contains(dependency)
                {
                    st.queue.push(dependency.clone());
                }
            }
        }
        self.work();
    }
}
