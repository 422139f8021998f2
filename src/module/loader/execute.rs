//! Module execution
//!
//! Applies a module payload: messages and templates first, then styles, and
//! the script once every embedded style has been flushed to the host.

use anyhow::anyhow;
use std::cell::RefCell;
use std::mem;
use std::rc::Rc;
use tracing::debug;

use crate::module::loader::loader::{ModuleLoader, SITE_MODULE, USER_MODULE};
use crate::module::loader::tracking::{ErrorSource, TrackedError};
use crate::module::require::Require;
use crate::module::script::{ModuleFunction, ModuleScript, PackageFile};
use crate::module::traits::{ModuleError, ModuleState};

/// Script URL waiting for its turn in the sequential script queue
pub(crate) struct PendingScript {
    url: String,
    done: Box<dyn FnOnce()>,
}

/// Embedded CSS collected until the next task flush
#[derive(Default)]
pub(crate) struct CssBuffer {
    text: String,
    callbacks: Vec<Box<dyn FnOnce()>>,
}

struct GateState {
    pending: usize,
    run: Option<Box<dyn FnOnce()>>,
}

/// Runs a closure exactly once, after the gate is armed and every hold released
struct ScriptGate {
    state: Rc<RefCell<GateState>>,
}

impl ScriptGate {
    fn new(run: Box<dyn FnOnce()>) -> Self {
        Self {
            state: Rc::new(RefCell::new(GateState {
                pending: 1,
                run: Some(run),
            })),
        }
    }

    fn hold(&self) -> Box<dyn FnOnce()> {
        self.state.borrow_mut().pending += 1;
        let state = Rc::clone(&self.state);
        Box::new(move || Self::release(&state))
    }

    fn arm(self) {
        Self::release(&self.state);
    }

    fn release(state: &Rc<RefCell<GateState>>) {
        let run = {
            let mut state = state.borrow_mut();
            state.pending = state.pending.saturating_sub(1);
            if state.pending == 0 {
                state.run.take()
            } else {
                None
            }
        };
        if let Some(run) = run {
            run();
        }
    }
}

impl ModuleLoader {
    /// Execute a loaded module.
    ///
    /// Script failures do not surface here; they are tracked and the module
    /// moves to `error`.
    pub(crate) fn execute(&self, module: &str) -> Result<(), ModuleError> {
        let payload = {
            let mut st = self.state_mut();
            let state = st
                .registry
                .state(module)
                .ok_or_else(|| ModuleError::UnknownModule(module.to_string()))?;
            if state != ModuleState::Loaded {
                return Err(ModuleError::InvalidStateForExecution {
                    module: module.to_string(),
                    state,
                });
            }
            st.registry.set_state(module, ModuleState::Executing);
            st.registry
                .get(module)
                .and_then(|d| d.payload.clone())
                .unwrap_or_default()
        };
        debug!("Executing module {}", module);

        let host = self.host();
        if let Some(messages) = &payload.messages {
            host.set_messages(messages);
        }
        if let Some(templates) = &payload.templates {
            host.set_templates(module, templates);
        }

        let loader = self.downgrade();
        let name = module.to_string();
        let script = payload.script;
        let gate = ScriptGate::new(Box::new(move || {
            if let Some(loader) = loader.upgrade() {
                loader.run_script(&name, script);
            }
        }));

        if let Some(style) = &payload.style {
            for css in &style.css {
                self.add_embedded_css(css, gate.hold());
            }
            for (media, urls) in &style.url {
                for url in urls {
                    host.insert_link(url, Some(media));
                }
            }
        }

        if module == USER_MODULE {
            let release = gate.hold();
            match self.resolve(&[SITE_MODULE]) {
                Ok(dependencies) => {
                    let release = Rc::new(RefCell::new(Some(release)));
                    let on_error = Rc::clone(&release);
                    self.enqueue(
                        dependencies,
                        Some(Box::new(move || {
                            let release = release.borrow_mut().take();
                            if let Some(release) = release {
                                release();
                            }
                            Ok(())
                        })),
                        Some(Box::new(move |_: ModuleError| {
                            let release = on_error.borrow_mut().take();
                            if let Some(release) = release {
                                release();
                            }
                            Ok(())
                        })),
                    );
                }
                Err(e) => {
                    debug!("Running {} without {}: {}", USER_MODULE, SITE_MODULE, e);
                    release();
                }
            }
        }

        gate.arm();
        Ok(())
    }

    fn run_script(&self, module: &str, script: Option<ModuleScript>) {
        let result = match script {
            Some(ModuleScript::Urls(urls)) => {
                self.nested_add_script(module.to_string(), urls.into(), 0);
                return;
            }
            Some(ModuleScript::Function(function)) => {
                self.run_function(module, &function, Require::new(self.downgrade()))
            }
            Some(ModuleScript::Package { main, files }) => match files.get(&main) {
                Some(PackageFile::Function(function)) => self.run_function(
                    module,
                    function,
                    Require::scoped(self.downgrade(), module, &main),
                ),
                _ => Err(anyhow!("Main file in module {} must be a function", module)),
            },
            Some(ModuleScript::Source(source)) => self.host().eval(&source),
            None => Ok(()),
        };

        match result {
            Ok(()) => self.set_and_propagate(module, ModuleState::Ready),
            Err(e) => {
                let message = format!("{:#}", e);
                self.track(TrackedError::new(
                    ErrorSource::ModuleExecute,
                    Some(module),
                    &message,
                ));
                self.set_and_propagate(module, ModuleState::Error);
            }
        }
    }

    fn run_function(
        &self,
        module: &str,
        function: &ModuleFunction,
        require: Require,
    ) -> anyhow::Result<()> {
        let mut handle = self
            .state_mut()
            .registry
            .get_mut(module)
            .map(|d| mem::take(&mut d.module))
            .unwrap_or_default();
        let result = function.call(&require, &mut handle);
        if let Some(descriptor) = self.state_mut().registry.get_mut(module) {
            descriptor.module = handle;
        }
        result
    }

    fn nested_add_script(&self, module: String, urls: Rc<[String]>, offset: usize) {
        let Some(url) = urls.get(offset).cloned() else {
            self.set_and_propagate(&module, ModuleState::Ready);
            return;
        };
        let loader = self.downgrade();
        self.queue_module_script(
            url,
            Box::new(move || {
                if let Some(loader) = loader.upgrade() {
                    loader.nested_add_script(module, urls, offset + 1);
                }
            }),
        );
    }

    /// Module scripts load strictly one at a time, across all modules.
    fn queue_module_script(&self, url: String, done: Box<dyn FnOnce()>) {
        let next = {
            let mut st = self.state_mut();
            st.pending_scripts.push_back(PendingScript { url, done });
            if st.handling_pending_scripts {
                None
            } else {
                st.handling_pending_scripts = true;
                st.pending_scripts.pop_front()
            }
        };
        if let Some(script) = next {
            self.start_script(script);
        }
    }

    fn start_script(&self, script: PendingScript) {
        let PendingScript { url, done } = script;
        debug!("Loading module script {}", url);
        let loader = self.downgrade();
        self.host().add_script(
            &url,
            Box::new(move || {
                done();
                if let Some(loader) = loader.upgrade() {
                    loader.next_script();
                }
            }),
        );
    }

    fn next_script(&self) {
        let next = {
            let mut st = self.state_mut();
            let next = st.pending_scripts.pop_front();
            if next.is_none() {
                st.handling_pending_scripts = false;
            }
            next
        };
        if let Some(script) = next {
            self.start_script(script);
        }
    }

    /// Buffer CSS for the next flush. `@import` rules start a fresh buffer.
    fn add_embedded_css(&self, css: &str, callback: Box<dyn FnOnce()>) {
        let mut guard = self.state_mut();
        let st = &mut *guard;
        let buffer = match st.css_buffer.clone().filter(|_| !css.starts_with("@import")) {
            Some(buffer) => buffer,
            None => {
                let buffer = Rc::new(RefCell::new(CssBuffer::default()));
                st.css_buffer = Some(Rc::clone(&buffer));
                let flushed = Rc::clone(&buffer);
                st.tasks.push(Box::new(move |loader: &ModuleLoader| {
                    loader.flush_css_buffer(&flushed)
                }));
                buffer
            }
        };
        let mut buffer = buffer.borrow_mut();
        buffer.text.push('\n');
        buffer.text.push_str(css);
        buffer.callbacks.push(callback);
    }

    fn flush_css_buffer(&self, buffer: &Rc<RefCell<CssBuffer>>) {
        {
            let mut st = self.state_mut();
            if st
                .css_buffer
                .as_ref()
                .is_some_and(|current| Rc::ptr_eq(current, buffer))
            {
                st.css_buffer = None;
            }
        }
        let (text, callbacks) = {
            let mut buffer = buffer.borrow_mut();
            (mem::take(&mut buffer.text), mem::take(&mut buffer.callbacks))
        };
        self.host().insert_style(&text);
        for callback in callbacks {
            callback();
        }
    }
}
