//! In-process script host
//!
//! [`HeadlessHost`] runs module payloads without a page: it records styles,
//! links, messages and templates, compiles function sources from a table of
//! predefined functions and holds script URLs until the embedder completes
//! them.

use anyhow::{anyhow, bail};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::module::require::Require;
use crate::module::script::{Messages, ModuleFunction, ModuleHandle, Templates};
use crate::module::traits::ScriptHost;

type PendingScript = (String, Box<dyn FnOnce()>);

/// Headless host for tools and tests
#[derive(Default)]
pub struct HeadlessHost {
    functions: RefCell<HashMap<String, ModuleFunction>>,
    failing_sources: RefCell<HashSet<String>>,
    evaluated: RefCell<Vec<String>>,
    styles: RefCell<Vec<String>>,
    links: RefCell<Vec<(String, Option<String>)>>,
    messages: RefCell<Messages>,
    templates: RefCell<IndexMap<String, Templates>>,
    scripts: RefCell<VecDeque<PendingScript>>,
    loaded_scripts: RefCell<Vec<String>>,
}

impl HeadlessHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind function source text to a native body.
    ///
    /// Returns the function as `compile` will hand it out, source attached.
    pub fn define_function<F>(&self, source: &str, body: F) -> ModuleFunction
    where
        F: Fn(&Require, &mut ModuleHandle) -> anyhow::Result<()> + 'static,
    {
        let function = ModuleFunction::new(body).with_source(source);
        self.functions
            .borrow_mut()
            .insert(source.to_string(), function.clone());
        function
    }

    /// Make `eval` fail for this source text
    pub fn define_failing_source(&self, source: &str) {
        self.failing_sources.borrow_mut().insert(source.to_string());
    }

    /// Sources passed to `eval`, in order
    pub fn evaluated(&self) -> Vec<String> {
        self.evaluated.borrow().clone()
    }

    /// Inserted stylesheet texts, in order
    pub fn styles(&self) -> Vec<String> {
        self.styles.borrow().clone()
    }

    pub fn links(&self) -> Vec<(String, Option<String>)> {
        self.links.borrow().clone()
    }

    pub fn message(&self, key: &str) -> Option<serde_json::Value> {
        self.messages.borrow().get(key).cloned()
    }

    pub fn templates(&self, module: &str) -> Option<Templates> {
        self.templates.borrow().get(module).cloned()
    }

    /// Script URLs waiting for completion
    pub fn pending_scripts(&self) -> Vec<String> {
        self.scripts.borrow().iter().map(|(url, _)| url.clone()).collect()
    }

    /// Script URLs completed so far
    pub fn loaded_scripts(&self) -> Vec<String> {
        self.loaded_scripts.borrow().clone()
    }

    /// Finish the oldest pending script and run its completion callback
    pub fn complete_next_script(&self) -> Option<String> {
        let (url, done) = self.scripts.borrow_mut().pop_front()?;
        debug!("Script {} finished", url);
        self.loaded_scripts.borrow_mut().push(url.clone());
        done();
        Some(url)
    }

    /// Finish scripts until none are pending, including ones queued meanwhile
    pub fn complete_all_scripts(&self) -> usize {
        let mut completed = 0;
        while self.complete_next_script().is_some() {
            completed += 1;
        }
        completed
    }
}

impl ScriptHost for HeadlessHost {
    fn eval(&self, source: &str) -> anyhow::Result<()> {
        if self.failing_sources.borrow().contains(source) {
            bail!("Script error while evaluating {} bytes", source.len());
        }
        self.evaluated.borrow_mut().push(source.to_string());
        Ok(())
    }

    fn compile(&self, source: &str) -> anyhow::Result<ModuleFunction> {
        self.functions
            .borrow()
            .get(source)
            .cloned()
            .ok_or_else(|| anyhow!("Cannot compile unknown function source: {}", source))
    }

    fn insert_style(&self, css: &str) {
        self.styles.borrow_mut().push(css.to_string());
    }

    fn insert_link(&self, url: &str, media: Option<&str>) {
        self.links
            .borrow_mut()
            .push((url.to_string(), media.map(str::to_string)));
    }

    fn add_script(&self, url: &str, done: Box<dyn FnOnce()>) {
        self.scripts.borrow_mut().push_back((url.to_string(), done));
    }

    fn set_messages(&self, messages: &Messages) {
        let mut current = self.messages.borrow_mut();
        for (key, value) in messages {
            current.insert(key.clone(), value.clone());
        }
    }

    fn set_templates(&self, module: &str, templates: &Templates) {
        self.templates
            .borrow_mut()
            .entry(module.to_string())
            .or_default()
            .extend(templates.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}
