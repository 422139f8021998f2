//! Module payloads
//!
//! What an `implement` call attaches to a registry entry: the script in one of
//! its four shapes, styles, messages and templates.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::rc::Rc;

use crate::module::require::Require;

/// Localisation messages, key to message text
pub type Messages = IndexMap<String, Value>;

/// Template name to template source
pub type Templates = IndexMap<String, String>;

/// The `module` object a script function receives
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleHandle {
    pub exports: Value,
}

impl ModuleHandle {
    pub fn new() -> Self {
        Self {
            exports: Value::Object(Map::new()),
        }
    }

    /// Set one key on the exports object, replacing a non-object exports value
    pub fn set_export(&mut self, key: impl Into<String>, value: Value) {
        if !self.exports.is_object() {
            self.exports = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.exports {
            map.insert(key.into(), value);
        }
    }
}

impl Default for ModuleHandle {
    fn default() -> Self {
        Self::new()
    }
}

type InitFn = dyn Fn(&Require, &mut ModuleHandle) -> anyhow::Result<()>;

/// Callable module body
///
/// Functions built in-process carry no source text and cannot be persisted to
/// the module store. Functions obtained from [`crate::ScriptHost::compile`]
/// keep the source they were compiled from.
#[derive(Clone)]
pub struct ModuleFunction {
    body: Rc<InitFn>,
    source: Option<Rc<str>>,
}

impl ModuleFunction {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&Require, &mut ModuleHandle) -> anyhow::Result<()> + 'static,
    {
        Self {
            body: Rc::new(body),
            source: None,
        }
    }

    /// Attach the source text this function was compiled from
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        let source: String = source.into();
        self.source = Some(Rc::from(source));
        self
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn call(&self, require: &Require, module: &mut ModuleHandle) -> anyhow::Result<()> {
        (self.body)(require, module)
    }
}

impl fmt::Debug for ModuleFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => f.debug_tuple("ModuleFunction").field(source).finish(),
            None => f.write_str("ModuleFunction(<native>)"),
        }
    }
}

/// Two functions are equal when they are the same closure or share source text.
impl PartialEq for ModuleFunction {
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.body, &other.body) {
            return true;
        }
        match (&self.source, &other.source) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// One file of a packaged module
#[derive(Debug, Clone, PartialEq)]
pub enum PackageFile {
    Function(ModuleFunction),
    Data(Value),
}

/// Module script in one of its delivery shapes
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleScript {
    /// Called with `require` and the module handle
    Function(ModuleFunction),
    /// Script URLs fetched and run one after another
    Urls(Vec<String>),
    /// Legacy source evaluated in the global scope
    Source(String),
    /// Multi-file package; `main` names the entry file
    Package {
        main: String,
        files: IndexMap<String, PackageFile>,
    },
}

impl ModuleScript {
    pub fn function<F>(body: F) -> Self
    where
        F: Fn(&Require, &mut ModuleHandle) -> anyhow::Result<()> + 'static,
    {
        ModuleScript::Function(ModuleFunction::new(body))
    }
}

/// Module styles: embedded CSS texts and link URLs keyed by media type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StylePayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub css: Vec<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub url: IndexMap<String, Vec<String>>,
}

impl StylePayload {
    pub fn css(text: impl Into<String>) -> Self {
        Self {
            css: vec![text.into()],
            url: IndexMap::new(),
        }
    }

    pub fn link(mut self, media: impl Into<String>, url: impl Into<String>) -> Self {
        self.url.entry(media.into()).or_default().push(url.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.css.is_empty() && self.url.is_empty()
    }
}

/// Payload delivered by one implement call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Implementation {
    pub script: Option<ModuleScript>,
    pub style: Option<StylePayload>,
    pub messages: Option<Messages>,
    pub templates: Option<Templates>,
}

impl Implementation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, script: ModuleScript) -> Self {
        self.script = Some(script);
        self
    }

    /// Shorthand for a function script
    pub fn function<F>(self, body: F) -> Self
    where
        F: Fn(&Require, &mut ModuleHandle) -> anyhow::Result<()> + 'static,
    {
        self.script(ModuleScript::function(body))
    }

    pub fn style(mut self, style: StylePayload) -> Self {
        self.style = Some(style);
        self
    }

    pub fn messages(mut self, messages: Messages) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn templates(mut self, templates: Templates) -> Self {
        self.templates = Some(templates);
        self
    }
}
