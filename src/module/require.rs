//! The `require` handle passed to module functions

use serde_json::Value;

use crate::module::loader::WeakLoader;
use crate::module::traits::ModuleError;

/// Import function handed to module code
///
/// Inside a packaged module, names starting with `./` or `../` resolve against
/// the requiring file and load sibling package files. Everything else is a
/// registry lookup that requires the named module to be `ready`.
#[derive(Clone)]
pub struct Require {
    loader: WeakLoader,
    scope: Option<PackageScope>,
}

#[derive(Clone)]
struct PackageScope {
    module: String,
    base_path: String,
}

impl Require {
    pub(crate) fn new(loader: WeakLoader) -> Self {
        Self {
            loader,
            scope: None,
        }
    }

    pub(crate) fn scoped(loader: WeakLoader, module: &str, base_path: &str) -> Self {
        Self {
            loader,
            scope: Some(PackageScope {
                module: module.to_string(),
                base_path: base_path.to_string(),
            }),
        }
    }

    /// Exports of a ready module, or of a sibling package file
    pub fn get(&self, name: &str) -> Result<Value, ModuleError> {
        let loader = self.loader.upgrade().ok_or(ModuleError::LoaderGone)?;
        if let Some(scope) = &self.scope {
            if let Some(file) = resolve_relative_path(name, &scope.base_path) {
                return loader.require_package_file(&scope.module, &file);
            }
        }
        loader.require(name)
    }
}

impl std::fmt::Debug for Require {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Require");
        if let Some(scope) = &self.scope {
            s.field("module", &scope.module)
                .field("base_path", &scope.base_path);
        }
        s.finish()
    }
}

/// Resolve `./x` or `../x` against the directory of `base_path`.
///
/// Returns `None` when `relative` is not a relative path.
pub fn resolve_relative_path(relative: &str, base_path: &str) -> Option<String> {
    let mut rest = relative;
    let mut up = 0usize;
    let mut matched = false;
    loop {
        if let Some(tail) = rest.strip_prefix("./") {
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("../") {
            rest = tail;
            up += 1;
        } else {
            break;
        }
        matched = true;
    }
    if !matched {
        return None;
    }

    let mut dir: Vec<&str> = base_path.split('/').collect();
    dir.pop();
    for _ in 0..up {
        dir.pop();
    }
    dir.push(rest);
    Some(dir.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sibling_file() {
        assert_eq!(
            resolve_relative_path("./util.js", "lib/main.js").as_deref(),
            Some("lib/util.js")
        );
        assert_eq!(
            resolve_relative_path("./util.js", "main.js").as_deref(),
            Some("util.js")
        );
    }

    #[test]
    fn test_parent_directories() {
        assert_eq!(
            resolve_relative_path("../data.json", "lib/sub/main.js").as_deref(),
            Some("lib/data.json")
        );
        assert_eq!(
            resolve_relative_path("./../../x.js", "a/b/c.js").as_deref(),
            Some("x.js")
        );
    }

    #[test]
    fn test_module_names_are_not_relative() {
        assert_eq!(resolve_relative_path("jquery", "main.js"), None);
        assert_eq!(resolve_relative_path(".hidden", "main.js"), None);
    }
}
