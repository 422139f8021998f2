//! Loader lifecycle and propagation tests

use anyhow::anyhow;
use futures::FutureExt;
use indexmap::IndexMap;
use resource_loader::{
    ErrorSource, Implementation, ModuleError, ModuleScript, ModuleState, PackageFile,
    Registration, StylePayload,
};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
mod common;
use common::*;

#[test]
fn test_chain_executes_in_dependency_order() {
    let fx = Fixture::new();
    fx.register("c", "1", &[]);
    fx.register("b", "1", &["c"]);
    fx.register("a", "1", &["b"]);
    let log = trace();

    let mut using = fx.loader.using(&["a"]);
    assert_eq!(fx.transport.requested_modules(), ["a", "b", "c"]);
    for name in ["a", "b", "c"] {
        assert_eq!(fx.loader.get_state(name), Some(ModuleState::Loading));
    }

    fx.loader.implement("a@1", traced("a", &log)).unwrap();
    assert_eq!(fx.loader.get_state("a"), Some(ModuleState::Loaded));
    fx.loader.implement("c@1", traced("c", &log)).unwrap();
    assert!(using.try_take().is_none());
    fx.loader.implement("b@1", traced("b", &log)).unwrap();

    assert_eq!(*log.borrow(), ["c", "b", "a"]);
    let require = using.try_take().unwrap().unwrap();
    assert_eq!(require.get("a").unwrap(), json!({"name": "a"}));
    assert_eq!(fx.loader.pending_jobs(), 0);
}

#[test]
fn test_job_fires_once() {
    let fx = Fixture::new();
    fx.register("a", "1", &[]);
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    let _using = fx.loader.using_then(
        &["a"],
        move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        },
        |_| Ok(()),
    );
    fx.loader.implement("a@1", Implementation::new()).unwrap();
    fx.loader.set_state([("a", ModuleState::Ready)]);
    fx.loader.using(&["a"]).now_or_never().unwrap().unwrap();
    assert_eq!(calls.get(), 1);
}

#[test]
fn test_job_waits_for_every_dependency() {
    let fx = Fixture::new();
    fx.register("a", "1", &[]);
    fx.register("b", "1", &[]);
    let mut using = fx.loader.using(&["a", "b"]);

    fx.loader.implement("a@1", Implementation::new()).unwrap();
    assert_eq!(fx.loader.get_state("a"), Some(ModuleState::Ready));
    assert!(using.try_take().is_none());

    fx.loader.implement("b@1", Implementation::new()).unwrap();
    assert!(using.try_take().unwrap().is_ok());
}

#[test]
fn test_failure_cascades_in_one_pass() {
    let fx = Fixture::new();
    fx.register("c", "1", &[]);
    fx.register("b", "1", &["c"]);
    fx.register("a", "1", &["b"]);
    fx.register("unrelated", "1", &[]);
    let using = fx.loader.using(&["a"]);

    fx.loader.set_state([("c", ModuleState::Missing)]);

    assert_eq!(fx.loader.get_state("c"), Some(ModuleState::Missing));
    assert_eq!(fx.loader.get_state("b"), Some(ModuleState::Error));
    assert_eq!(fx.loader.get_state("a"), Some(ModuleState::Error));
    assert_eq!(fx.loader.get_state("unrelated"), Some(ModuleState::Registered));
    assert_eq!(
        using.now_or_never().unwrap().unwrap_err(),
        ModuleError::DependencyFailed("c".into())
    );
}

#[test]
fn test_failed_base_module_fails_everything() {
    let mut config = test_config();
    config.base_modules = vec!["base".into()];
    let fx = Fixture::with_config(config);
    fx.register("base", "1", &[]);
    fx.register("a", "1", &[]);
    fx.register("b", "1", &[]);
    let using = fx.loader.using(&["a"]);
    assert_eq!(fx.transport.requested_modules(), ["a", "base"]);

    fx.loader.set_state([("base", ModuleState::Error)]);
    assert_eq!(fx.loader.get_state("a"), Some(ModuleState::Error));
    assert_eq!(fx.loader.get_state("b"), Some(ModuleState::Error));
    assert_eq!(
        using.now_or_never().unwrap().unwrap_err(),
        ModuleError::DependencyFailed("base".into())
    );
}

#[test]
fn test_failed_base_module_fails_dependent_base_modules() {
    let mut config = test_config();
    config.base_modules = vec!["base1".into(), "base2".into(), "base3".into()];
    let fx = Fixture::with_config(config);
    fx.register("base1", "1", &[]);
    fx.register("base2", "1", &["base1"]);
    fx.register("base3", "1", &[]);
    fx.register("a", "1", &[]);
    let _using = fx.loader.using(&["a"]);

    fx.loader.set_state([("base1", ModuleState::Error)]);
    assert_eq!(fx.loader.get_state("base2"), Some(ModuleState::Error));
    assert_eq!(fx.loader.get_state("a"), Some(ModuleState::Error));
    assert_eq!(fx.loader.get_state("base3"), Some(ModuleState::Loading));
}

#[test]
fn test_modules_wait_for_base_modules() {
    let mut config = test_config();
    config.base_modules = vec!["base".into()];
    let fx = Fixture::with_config(config);
    fx.register("base", "1", &[]);
    fx.register("a", "1", &[]);
    let log = trace();
    let mut using = fx.loader.using(&["a"]);

    fx.loader.implement("a@1", traced("a", &log)).unwrap();
    assert_eq!(fx.loader.get_state("a"), Some(ModuleState::Loaded));
    fx.loader.implement("base@1", traced("base", &log)).unwrap();

    assert_eq!(*log.borrow(), ["base", "a"]);
    assert!(using.try_take().unwrap().is_ok());
}

#[test]
fn test_ready_modules_do_not_fail_later() {
    let fx = Fixture::new();
    fx.register("dep", "1", &[]);
    fx.register("a", "1", &["dep"]);
    fx.loader.load(&["a"]);
    fx.loader.set_state([("a", ModuleState::Ready)]);
    fx.loader.set_state([("dep", ModuleState::Error)]);
    assert_eq!(fx.loader.get_state("dep"), Some(ModuleState::Error));
    assert_eq!(fx.loader.get_state("a"), Some(ModuleState::Ready));
}

#[test]
fn test_implement_registers_unknown_module() {
    let fx = Fixture::new();
    let log = trace();
    fx.loader.implement("fresh@3", traced("fresh", &log)).unwrap();

    let info = fx.loader.inspect("fresh").unwrap();
    assert_eq!(info.version, "3");
    assert_eq!(info.state, ModuleState::Ready);
    assert_eq!(*log.borrow(), ["fresh"]);
    assert!(fx.transport.requests().is_empty());
}

#[test]
fn test_skipped_module_is_never_requested() {
    let fx = Fixture::new();
    fx.register("polyfill-dep", "1", &[]);
    fx.loader
        .register(
            Registration::new("polyfill")
                .version("1")
                .dependencies(["polyfill-dep"])
                .skip(|| true),
        )
        .unwrap();

    let using = fx.loader.using(&["polyfill"]);
    assert!(using.now_or_never().unwrap().is_ok());
    assert_eq!(fx.loader.get_state("polyfill"), Some(ModuleState::Ready));
    assert_eq!(fx.loader.get_state("polyfill-dep"), Some(ModuleState::Registered));
    assert!(fx.transport.requests().is_empty());
}

#[test]
fn test_unknown_module_rejects_using() {
    let fx = Fixture::new();
    let seen = Rc::new(Cell::new(false));
    let flag = Rc::clone(&seen);
    let using = fx.loader.using_then(
        &["nope"],
        |_| Ok(()),
        move |e| {
            flag.set(*e == ModuleError::UnknownModule("nope".into()));
            Ok(())
        },
    );
    assert_eq!(
        using.now_or_never().unwrap().unwrap_err(),
        ModuleError::UnknownModule("nope".into())
    );
    assert!(seen.get());
}

#[test]
fn test_load_ignores_unknown_modules() {
    let fx = Fixture::new();
    fx.register("a", "1", &[]);
    fx.loader.load(&["nope", "a"]);
    assert_eq!(fx.transport.requested_modules(), ["a"]);
    assert!(fx.loader.take_tracked_errors().is_empty());
}

#[test]
fn test_load_reports_circular_registered_module() {
    let fx = Fixture::new();
    fx.register("x", "1", &["y"]);
    fx.register("y", "1", &["x"]);
    fx.register("ok", "1", &[]);
    fx.loader.load(&["x", "ok"]);

    assert_eq!(fx.transport.requested_modules(), ["ok"]);
    let tracked = fx.loader.take_tracked_errors();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].source, ErrorSource::Resolve);
    assert_eq!(tracked[0].module.as_deref(), Some("x"));
}

#[test]
fn test_load_single_url_adds_script() {
    let fx = Fixture::new();
    fx.loader.load(&["https://example.org/gadget.js"]);
    assert_eq!(fx.host.pending_scripts(), ["https://example.org/gadget.js"]);
    fx.loader
        .load_url("/styles.css", Some("text/css"))
        .unwrap();
    assert_eq!(fx.host.links(), [("/styles.css".to_string(), None)]);
}

#[test]
fn test_callback_errors_are_tracked() {
    let fx = Fixture::new();
    fx.register("a", "1", &[]);
    fx.loader.set_state([("a", ModuleState::Ready)]);

    let using = fx
        .loader
        .using_then(&["a"], |_| Err(anyhow!("boom")), |_| Ok(()));
    assert!(using.now_or_never().unwrap().is_ok());

    let tracked = fx.loader.take_tracked_errors();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].source, ErrorSource::LoadCallback);
    assert_eq!(tracked[0].message, "boom");
    assert!(fx.run_tasks() >= 1);
}

#[test]
fn test_execution_failure_is_tracked() {
    let fx = Fixture::new();
    fx.register("bad", "1", &[]);
    fx.register("dependent", "1", &["bad"]);
    let using = fx.loader.using(&["dependent"]);

    fx.loader
        .implement(
            "bad@1",
            Implementation::new().function(|_, _| Err(anyhow!("kaboom"))),
        )
        .unwrap();

    assert_eq!(fx.loader.get_state("bad"), Some(ModuleState::Error));
    assert_eq!(fx.loader.get_state("dependent"), Some(ModuleState::Error));
    let tracked = fx.loader.take_tracked_errors();
    assert_eq!(tracked[0].source, ErrorSource::ModuleExecute);
    assert_eq!(tracked[0].module.as_deref(), Some("bad"));
    assert_eq!(tracked[0].message, "kaboom");
    assert_eq!(
        using.now_or_never().unwrap().unwrap_err(),
        ModuleError::DependencyFailed("bad".into())
    );
}

#[test]
fn test_user_runs_after_site() {
    let fx = Fixture::new();
    fx.register("site", "1", &[]);
    fx.register("user", "1", &[]);
    let log = trace();
    let mut using = fx.loader.using(&["user"]);

    fx.loader.implement("user@1", traced("user", &log)).unwrap();
    assert_eq!(fx.loader.get_state("user"), Some(ModuleState::Executing));
    assert_eq!(fx.transport.requested_modules(), ["user", "site"]);
    assert!(log.borrow().is_empty());

    fx.loader.implement("site@1", traced("site", &log)).unwrap();
    assert_eq!(*log.borrow(), ["site", "user"]);
    assert_eq!(fx.loader.get_state("user"), Some(ModuleState::Ready));
    assert!(using.try_take().unwrap().is_ok());
}

#[test]
fn test_user_runs_when_site_fails() {
    let fx = Fixture::new();
    fx.register("site", "1", &[]);
    fx.register("user", "1", &[]);
    let log = trace();
    let _using = fx.loader.using(&["user"]);

    fx.loader.implement("user@1", traced("user", &log)).unwrap();
    fx.loader.set_state([("site", ModuleState::Error)]);
    assert_eq!(*log.borrow(), ["user"]);
    assert_eq!(fx.loader.get_state("user"), Some(ModuleState::Ready));
}

#[test]
fn test_user_without_site_registered() {
    let fx = Fixture::new();
    let log = trace();
    fx.loader.implement("user@1", traced("user", &log)).unwrap();
    assert_eq!(*log.borrow(), ["user"]);
}

#[test]
fn test_styles_are_flushed_before_script() {
    let fx = Fixture::new();
    fx.register("a", "1", &[]);
    let log = trace();
    let mut using = fx.loader.using(&["a"]);

    let style = StylePayload {
        css: vec![
            ".a{}".to_string(),
            "@import url(x.css);".to_string(),
            ".b{}".to_string(),
        ],
        url: IndexMap::new(),
    }
    .link("print", "/print.css");
    fx.loader
        .implement("a@1", traced("a", &log).style(style))
        .unwrap();

    assert_eq!(fx.loader.get_state("a"), Some(ModuleState::Executing));
    assert_eq!(fx.host.links(), [("/print.css".to_string(), Some("print".to_string()))]);
    assert!(fx.host.styles().is_empty());
    assert!(log.borrow().is_empty());

    fx.run_tasks();
    assert_eq!(
        fx.host.styles(),
        ["\n.a{}", "\n@import url(x.css);\n.b{}"]
    );
    assert_eq!(*log.borrow(), ["a"]);
    assert!(using.try_take().unwrap().is_ok());
}

#[test]
fn test_messages_and_templates_reach_host() {
    let fx = Fixture::new();
    let mut messages = IndexMap::new();
    messages.insert("greeting".to_string(), json!("Hello"));
    let mut templates = IndexMap::new();
    templates.insert("row.html".to_string(), "<tr></tr>".to_string());

    fx.loader
        .implement(
            "a@1",
            Implementation::new().messages(messages).templates(templates),
        )
        .unwrap();
    assert_eq!(fx.host.message("greeting"), Some(json!("Hello")));
    assert_eq!(
        fx.host
            .templates("a")
            .and_then(|t| t.get("row.html").cloned())
            .as_deref(),
        Some("<tr></tr>")
    );
    assert_eq!(fx.loader.get_state("a"), Some(ModuleState::Ready));
}

#[test]
fn test_script_urls_load_sequentially() {
    let fx = Fixture::new();
    fx.register("legacy", "1", &[]);
    fx.register("other", "1", &[]);
    let mut using = fx.loader.using(&["legacy", "other"]);

    fx.loader
        .implement(
            "legacy@1",
            Implementation::new().script(ModuleScript::Urls(vec!["/a.js".into(), "/b.js".into()])),
        )
        .unwrap();
    fx.loader
        .implement(
            "other@1",
            Implementation::new().script(ModuleScript::Urls(vec!["/c.js".into()])),
        )
        .unwrap();
    assert_eq!(fx.host.pending_scripts(), ["/a.js"]);

    assert_eq!(fx.host.complete_next_script().as_deref(), Some("/a.js"));
    assert_eq!(fx.host.pending_scripts(), ["/c.js"]);
    fx.host.complete_next_script();
    assert_eq!(fx.loader.get_state("other"), Some(ModuleState::Ready));
    assert_eq!(fx.loader.get_state("legacy"), Some(ModuleState::Executing));
    assert!(using.try_take().is_none());

    fx.host.complete_next_script();
    assert_eq!(fx.host.loaded_scripts(), ["/a.js", "/c.js", "/b.js"]);
    assert_eq!(fx.loader.get_state("legacy"), Some(ModuleState::Ready));
    assert!(using.try_take().unwrap().is_ok());
}

#[test]
fn test_source_script_is_evaluated() {
    let fx = Fixture::new();
    fx.host.define_failing_source("throw new Error()");
    fx.loader
        .implement("ok@1", Implementation::new().script(ModuleScript::Source("x = 1;".into())))
        .unwrap();
    fx.loader
        .implement(
            "broken@1",
            Implementation::new().script(ModuleScript::Source("throw new Error()".into())),
        )
        .unwrap();
    assert_eq!(fx.host.evaluated(), ["x = 1;"]);
    assert_eq!(fx.loader.get_state("ok"), Some(ModuleState::Ready));
    assert_eq!(fx.loader.get_state("broken"), Some(ModuleState::Error));
}

#[test]
fn test_package_files_resolve_relative_requires() {
    let fx = Fixture::new();
    let util_runs = Rc::new(Cell::new(0));
    let runs = Rc::clone(&util_runs);

    let mut files = IndexMap::new();
    files.insert(
        "index.js".to_string(),
        PackageFile::Function(resource_loader::ModuleFunction::new(|require, module| {
            let util = require.get("./lib/util.js")?;
            let again = require.get("./lib/util.js")?;
            module.set_export("util", util);
            module.set_export("same", json!(again == json!({"answer": 42})));
            Ok(())
        })),
    );
    files.insert(
        "lib/util.js".to_string(),
        PackageFile::Function(resource_loader::ModuleFunction::new(move |require, module| {
            runs.set(runs.get() + 1);
            let data = require.get("../data.json")?;
            module.set_export("answer", data["answer"].clone());
            Ok(())
        })),
    );
    files.insert("data.json".to_string(), PackageFile::Data(json!({"answer": 42})));

    fx.loader
        .implement(
            "pkg@1",
            Implementation::new().script(ModuleScript::Package {
                main: "index.js".into(),
                files,
            }),
        )
        .unwrap();

    assert_eq!(fx.loader.get_state("pkg"), Some(ModuleState::Ready));
    assert_eq!(
        fx.loader.require("pkg").unwrap(),
        json!({"util": {"answer": 42}, "same": true})
    );
    assert_eq!(util_runs.get(), 1);
}

#[test]
fn test_package_main_must_be_function() {
    let fx = Fixture::new();
    let mut files = IndexMap::new();
    files.insert("index.json".to_string(), PackageFile::Data(json!({})));
    fx.loader
        .implement(
            "pkg@1",
            Implementation::new().script(ModuleScript::Package {
                main: "index.json".into(),
                files,
            }),
        )
        .unwrap();
    assert_eq!(fx.loader.get_state("pkg"), Some(ModuleState::Error));
    let tracked = fx.loader.take_tracked_errors();
    assert_eq!(
        tracked[0].message,
        "Main file in module pkg must be a function"
    );
}

#[test]
fn test_missing_package_file() {
    let fx = Fixture::new();
    let mut files = IndexMap::new();
    files.insert(
        "index.js".to_string(),
        PackageFile::Function(resource_loader::ModuleFunction::new(|require, _| {
            require.get("./missing.js")?;
            Ok(())
        })),
    );
    fx.loader
        .implement(
            "pkg@1",
            Implementation::new().script(ModuleScript::Package {
                main: "index.js".into(),
                files,
            }),
        )
        .unwrap();
    assert_eq!(fx.loader.get_state("pkg"), Some(ModuleState::Error));
    let tracked = fx.loader.take_tracked_errors();
    assert_eq!(tracked[0].message, "Cannot require undefined file missing.js");
}

#[test]
fn test_receive_response_applies_every_call() {
    let fx = Fixture::new();
    fx.register("a", "1", &[]);
    fx.register("b", "1", &[]);
    fx.register("c", "1", &[]);
    fx.host.define_function("function(){a}", |_, module| {
        module.set_export("a", json!(true));
        Ok(())
    });
    let using = fx.loader.using(&["a", "b"]);

    let result = fx.loader.receive_response(concat!(
        r#"mw.loader.implement("a@1",{"function":"function(){a}"},null,null,null);"#,
        r#"mw.loader.implement("c@1",{"function":"function(){unknown}"});"#,
        r#"mw.loader.state({"b":"ready"});"#,
    ));

    assert!(matches!(result, Err(ModuleError::Codec(_))));
    assert_eq!(fx.loader.get_state("a"), Some(ModuleState::Ready));
    assert_eq!(fx.loader.get_state("b"), Some(ModuleState::Ready));
    assert_eq!(fx.loader.get_state("c"), Some(ModuleState::Registered));
    let require = using.now_or_never().unwrap().unwrap();
    assert_eq!(require.get("a").unwrap(), json!({"a": true}));
}

#[test]
fn test_state_push_cannot_regress() {
    let fx = Fixture::new();
    fx.register("a", "1", &[]);
    fx.loader.set_state([("a", ModuleState::Ready)]);
    fx.loader.set_state([("a", ModuleState::Loading), ("a", ModuleState::Error)]);
    assert_eq!(fx.loader.get_state("a"), Some(ModuleState::Ready));
}

#[test]
fn test_state_push_registers_unknown_names() {
    let fx = Fixture::new();
    fx.loader.set_state([("pushed".to_string(), ModuleState::Missing)]);
    assert_eq!(fx.loader.get_state("pushed"), Some(ModuleState::Missing));
}

#[test]
fn test_callbacks_may_reenter_loader() {
    let fx = Fixture::new();
    fx.register("a", "1", &[]);
    fx.register("b", "1", &[]);
    let loader = fx.loader.clone();
    let inner = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&inner);
    let _using = fx.loader.using_then(
        &["a"],
        move |_| {
            *slot.borrow_mut() = Some(loader.using(&["b"]));
            loader.implement("b@1", Implementation::new())?;
            Ok(())
        },
        |_| Ok(()),
    );
    fx.loader.implement("a@1", Implementation::new()).unwrap();

    assert_eq!(fx.loader.get_state("b"), Some(ModuleState::Ready));
    let inner = inner.borrow_mut().take().unwrap();
    assert!(inner.now_or_never().unwrap().is_ok());
    assert!(fx.loader.take_tracked_errors().is_empty());
}

#[test]
fn test_jobs_settle_once_in_registration_order() {
    let fx = Fixture::new();
    fx.register("a", "1", &[]);
    fx.register("b", "1", &["a"]);
    fx.register("c", "1", &["b"]);
    assert_eq!(fx.loader.resolve(&["c"]).unwrap(), ["a", "b", "c"]);

    let log = trace();
    let mut pending = Vec::new();
    for job in ["first", "second", "third"] {
        let log = Rc::clone(&log);
        pending.push(fx.loader.using_then(
            &["c"],
            move |_| {
                log.borrow_mut().push(job.to_string());
                Ok(())
            },
            |_| Ok(()),
        ));
    }

    for key in ["a@1", "b@1", "c@1"] {
        fx.loader.implement(key, Implementation::new()).unwrap();
    }
    fx.loader
        .set_state([("a", ModuleState::Ready), ("b", ModuleState::Ready), ("c", ModuleState::Ready)]);

    assert_eq!(*log.borrow(), ["first", "second", "third"]);
    assert_eq!(fx.loader.pending_jobs(), 0);
    assert!(pending.iter_mut().all(|using| using.try_take().unwrap().is_ok()));
}

#[test]
fn test_state_change_from_callback_propagates() {
    let fx = Fixture::new();
    fx.register("a", "1", &[]);
    fx.register("b", "1", &[]);
    fx.loader.load(&["a", "b"]);
    let loader = fx.loader.clone();
    let _using = fx.loader.using_then(
        &["a"],
        move |_| {
            loader.implement("b@1", Implementation::new())?;
            Ok(())
        },
        |_| Ok(()),
    );

    fx.loader.set_state([("a", ModuleState::Ready)]);
    assert_eq!(fx.loader.get_state("b"), Some(ModuleState::Ready));
    assert!(fx.loader.take_tracked_errors().is_empty());
}

#[test]
fn test_loaded_module_waits_for_every_dependency() {
    let fx = Fixture::new();
    fx.register("d1", "1", &[]);
    fx.register("d2", "1", &[]);
    fx.register("m", "1", &["d1", "d2"]);
    let log = trace();
    let mut using = fx.loader.using(&["m"]);

    fx.loader.implement("d1@1", traced("d1", &log)).unwrap();
    fx.loader.implement("m@1", traced("m", &log)).unwrap();
    assert_eq!(fx.loader.get_state("d1"), Some(ModuleState::Ready));
    assert_eq!(fx.loader.get_state("d2"), Some(ModuleState::Loading));
    assert_eq!(fx.loader.get_state("m"), Some(ModuleState::Loaded));
    assert_eq!(*log.borrow(), ["d1"]);
    assert!(using.try_take().is_none());

    fx.loader.implement("d2@1", traced("d2", &log)).unwrap();
    assert_eq!(*log.borrow(), ["d1", "d2", "m"]);
    assert!(using.try_take().unwrap().is_ok());
}
