//! Configuration loading tests

use resource_loader::{
    ConfigError, HeadlessHost, LoaderConfig, ModuleLoader, RecordingTransport, StoreBackend,
};
use std::io::Write;
use std::rc::Rc;

fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_toml_file() {
    let file = write_config(
        ".toml",
        r#"
        base_modules = ["startup"]

        [sources]
        local = "/w/load.php"
        commons = "https://commons.example/w/load.php"

        [request]
        skin = "minerva"
        user_name = "Example"
        user_group = 1

        [store]
        backend = "memory"
        flush_delay_ms = 500
        uncacheable_groups = [1]

        [logging]
        filter = "resource_loader=debug"
        "#,
    );
    let config = LoaderConfig::from_file(file.path()).unwrap();
    assert_eq!(config.base_modules, ["startup"]);
    assert_eq!(config.sources.len(), 2);
    assert_eq!(config.request.skin, "minerva");
    assert_eq!(config.request.user_group, 1);
    assert_eq!(config.store.backend, StoreBackend::Memory);
    assert_eq!(config.store.flush_delay_ms, 500);
    assert_eq!(config.store.uncacheable_groups, [1]);
    assert_eq!(
        config.logging.and_then(|l| l.filter).as_deref(),
        Some("resource_loader=debug")
    );
}

#[test]
fn test_json_file_by_extension() {
    let file = write_config(
        ".json",
        r#"{"max_query_length": 2000, "store": {"enabled": false}}"#,
    );
    let config = LoaderConfig::from_file(file.path()).unwrap();
    assert_eq!(config.max_query_length, 2000);
    assert!(!config.store.enabled);
    assert_eq!(config.base_modules, ["jquery", "mediawiki.base"]);
}

#[test]
fn test_invalid_files_are_rejected() {
    let file = write_config(".toml", "max_query_length = \"long\"");
    assert!(matches!(
        LoaderConfig::from_file(file.path()),
        Err(ConfigError::Toml(_))
    ));

    let file = write_config(".json", "{");
    assert!(matches!(
        LoaderConfig::from_file(file.path()),
        Err(ConfigError::Json(_))
    ));

    assert!(matches!(
        LoaderConfig::from_file("/nonexistent/loader.toml"),
        Err(ConfigError::Io(_))
    ));
}

#[test]
fn test_validation_errors() {
    for toml in [
        "max_query_length = 0",
        "base_modules = [\"\"]",
        "base_modules = [\"a\", \"b\", \"a\"]",
        "[store]\nkey = \"\"",
        "[sources]",
    ] {
        assert!(
            matches!(LoaderConfig::from_toml_str(toml), Err(ConfigError::Invalid(_))),
            "accepted {:?}",
            toml
        );
    }
}

#[test]
fn test_loader_rejects_invalid_config() {
    let config = LoaderConfig {
        max_query_length: 0,
        ..LoaderConfig::default()
    };
    let result = ModuleLoader::new(
        config,
        Rc::new(HeadlessHost::new()),
        Rc::new(RecordingTransport::new()),
    );
    assert!(result.is_err());
}

#[test]
fn test_redb_backend_without_path_falls_back_to_memory() {
    let mut config = LoaderConfig::default();
    config.store.backend = StoreBackend::Redb;
    config.store.path = None;
    let loader = ModuleLoader::new(
        config,
        Rc::new(HeadlessHost::new()),
        Rc::new(RecordingTransport::new()),
    );
    assert!(loader.is_ok());
}
