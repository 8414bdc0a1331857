//! Integration tests for dcache-config
//!
//! These tests verify config loading with real file system operations.

use std::path::PathBuf;
use tempfile::tempdir;

/// Test config loading from a real config file
#[test]
fn test_load_config_from_file() {
    let temp = tempdir().unwrap();
    let dcache_dir = temp.path().join(".dcache");
    std::fs::create_dir_all(&dcache_dir).unwrap();

    let config_content = r#"
[storage]
root = "/mnt/gluster/webcache"
shards = [[0, 1], [1, 3]]
create_dirs = true

[locking]
timeout_secs = 120
initial_backoff_ms = 250
max_backoff_ms = 4000

[logging]
level = "debug"
"#;
    let path = dcache_dir.join("config.toml");
    std::fs::write(&path, config_content).unwrap();

    let config = dcache_config::Config::from_file(&path).unwrap();

    assert_eq!(config.storage.root, PathBuf::from("/mnt/gluster/webcache"));
    assert_eq!(config.storage.shards, vec![(0, 1), (1, 3)]);
    assert!(config.storage.create_dirs);
    assert_eq!(config.locking.timeout_secs, 120);
    assert_eq!(config.locking.initial_backoff_ms, 250);
    assert_eq!(config.locking.max_backoff_ms, 4000);
    assert_eq!(
        config.logging.log_level(),
        dcache_config::logging::LogLevel::Debug
    );
}

/// Test config hierarchy: project config overrides global
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let temp = tempdir().unwrap();

    let global_path = temp.path().join("global.toml");
    std::fs::write(
        &global_path,
        r#"
[storage]
root = "/srv/cache"
shards = [[0, 2]]

[locking]
timeout_secs = 60
"#,
    )
    .unwrap();

    let project_path = temp.path().join("project.toml");
    std::fs::write(
        &project_path,
        r#"
[locking]
timeout_secs = 5
"#,
    )
    .unwrap();

    let mut config = dcache_config::Config::from_file(&global_path).unwrap();
    config.merge(dcache_config::Config::from_file(&project_path).unwrap());

    assert_eq!(config.storage.root, PathBuf::from("/srv/cache"));
    assert_eq!(config.storage.shards, vec![(0, 2)]);
    assert_eq!(config.locking.timeout_secs, 5);
}

/// Malformed TOML surfaces as a parse error, not a panic
#[test]
fn test_invalid_toml_is_an_error() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("broken.toml");
    std::fs::write(&path, "[storage\nroot = ").unwrap();

    let err = dcache_config::Config::from_file(&path).unwrap_err();
    assert!(matches!(err, dcache_config::ConfigError::Toml(_)));
}

/// Missing files surface as I/O errors
#[test]
fn test_missing_file_is_io_error() {
    let temp = tempdir().unwrap();
    let err = dcache_config::Config::from_file(temp.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, dcache_config::ConfigError::Io(_)));
}
