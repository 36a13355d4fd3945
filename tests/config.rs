use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use variant_catalog_sync::config::{Config, ConfigLoader};
use variant_catalog_sync::error::SyncError;

#[test]
fn config_file_is_resolved() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("vcsync.json");
    let store = temp.path().join("store.redb");
    fs::write(
        &path,
        format!(
            r#"{{
                "store_path": "{}",
                "batch_size": 500,
                "lock_duration_ms": 2000,
                "catalog": {{ "base_url": "http://localhost:9090/api/", "token": "abc" }}
            }}"#,
            store.display()
        ),
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.store_path.as_std_path(), store.as_path());
    assert_eq!(resolved.batch_size, 500);
    assert_eq!(resolved.lock_settings().duration, Duration::from_millis(2000));
    let catalog = resolved.catalog.unwrap();
    assert_eq!(catalog.base_url, "http://localhost:9090/api/");
}

#[test]
fn catalog_without_base_url_is_absent() {
    let config: Config = serde_json::from_str(r#"{ "catalog": { "token": "abc" } }"#).unwrap();
    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert!(resolved.catalog.is_none());
}

#[test]
fn zero_lock_duration_is_rejected() {
    let config = Config {
        lock_duration_ms: Some(0),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(SyncError::InvalidConfig(_))
    );
}
