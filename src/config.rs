use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::lock::LockSettings;
use crate::store::{DEFAULT_PAGE_SIZE, StoreOptions, default_store_path};
use crate::sync::SyncOptions;

pub const DEFAULT_CONFIG_FILE: &str = "vcsync.json";
pub const TOKEN_ENV: &str = "VCSYNC_CATALOG_TOKEN";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub store_path: Option<String>,
    #[serde(default)]
    pub compress_values: Option<bool>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub lock_duration_ms: Option<u64>,
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,
    #[serde(default)]
    pub catalog: Option<CatalogEntry>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CatalogEntry {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSettings {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub store_path: Utf8PathBuf,
    pub compress_values: bool,
    pub batch_size: usize,
    pub lock_duration: Duration,
    pub lock_timeout: Duration,
    pub catalog: Option<CatalogSettings>,
    pub deadline: Option<Duration>,
}

impl ResolvedConfig {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            compress_values: self.compress_values,
            page_size: self.batch_size,
        }
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            duration: self.lock_duration,
            timeout: self.lock_timeout,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            batch_size: self.batch_size,
            deadline: self.deadline,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(SyncError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    /// Like [`ConfigLoader::resolve`], but a missing default file yields the defaults.
    pub fn resolve_or_default(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        match Self::resolve(path) {
            Err(SyncError::MissingConfig) => Self::resolve_config(Config::default()),
            other => other,
        }
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SyncError> {
        let store_path = match config.store_path {
            Some(path) if !path.trim().is_empty() => Utf8PathBuf::from(path),
            _ => default_store_path()?,
        };

        let batch_size = config.batch_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        let lock_defaults = LockSettings::default();
        let lock_duration = config
            .lock_duration_ms
            .map(Duration::from_millis)
            .unwrap_or(lock_defaults.duration);
        let lock_timeout = config
            .lock_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(lock_defaults.timeout);
        if lock_duration.is_zero() {
            return Err(SyncError::InvalidConfig(
                "lock_duration_ms must be greater than 0".to_string(),
            ));
        }

        let env_token = env::var(TOKEN_ENV).ok().filter(|token| !token.is_empty());
        let catalog = config
            .catalog
            .and_then(|entry| {
                let token = env_token.clone().or(entry.token);
                entry
                    .base_url
                    .filter(|url| !url.trim().is_empty())
                    .map(|base_url| CatalogSettings { base_url, token })
            });

        Ok(ResolvedConfig {
            store_path,
            compress_values: config.compress_values.unwrap_or(true),
            batch_size,
            lock_duration,
            lock_timeout,
            catalog,
            deadline: config.deadline_secs.map(Duration::from_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert!(resolved.compress_values);
        assert_eq!(resolved.batch_size, DEFAULT_PAGE_SIZE);
        assert_eq!(resolved.lock_duration, Duration::from_millis(5000));
        assert_eq!(resolved.lock_timeout, Duration::from_millis(60000));
        assert!(resolved.catalog.is_none());
        assert!(resolved.deadline.is_none());
        assert!(resolved.store_path.ends_with("metadata.redb"));
    }

    #[test]
    fn parse_full_config() {
        let config: Config = serde_json::from_str(
            r#"{
                "store_path": "/data/meta.redb",
                "compress_values": false,
                "batch_size": 50,
                "lock_timeout_ms": 1000,
                "catalog": { "base_url": "https://catalog.example.org/api/" },
                "deadline_secs": 30
            }"#,
        )
        .unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.store_path, Utf8PathBuf::from("/data/meta.redb"));
        assert!(!resolved.store_options().compress_values);
        assert_eq!(resolved.sync_options().batch_size, 50);
        assert_eq!(resolved.sync_options().deadline, Some(Duration::from_secs(30)));
        assert_eq!(resolved.lock_settings().timeout, Duration::from_millis(1000));
        assert_eq!(
            resolved.catalog.map(|catalog| catalog.base_url),
            Some("https://catalog.example.org/api/".to_string())
        );
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = Config {
            batch_size: Some(0),
            ..Config::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(SyncError::InvalidConfig(_))
        );
    }

    #[test]
    fn unreadable_explicit_path_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("missing.json");
        assert_matches!(
            ConfigLoader::resolve(path.to_str()),
            Err(SyncError::ConfigRead(_))
        );
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("vcsync.json");
        fs::write(&path, "{ not json").unwrap();
        assert_matches!(
            ConfigLoader::resolve(path.to_str()),
            Err(SyncError::ConfigParse(_))
        );
    }
}
