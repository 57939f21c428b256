//! CLI configuration.
//!
//! Layered: built-in defaults, then `hondana.toml` if present, then
//! `HONDANA_`-prefixed environment variables, then command-line flags.

use std::path::PathBuf;

use hondana_core::ByteUnit;
use hondana_kernel::{
    engine::EngineConfig,
    model::ProviderId,
    remote::provider::RemoteStoreConfig,
    rt::pool::PoolConfig,
};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "hondana.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub data_dir: Option<PathBuf>,
    pub pool: PoolSettings,
    pub providers: Vec<ProviderEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub max_workers: usize,
    pub memory_budget: ByteUnit,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            max_workers: 8,
            memory_budget: ByteUnit::from_mb(512),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    #[serde(flatten)]
    pub store: RemoteStoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: None,
            pool: PoolSettings::default(),
            providers: vec![
                ProviderEntry { id: "drive".into(), store: RemoteStoreConfig::Drive },
                ProviderEntry {
                    id: "webdav".into(),
                    store: RemoteStoreConfig::Dav { url: None, root: None },
                },
                ProviderEntry { id: "share".into(), store: RemoteStoreConfig::Share },
            ],
        }
    }
}

impl Config {
    /// Loads the layered configuration.
    pub fn load() -> Result<Self, String> {
        let mut config = Config::default();

        if let Ok(raw) = std::fs::read_to_string(CONFIG_FILE) {
            config = toml::from_str(&raw)
                .map_err(|err| format!("invalid {CONFIG_FILE}: {err}"))?;
        }

        if let Ok(dir) = std::env::var("HONDANA_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(workers) = std::env::var("HONDANA_MAX_WORKERS") {
            config.pool.max_workers = workers
                .parse()
                .map_err(|_| format!("invalid HONDANA_MAX_WORKERS: {workers}"))?;
        }
        if let Ok(budget) = std::env::var("HONDANA_MEMORY_BUDGET") {
            config.pool.memory_budget = budget
                .parse()
                .map_err(|err| format!("invalid HONDANA_MEMORY_BUDGET: {err}"))?;
        }

        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("dev", "hondana", "hondana")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".hondana"))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pool: PoolConfig {
                max_workers: self.pool.max_workers,
                memory_budget: self.pool.memory_budget,
            },
            providers: self
                .providers
                .iter()
                .map(|entry| (ProviderId::new(&entry.id), entry.store.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.providers.len(), 3);
        assert_eq!(config.pool.max_workers, 8);
    }

    #[test]
    fn test_toml_roundtrip() {
        let raw = r#"
            data_dir = "/tmp/hondana"

            [pool]
            max_workers = 4
            memory_budget = "256MB"

            [[providers]]
            id = "drive"
            kind = "drive"

            [[providers]]
            id = "nas"
            kind = "dav"
            url = "http://nas.local/dav/"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.pool.max_workers, 4);
        assert_eq!(config.pool.memory_budget, ByteUnit::from_mb(256));
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[1].id, "nas");
        match &config.providers[1].store {
            RemoteStoreConfig::Dav { url: Some(url), .. } => {
                assert_eq!(url.as_str(), "http://nas.local/dav/");
            }
            other => panic!("unexpected store config {other:?}"),
        }
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("nonsense = true").is_err());
    }
}
