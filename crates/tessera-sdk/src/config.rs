use std::path::Path;

use serde::{Deserialize, Serialize};
use tessera_cache::CacheSettings;
use tessera_store::StorageConfig;

use crate::error::{SdkError, SdkResult};

/// `[pubsub]` section.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubSettings {
    /// Registry key of the pubsub driver; `None` disables the bus.
    pub driver: Option<String>,
}

/// Top-level configuration file.
///
/// ```toml
/// [storage]
/// name = "db"
/// dsn = "sqlite://data/tessera.db?mode=rwc"
///
/// [cache]
/// memory_cache_size = 209715200
/// updates_channel = "tessera-invalidations"
/// driver = "memory"
///
/// [pubsub]
/// driver = "memory"
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub storage: StorageConfig,
    pub cache: CacheSettings,
    pub pubsub: PubSubSettings,
}

impl TesseraConfig {
    pub fn from_toml_str(raw: &str) -> SdkResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> SdkResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SdkError::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> SdkResult<String> {
        toml::to_string_pretty(self).map_err(|e| SdkError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = TesseraConfig::from_toml_str("").unwrap();
        assert_eq!(config.storage.pool_size, 13);
        assert_eq!(config.storage.objects_table_name, "objects");
        assert!(config.storage.autovacuum);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.cache.updates_channel, None);
        assert_eq!(config.pubsub.driver, None);
    }

    #[test]
    fn sections_override_fields() {
        let config = TesseraConfig::from_toml_str(
            r#"
            [storage]
            name = "main"
            dsn = "sqlite://main.db"
            autovacuum = false

            [cache]
            memory_cache_size = 1024
            updates_channel = "inval"

            [pubsub]
            driver = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.name, "main");
        assert!(!config.storage.autovacuum);
        assert_eq!(config.storage.pool_size, 13);
        assert_eq!(config.cache.memory_cache_size, 1024);
        assert_eq!(config.cache.updates_channel.as_deref(), Some("inval"));
        assert_eq!(config.pubsub.driver.as_deref(), Some("memory"));
    }

    #[test]
    fn bad_toml_is_reported() {
        assert!(matches!(
            TesseraConfig::from_toml_str("[storage\n"),
            Err(SdkError::ConfigParse(_))
        ));
        assert!(matches!(
            TesseraConfig::from_toml_str("[storage]\npool_size = \"many\""),
            Err(SdkError::ConfigParse(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.toml");
        let written = TesseraConfig::default().to_toml_string().unwrap();
        std::fs::write(&path, written).unwrap();
        let config = TesseraConfig::load(&path).unwrap();
        assert_eq!(config.storage.name, "db");

        assert!(matches!(
            TesseraConfig::load(dir.path().join("missing.toml")),
            Err(SdkError::ConfigIo { .. })
        ));
    }
}
