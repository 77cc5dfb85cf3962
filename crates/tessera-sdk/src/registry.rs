use std::collections::HashMap;
use std::sync::Arc;

use tessera_cache::{CacheDriver, InMemoryCacheDriver};
use tessera_pubsub::{InMemoryBroker, PubSubDriver};

use crate::error::{SdkError, SdkResult};

/// Key of the built-in in-process drivers.
pub const MEMORY_DRIVER: &str = "memory";

pub type CacheDriverFactory = Arc<dyn Fn() -> SdkResult<Arc<dyn CacheDriver>> + Send + Sync>;
pub type PubSubDriverFactory = Arc<dyn Fn() -> SdkResult<Arc<dyn PubSubDriver>> + Send + Sync>;

/// Maps configuration keys to driver constructors.
///
/// Drivers are resolved once, when a [`Runtime`](crate::Runtime) starts.
/// The built-in `"memory"` drivers share one cache and one broker per
/// registry, so runtimes started from clones of the same registry behave
/// like separate processes talking to the same servers.
#[derive(Clone)]
pub struct DriverRegistry {
    cache: HashMap<String, CacheDriverFactory>,
    pubsub: HashMap<String, PubSubDriverFactory>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    /// Registry with the built-in drivers.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        let shared_cache = Arc::new(InMemoryCacheDriver::new());
        registry.register_cache_driver(MEMORY_DRIVER, move || {
            let driver: Arc<dyn CacheDriver> = shared_cache.clone();
            Ok(driver)
        });
        let broker = InMemoryBroker::new();
        registry.register_pubsub_driver(MEMORY_DRIVER, move || {
            let driver: Arc<dyn PubSubDriver> = Arc::new(broker.connect());
            Ok(driver)
        });
        registry
    }

    pub fn empty() -> Self {
        Self {
            cache: HashMap::new(),
            pubsub: HashMap::new(),
        }
    }

    pub fn register_cache_driver<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> SdkResult<Arc<dyn CacheDriver>> + Send + Sync + 'static,
    {
        self.cache.insert(key.into(), Arc::new(factory));
    }

    pub fn register_pubsub_driver<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> SdkResult<Arc<dyn PubSubDriver>> + Send + Sync + 'static,
    {
        self.pubsub.insert(key.into(), Arc::new(factory));
    }

    pub fn cache_driver(&self, key: &str) -> SdkResult<Arc<dyn CacheDriver>> {
        let factory = self
            .cache
            .get(key)
            .ok_or_else(|| SdkError::Configuration(format!("unknown cache driver: {key}")))?;
        factory()
    }

    pub fn pubsub_driver(&self, key: &str) -> SdkResult<Arc<dyn PubSubDriver>> {
        let factory = self
            .pubsub
            .get(key)
            .ok_or_else(|| SdkError::Configuration(format!("unknown pubsub driver: {key}")))?;
        factory()
    }

    pub fn cache_driver_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.cache.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn pubsub_driver_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.pubsub.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = DriverRegistry::new();
        assert_eq!(registry.cache_driver_keys(), vec![MEMORY_DRIVER]);
        assert_eq!(registry.pubsub_driver_keys(), vec![MEMORY_DRIVER]);
        assert!(registry.cache_driver(MEMORY_DRIVER).is_ok());
        assert!(registry.pubsub_driver(MEMORY_DRIVER).is_ok());
    }

    #[test]
    fn unknown_keys_are_configuration_errors() {
        let registry = DriverRegistry::empty();
        assert!(matches!(
            registry.cache_driver("redis"),
            Err(SdkError::Configuration(_))
        ));
        assert!(matches!(
            registry.pubsub_driver("redis"),
            Err(SdkError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn memory_cache_is_shared_across_clones() {
        let registry = DriverRegistry::new();
        let other = registry.clone();
        let a = registry.cache_driver(MEMORY_DRIVER).unwrap();
        let b = other.cache_driver(MEMORY_DRIVER).unwrap();
        a.set("k", b"v".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn custom_factories_can_fail() {
        let mut registry = DriverRegistry::empty();
        registry.register_cache_driver("broken", || {
            Err(SdkError::Configuration("no server".into()))
        });
        assert!(registry.cache_driver("broken").is_err());
    }
}
