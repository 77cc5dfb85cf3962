//! Embedding API for Tessera.
//!
//! [`Runtime::start`] turns a [`TesseraConfig`] into a running store, cache
//! and invalidation bus, resolving pluggable drivers through a
//! [`DriverRegistry`]. Application code works through [`Session`]s, which
//! add read-through caching and commit-time invalidation on top of a store
//! transaction.

pub mod config;
pub mod error;
pub mod registry;
pub mod runtime;
pub mod session;

pub use config::{PubSubSettings, TesseraConfig};
pub use error::{SdkError, SdkResult};
pub use registry::{CacheDriverFactory, DriverRegistry, PubSubDriverFactory, MEMORY_DRIVER};
pub use runtime::Runtime;
pub use session::Session;

// Re-export key types
pub use tessera_cache::{CacheLayer, CacheSettings, CacheStats};
pub use tessera_store::{ObjectStore, StorageConfig, StoreError, Transaction};
pub use tessera_types::{ObjectRecord, ObjectWriter, Oid, Tid, WriteRequest};
