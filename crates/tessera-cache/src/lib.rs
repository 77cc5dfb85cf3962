//! Two-tier object cache for Tessera.
//!
//! A [`CacheLayer`] keeps a byte-bounded LRU in process and, optionally, a
//! shared remote tier behind a [`CacheDriver`]. Peers stay coherent through
//! the invalidation bus: each committed transaction publishes the keys it
//! made stale, plus freshly computed values to seed peers with.
//!
//! Cache failures are never fatal. Everything below [`CacheLayer`] is logged
//! and reported to callers as a miss.

pub mod driver;
pub mod error;
pub mod keys;
pub mod layer;
pub mod local;
pub mod memory;
pub mod value;

pub use driver::CacheDriver;
pub use error::{CacheError, CacheResult};
pub use keys::{CacheKeys, ChangeKind};
pub use layer::{
    CacheLayer, CacheSettings, CacheStats, MAX_IGNORED_TIDS, MAX_TRACKED_INVALIDATIONS,
};
pub use local::{LocalStats, MemoryCache, DEFAULT_MEMORY_SIZE};
pub use memory::InMemoryCacheDriver;
pub use value::{CacheValue, DEFAULT_WEIGHT};
