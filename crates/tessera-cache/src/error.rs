/// Errors produced inside the cache.
///
/// [`CacheLayer`](crate::CacheLayer) logs these instead of returning them;
/// only construction and driver implementations surface them directly.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Invalid cache settings, fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A value could not be encoded for, or decoded from, the remote tier.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The remote driver failed.
    #[error("driver error: {0}")]
    Driver(String),

    /// The driver has been finalized.
    #[error("cache driver is closed")]
    Closed,
}

/// Convenience alias used throughout the cache crate.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
