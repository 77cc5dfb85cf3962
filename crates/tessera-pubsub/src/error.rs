/// Errors produced by the invalidation bus and its drivers.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// The payload is not a well-formed invalidation envelope.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The envelope was produced by an incompatible peer.
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u64),

    /// Encoding an outgoing envelope failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The driver has been finalized and cannot accept work.
    #[error("pubsub driver is closed")]
    Closed,

    /// Any other driver failure.
    #[error("driver error: {0}")]
    Driver(String),
}

/// Convenience alias used throughout the pubsub crate.
pub type PubSubResult<T> = std::result::Result<T, PubSubError>;
