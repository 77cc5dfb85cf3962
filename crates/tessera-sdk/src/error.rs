use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("store error: {0}")]
    Store(#[from] tessera_store::StoreError),

    #[error("pubsub error: {0}")]
    PubSub(#[from] tessera_pubsub::PubSubError),

    #[error("cache error: {0}")]
    Cache(#[from] tessera_cache::CacheError),

    #[error("session already finished")]
    SessionClosed,
}

impl SdkError {
    /// True when retrying the whole unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SdkError::Store(e) if e.is_retryable())
    }
}

pub type SdkResult<T> = Result<T, SdkError>;
