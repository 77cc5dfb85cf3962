use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("object id must not be empty")]
    EmptyOid,

    #[error("object id too long: {length} bytes (max {max})")]
    OidTooLong { length: usize, max: usize },

    #[error("invalid transaction id: {0}")]
    InvalidTid(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
