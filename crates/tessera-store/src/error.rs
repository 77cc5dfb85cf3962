use std::time::Duration;

use tessera_types::{Oid, Tid, TypeError};

/// Errors from object store operations.
///
/// The three conflict kinds are deliberately distinct: callers decide
/// whether to retry the whole transaction based on [`StoreError::is_retryable`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object was not found.
    #[error("object not found: {0}")]
    NotFound(Oid),

    /// The stored TID no longer matches the TID the writer observed.
    #[error("tid conflict on {oid}: expected {expected}")]
    TidConflict { oid: Oid, expected: Tid },

    /// Another live record already uses this name under the same parent.
    #[error("container identity conflict: {id:?} already exists in {parent_id:?}")]
    ContainerIdentityConflict {
        parent_id: Option<Oid>,
        id: Option<String>,
    },

    /// The write referenced a parent (or annotated object) that does not
    /// exist, usually because a stale cache entry was used.
    #[error("dangling reference writing {oid}: {reason}")]
    DanglingReference { oid: Oid, reason: String },

    /// Transient conflict: busy database, stale snapshot, or conflicting
    /// writes found during commit validation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend connection was lost; the pool has been (or is being)
    /// rebuilt and the transaction should be retried.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No pooled connection became available in time.
    #[error("timed out after {0:?} acquiring a connection")]
    Timeout(Duration),

    /// A record may not be its own parent.
    #[error("object {0} cannot be its own parent")]
    SelfParent(Oid),

    /// The trash sentinel cannot be written, deleted or used as a parent.
    #[error("object {0} is reserved for the trash")]
    ReservedOid(Oid),

    /// Writes attempted on a read-only storage or transaction.
    #[error("store is read-only")]
    ReadOnly,

    /// The transaction was already committed or aborted.
    #[error("transaction is no longer active")]
    TransactionClosed,

    /// The connection manager has not been initialized (or was closed).
    #[error("storage is not initialized")]
    NotInitialized,

    /// The vacuum worker is shutting down and accepts no more work.
    #[error("vacuum worker is closing down")]
    VacuumClosed,

    /// Invalid storage configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Malformed identifier read from or passed to the store.
    #[error("type error: {0}")]
    Type(#[from] TypeError),

    /// Any other backend error.
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Returns `true` for errors that are resolved by retrying the whole
    /// transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TidConflict { .. }
                | Self::DanglingReference { .. }
                | Self::Conflict(_)
                | Self::ConnectionLost(_)
        )
    }

    /// Returns `true` for any of the conflict kinds.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::TidConflict { .. }
                | Self::ContainerIdentityConflict { .. }
                | Self::DanglingReference { .. }
                | Self::Conflict(_)
        )
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn oid() -> Oid {
        Oid::new("doc1").unwrap()
    }

    #[test]
    fn retryable_classification() {
        assert!(StoreError::TidConflict { oid: oid(), expected: Tid::new(1) }.is_retryable());
        assert!(StoreError::DanglingReference { oid: oid(), reason: "x".into() }.is_retryable());
        assert!(StoreError::ConnectionLost("closed".into()).is_retryable());
        assert!(StoreError::Conflict("busy".into()).is_retryable());

        let identity = StoreError::ContainerIdentityConflict { parent_id: None, id: None };
        assert!(!identity.is_retryable());
        assert!(identity.is_conflict());

        assert!(!StoreError::NotFound(oid()).is_retryable());
        assert!(!StoreError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!StoreError::ReadOnly.is_conflict());
    }

    #[test]
    fn display_messages() {
        let err = StoreError::TidConflict { oid: oid(), expected: Tid::new(7) };
        assert_eq!(err.to_string(), "tid conflict on doc1: expected 7");
        assert_eq!(StoreError::NotFound(oid()).to_string(), "object not found: doc1");
        assert!(!StoreError::ReservedOid(Oid::trashed()).is_retryable());
    }
}
