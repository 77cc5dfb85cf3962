//! Error classification and the reconnect policy.
//!
//! Every backend call made by the store passes its `sqlx` error through a
//! [`RecoveryPolicy`]. Connection-class errors trigger a rate-limited pool
//! restart and surface as [`StoreError::ConnectionLost`]; everything else is
//! translated into the matching typed error.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::StoreError;

/// Coarse classification of a backend error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The connection (or the whole pool) is gone.
    Connection,
    /// No pooled connection became available in time.
    PoolTimeout,
    /// The database was locked or the read snapshot went stale.
    Busy,
    UniqueViolation,
    ForeignKeyViolation,
    CheckViolation,
    Other,
}

/// Classifier signature accepted by [`RecoveryPolicy`].
pub type Classifier = fn(&sqlx::Error) -> ErrorClass;

/// SQLite primary result codes for `SQLITE_BUSY` and `SQLITE_LOCKED`.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// Default classifier for SQLite errors.
pub fn classify(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_) => ErrorClass::Connection,
        sqlx::Error::PoolTimedOut => ErrorClass::PoolTimeout,
        sqlx::Error::Database(db) => {
            if db.code().as_deref().is_some_and(is_busy_code) {
                return ErrorClass::Busy;
            }
            match db.kind() {
                sqlx::error::ErrorKind::UniqueViolation => ErrorClass::UniqueViolation,
                sqlx::error::ErrorKind::ForeignKeyViolation => ErrorClass::ForeignKeyViolation,
                sqlx::error::ErrorKind::CheckViolation => ErrorClass::CheckViolation,
                _ => ErrorClass::Other,
            }
        }
        _ => ErrorClass::Other,
    }
}

/// Returns `true` for SQLite busy/locked result codes, including the
/// extended forms such as `SQLITE_BUSY_SNAPSHOT` (517).
pub fn is_busy_code(code: &str) -> bool {
    code.parse::<i64>()
        .map(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false)
}

/// Translates a backend error that needs no further context.
///
/// Callers that can attribute constraint violations to a specific write
/// (see the store's `store` operation) handle those classes themselves
/// before falling back to this.
pub fn translate(err: sqlx::Error, class: ErrorClass, acquire_timeout: Duration) -> StoreError {
    match class {
        ErrorClass::Connection => StoreError::ConnectionLost(err.to_string()),
        ErrorClass::PoolTimeout => StoreError::Timeout(acquire_timeout),
        ErrorClass::Busy => StoreError::Conflict(err.to_string()),
        ErrorClass::UniqueViolation => StoreError::ContainerIdentityConflict {
            parent_id: None,
            id: None,
        },
        _ => match err {
            sqlx::Error::Configuration(e) => StoreError::Configuration(e.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Serialization(err.to_string())
            }
            other => StoreError::Database(other.to_string()),
        },
    }
}

/// Decides when a detected connection loss may restart the pool.
pub struct RecoveryPolicy {
    classifier: Classifier,
    reconnect_delay: Duration,
    last_connect: Mutex<Instant>,
}

impl RecoveryPolicy {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            classifier: classify,
            reconnect_delay,
            last_connect: Mutex::new(Instant::now()),
        }
    }

    /// Replace the error classifier.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn classify(&self, err: &sqlx::Error) -> ErrorClass {
        (self.classifier)(err)
    }

    /// Record a successful (re)connect.
    pub fn mark_connected(&self) {
        *self.last_connect.lock() = Instant::now();
    }

    /// Claims the right to restart the pool.
    ///
    /// Returns `false` while less than the reconnect delay has passed since
    /// the last successful connect, so a burst of failing calls restarts the
    /// pool at most once.
    pub fn try_begin_restart(&self) -> bool {
        let mut last = self.last_connect.lock();
        if last.elapsed() < self.reconnect_delay {
            return false;
        }
        *last = Instant::now();
        true
    }
}

impl std::fmt::Debug for RecoveryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryPolicy")
            .field("reconnect_delay", &self.reconnect_delay)
            .finish()
    }
}
