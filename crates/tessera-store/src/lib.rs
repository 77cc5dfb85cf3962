//! Transactional object store for Tessera.
//!
//! Records live in one relational table keyed by OID and versioned by TID.
//! Writers use optimistic concurrency: an update only lands when the stored
//! TID still equals the TID the writer observed. Deletion is a cheap
//! re-parent under a trash sentinel; a background [`VacuumWorker`] removes
//! the rows later. Binary large objects are stored as ordered chunks.
//!
//! # Components
//!
//! - [`ConnectionManager`] -- pool, dedicated read connection, restart
//! - [`VacuumWorker`] -- single-consumer queue of physical deletes
//! - [`SqlObjectStore`] -- the [`ObjectStore`] over SQLite
//! - [`Transaction`] / [`TransactionManager`] -- unit of work and retry policy
//! - [`RecoveryPolicy`] -- error classification and rate-limited reconnect
//!
//! # Design Rules
//!
//! 1. Conflict kinds stay distinct; the transaction manager decides retries.
//! 2. A transaction's backend calls are serialized behind its own lock.
//! 3. Pool lifecycle changes are serialized; queries never wait on them.
//! 4. Vacuum never runs inside the deleting transaction.

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod recovery;
pub mod sql;
pub mod storage;
pub mod traits;
pub mod transaction;
pub mod vacuum;

pub use config::{StorageConfig, MIN_POOL_SIZE};
pub use connection::{ConnectionManager, SharedPool};
pub use error::{StoreError, StoreResult};
pub use manager::{RetryPolicy, TransactionManager};
pub use recovery::{classify, ErrorClass, RecoveryPolicy};
pub use storage::SqlObjectStore;
pub use traits::ObjectStore;
pub use transaction::{AfterCommitHook, Transaction, TxnStatus};
pub use vacuum::{VacuumItem, VacuumWorker};
