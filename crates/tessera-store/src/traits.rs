use async_trait::async_trait;

use tessera_types::{AnnotationKey, BlobChunk, ConflictEntry, ObjectRecord, ObjectWriter, Oid, Tid};

use crate::error::StoreResult;
use crate::transaction::Transaction;

/// Transactional MVCC object store.
///
/// All implementations must satisfy these invariants:
/// - `(parent_id, id)` is unique among records that are not trashed.
/// - A record is never its own parent.
/// - An update only succeeds when the stored TID equals the writer's
///   expected TID; writes of new objects are unconditional.
/// - Deletion re-parents under the trash sentinel inside the caller's
///   transaction; the physical delete happens later, outside it.
/// - Hierarchical lookups never return trashed records.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Start a transaction. Writable transactions draw their TID here.
    async fn begin(&self, read_only: bool) -> StoreResult<Transaction>;

    /// Validate, commit and run the after-commit hooks.
    ///
    /// On failure the transaction is rolled back before the error is
    /// returned.
    async fn commit(&self, txn: &Transaction) -> StoreResult<()>;

    /// Roll back. A no-op on transactions that already finished.
    async fn abort(&self, txn: &Transaction) -> StoreResult<()>;

    /// Draw the next TID from the sequence.
    async fn get_next_tid(&self) -> StoreResult<Tid>;

    /// Peek the last TID handed out.
    async fn get_current_tid(&self) -> StoreResult<Tid>;

    /// Records written with a TID greater than this transaction's.
    ///
    /// Empty when the transaction modified nothing. Restricted to the
    /// modified OIDs when there are fewer than 1000 of them.
    async fn get_conflicts(&self, txn: &Transaction) -> StoreResult<Vec<ConflictEntry>>;

    /// Fetch a full record. Trashed records are reported as not found.
    async fn load(&self, txn: &Transaction, oid: &Oid) -> StoreResult<ObjectRecord>;

    /// Persist the writer's state under `oid` and return the new TID.
    ///
    /// `expected_tid` is `None` for new objects. The trash sentinel can be
    /// neither written nor used as a parent.
    async fn store(
        &self,
        txn: &Transaction,
        oid: &Oid,
        expected_tid: Option<Tid>,
        writer: &dyn ObjectWriter,
    ) -> StoreResult<Tid>;

    /// Move `oid` under the trash sentinel.
    async fn delete(&self, txn: &Transaction, oid: &Oid) -> StoreResult<()>;

    async fn get_child(
        &self,
        txn: &Transaction,
        parent: &Oid,
        id: &str,
    ) -> StoreResult<Option<ObjectRecord>>;

    /// Batch variant of [`ObjectStore::get_child`]; missing names are skipped.
    async fn get_children(
        &self,
        txn: &Transaction,
        parent: &Oid,
        ids: &[String],
    ) -> StoreResult<Vec<ObjectRecord>>;

    /// Every child of `parent`, ordered by name.
    async fn items(&self, txn: &Transaction, parent: &Oid) -> StoreResult<Vec<ObjectRecord>>;

    /// Names of every child of `parent`, ordered.
    async fn keys(&self, txn: &Transaction, parent: &Oid) -> StoreResult<Vec<String>>;

    /// One page of child names ordered by OID. Pages start at 1.
    async fn get_page_of_keys(
        &self,
        txn: &Transaction,
        parent: &Oid,
        page: u32,
        page_size: u32,
    ) -> StoreResult<Vec<String>>;

    /// Number of children of `parent`.
    async fn len(&self, txn: &Transaction, parent: &Oid) -> StoreResult<usize>;

    async fn contains(&self, txn: &Transaction, parent: &Oid, id: &str) -> StoreResult<bool>;

    async fn get_annotation(
        &self,
        txn: &Transaction,
        oid: &Oid,
        id: &str,
    ) -> StoreResult<Option<ObjectRecord>>;

    async fn get_annotation_keys(
        &self,
        txn: &Transaction,
        oid: &Oid,
    ) -> StoreResult<Vec<AnnotationKey>>;

    /// Write one chunk. A stub owner record is created when `oid` does not
    /// exist yet.
    async fn write_blob_chunk(
        &self,
        txn: &Transaction,
        blob_id: &str,
        oid: &Oid,
        chunk_index: i32,
        data: &[u8],
    ) -> StoreResult<()>;

    async fn read_blob_chunk(
        &self,
        txn: &Transaction,
        blob_id: &str,
        chunk_index: i32,
    ) -> StoreResult<Option<BlobChunk>>;

    /// Every chunk of a blob in index order.
    async fn read_blob_chunks(&self, txn: &Transaction, blob_id: &str) -> StoreResult<Vec<BlobChunk>>;

    async fn delete_blob(&self, txn: &Transaction, blob_id: &str) -> StoreResult<()>;

    /// The whole blob, chunks concatenated in index order.
    async fn read_blob(&self, txn: &Transaction, blob_id: &str) -> StoreResult<Vec<u8>> {
        let chunks = self.read_blob_chunks(txn, blob_id).await?;
        Ok(chunks.into_iter().flat_map(|c| c.data).collect())
    }

    /// OIDs currently parked under the trash sentinel (committed state).
    async fn get_trashed_objects(&self) -> StoreResult<Vec<Oid>>;

    /// Queue every trashed object for deletion and wait for the queue to
    /// drain. Returns the number of objects queued.
    async fn vacuum(&self) -> StoreResult<usize>;
}
