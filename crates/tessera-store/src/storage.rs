use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tokio::sync::MappedMutexGuard;
use tracing::{debug, error, info};

use tessera_types::{
    AnnotationKey, BlobChunk, ConflictEntry, ObjectRecord, ObjectWriter, Oid, Tid, TRASHED_ID,
};

use crate::config::StorageConfig;
use crate::connection::ConnectionManager;
use crate::error::{StoreError, StoreResult};
use crate::recovery::{translate, ErrorClass, RecoveryPolicy};
use crate::sql::Statements;
use crate::traits::ObjectStore;
use crate::transaction::{Transaction, TxnStatus};

/// Conflict checks are restricted to the modified OIDs below this count.
pub const MAX_CONFLICT_OIDS: usize = 1000;

#[derive(sqlx::FromRow)]
struct ObjectRow {
    zoid: String,
    tid: i64,
    state_size: i64,
    part: i64,
    resource: bool,
    of: Option<String>,
    otid: Option<i64>,
    parent_id: Option<String>,
    id: Option<String>,
    #[sqlx(rename = "type")]
    type_name: String,
    json: Option<String>,
    state: Option<Vec<u8>>,
}

impl ObjectRow {
    fn into_record(self) -> StoreResult<ObjectRecord> {
        let json = match self.json {
            Some(raw) => Some(
                serde_json::from_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        Ok(ObjectRecord {
            oid: Oid::new(self.zoid)?,
            tid: Tid::new(self.tid),
            state_size: self.state_size,
            part: self.part,
            resource: self.resource,
            of: self.of.map(Oid::new).transpose()?,
            otid: self.otid.map(Tid::new),
            parent_id: self.parent_id.map(Oid::new).transpose()?,
            id: self.id,
            type_name: self.type_name,
            json,
            state: self.state.unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConflictRow {
    zoid: String,
    tid: i64,
    state_size: i64,
    resource: bool,
    #[sqlx(rename = "type")]
    type_name: String,
    id: Option<String>,
}

impl ConflictRow {
    fn into_entry(self) -> StoreResult<ConflictEntry> {
        Ok(ConflictEntry {
            oid: Oid::new(self.zoid)?,
            tid: Tid::new(self.tid),
            state_size: self.state_size,
            resource: self.resource,
            type_name: self.type_name,
            id: self.id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BlobRow {
    bid: String,
    zoid: String,
    chunk_index: i32,
    data: Option<Vec<u8>>,
}

impl BlobRow {
    fn into_chunk(self) -> StoreResult<BlobChunk> {
        Ok(BlobChunk {
            blob_id: self.bid,
            oid: Oid::new(self.zoid)?,
            chunk_index: self.chunk_index,
            data: self.data.unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct AnnotationRow {
    id: Option<String>,
    parent_id: Option<String>,
}

/// [`ObjectStore`] over one SQLite object table and its blob table.
pub struct SqlObjectStore {
    config: StorageConfig,
    sql: Statements,
    connections: ConnectionManager,
    recovery: RecoveryPolicy,
}

impl SqlObjectStore {
    /// Create a store; nothing is opened until [`SqlObjectStore::initialize`].
    pub fn new(config: StorageConfig) -> StoreResult<Self> {
        validate_table_name(&config.objects_table_name)?;
        validate_table_name(&config.blobs_table_name)?;
        Ok(Self {
            sql: Statements::new(&config.objects_table_name, &config.blobs_table_name),
            connections: ConnectionManager::new(config.clone()),
            recovery: RecoveryPolicy::new(config.reconnect_delay()),
            config,
        })
    }

    /// Replace the recovery policy (e.g. to install a custom classifier).
    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn statements(&self) -> &Statements {
        &self.sql
    }

    /// Open the pool and the read connection, start the vacuum worker and
    /// create the schema unless the storage is read-only.
    pub async fn initialize(&self) -> StoreResult<()> {
        self.connections.initialize().await?;
        self.recovery.mark_connected();
        if !self.config.read_only {
            self.create().await?;
        }
        info!(
            name = %self.config.name,
            objects = %self.sql.objects_table,
            "storage initialized"
        );
        Ok(())
    }

    /// Create tables, indexes, the TID sequence and the trash row.
    /// Safe to run against an existing schema.
    pub async fn create(&self) -> StoreResult<()> {
        let pool = self.connections.pool()?;
        let result = async {
            let mut tx = pool.begin().await?;
            for statement in self.sql.create_statements() {
                sqlx::query(&statement).execute(&mut *tx).await?;
            }
            sqlx::query(&self.sql.init_sequence).execute(&mut *tx).await?;
            sqlx::query(&self.sql.create_trash).execute(&mut *tx).await?;
            tx.commit().await
        }
        .await;
        self.recover(result).await?;
        debug!(objects = %self.sql.objects_table, "schema ready");
        Ok(())
    }

    /// Drop both tables.
    pub async fn remove(&self) -> StoreResult<()> {
        let pool = self.connections.pool()?;
        let result = async {
            for statement in self.sql.drop_statements() {
                sqlx::query(&statement).execute(&pool).await?;
            }
            Ok::<_, sqlx::Error>(())
        }
        .await;
        self.recover(result).await
    }

    /// Drain pending vacuum work (bounded) and close every connection.
    pub async fn finalize(&self) -> StoreResult<()> {
        self.connections.close().await
    }

    /// Whether the partial unique index on `(parent_id, id)` exists.
    pub async fn has_unique_constraint(&self) -> StoreResult<bool> {
        let name = self.sql.unique_constraint_name();
        let mut conn = self.read_conn().await?;
        let result = sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?1",
        )
        .bind(&name)
        .fetch_optional(&mut *conn)
        .await;
        drop(conn);
        Ok(self.recover(result).await?.is_some())
    }

    /// Row count of the object table, trash sentinel and stubs included.
    pub async fn get_total_number_of_objects(&self, txn: &Transaction) -> StoreResult<u64> {
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_scalar::<_, i64>(&self.sql.num_rows)
            .fetch_one(&mut *conn)
            .await;
        drop(conn);
        Ok(to_count(self.recover(result).await?))
    }

    pub async fn get_total_number_of_resources(&self, txn: &Transaction) -> StoreResult<u64> {
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_scalar::<_, i64>(&self.sql.num_resources)
            .fetch_one(&mut *conn)
            .await;
        drop(conn);
        Ok(to_count(self.recover(result).await?))
    }

    pub async fn get_total_resources_of_type(
        &self,
        txn: &Transaction,
        type_name: &str,
    ) -> StoreResult<u64> {
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_scalar::<_, i64>(&self.sql.num_resources_by_type)
            .bind(type_name)
            .fetch_one(&mut *conn)
            .await;
        drop(conn);
        Ok(to_count(self.recover(result).await?))
    }

    /// One page of records of `type_name`, ordered by OID. Pages start at 1.
    pub async fn get_page_resources_of_type(
        &self,
        txn: &Transaction,
        type_name: &str,
        page: u32,
        page_size: u32,
    ) -> StoreResult<Vec<ObjectRecord>> {
        let (limit, offset) = page_bounds(page, page_size);
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_as::<_, ObjectRow>(&self.sql.resources_by_type)
            .bind(type_name)
            .bind(limit)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await;
        drop(conn);
        self.recover(result)
            .await?
            .into_iter()
            .map(ObjectRow::into_record)
            .collect()
    }

    async fn txn_conn<'t>(
        &self,
        txn: &'t Transaction,
    ) -> StoreResult<MappedMutexGuard<'t, SqliteConnection>> {
        txn.ensure_active()?;
        let conn = txn.conn().await;
        self.recover(conn).await
    }

    async fn read_conn(&self) -> StoreResult<MappedMutexGuard<'_, SqliteConnection>> {
        let conn = self.connections.read_conn().await;
        self.recover(conn).await
    }

    /// Run a backend result through the recovery policy. No connection guard
    /// may be held by the caller, since a restart needs them back.
    async fn recover<T>(&self, result: Result<T, sqlx::Error>) -> StoreResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => Err(self.handle_error(err).await),
        }
    }

    async fn handle_error(&self, err: sqlx::Error) -> StoreError {
        let class = self.recovery.classify(&err);
        if class == ErrorClass::Connection {
            error!(error = %err, "lost connection to the database");
            if self.recovery.try_begin_restart() {
                match self.connections.restart().await {
                    Ok(()) => self.recovery.mark_connected(),
                    Err(e) => error!(error = %e, "failed to restart connection pool"),
                }
            }
        }
        translate(err, class, self.config.conn_acquire_timeout())
    }

    /// Attribute a failed write to the record being written.
    async fn write_error(
        &self,
        err: sqlx::Error,
        oid: &Oid,
        writer: &dyn ObjectWriter,
    ) -> StoreError {
        match self.recovery.classify(&err) {
            ErrorClass::UniqueViolation if is_identity_violation(&err) => {
                debug!(oid = %oid, id = ?writer.id(), "container identity conflict");
                StoreError::ContainerIdentityConflict {
                    parent_id: writer.parent_id().cloned(),
                    id: writer.id().map(str::to_string),
                }
            }
            ErrorClass::ForeignKeyViolation => StoreError::DanglingReference {
                oid: oid.clone(),
                reason: err.to_string(),
            },
            ErrorClass::CheckViolation => StoreError::SelfParent(oid.clone()),
            _ => self.handle_error(err).await,
        }
    }

    fn ensure_writable(&self, txn: &Transaction) -> StoreResult<()> {
        if self.config.read_only || txn.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        txn.ensure_active()
    }

    /// Roll back after a failed commit and tell the hooks.
    async fn fail_commit(&self, txn: &Transaction, status: TxnStatus) {
        if let Err(e) = txn.rollback_db().await {
            debug!(error = %e, "rollback after failed commit");
        }
        txn.set_status(status);
        txn.run_hooks(false).await;
    }
}

#[async_trait]
impl ObjectStore for SqlObjectStore {
    async fn begin(&self, read_only: bool) -> StoreResult<Transaction> {
        let read_only = read_only || self.config.read_only;
        let tid = if read_only {
            None
        } else {
            Some(self.get_next_tid().await?)
        };
        let pool = self.connections.pool()?;
        debug!(tid = ?tid, read_only, "begin transaction");
        Ok(Transaction::new(pool, tid, read_only))
    }

    async fn commit(&self, txn: &Transaction) -> StoreResult<()> {
        txn.begin_commit()?;

        if !txn.modified().is_empty() {
            match self.get_conflicts(txn).await {
                Ok(conflicts) if !conflicts.is_empty() => {
                    let oids: Vec<String> = conflicts.iter().map(|c| c.oid.to_string()).collect();
                    self.fail_commit(txn, TxnStatus::Conflict).await;
                    return Err(StoreError::Conflict(format!(
                        "objects changed by a later transaction: {}",
                        oids.join(", ")
                    )));
                }
                Ok(_) => {}
                Err(e) => {
                    self.fail_commit(txn, TxnStatus::Aborted).await;
                    return Err(e);
                }
            }
        }

        let result = txn.commit_db().await;
        match self.recover(result).await {
            Ok(()) => {
                txn.set_status(TxnStatus::Committed);
                debug!(tid = ?txn.tid(), "committed");
                txn.run_hooks(true).await;
                Ok(())
            }
            Err(e) => {
                let status = if e.is_conflict() {
                    TxnStatus::Conflict
                } else {
                    TxnStatus::Aborted
                };
                self.fail_commit(txn, status).await;
                Err(e)
            }
        }
    }

    async fn abort(&self, txn: &Transaction) -> StoreResult<()> {
        if txn.status().is_finished() {
            return Ok(());
        }
        let result = txn.rollback_db().await;
        txn.set_status(TxnStatus::Aborted);
        txn.run_hooks(false).await;
        debug!(tid = ?txn.tid(), "aborted");
        self.recover(result).await
    }

    async fn get_next_tid(&self) -> StoreResult<Tid> {
        let mut conn = self.read_conn().await?;
        let result = sqlx::query_scalar::<_, i64>(&self.sql.next_tid)
            .fetch_one(&mut *conn)
            .await;
        drop(conn);
        Ok(Tid::new(self.recover(result).await?))
    }

    async fn get_current_tid(&self) -> StoreResult<Tid> {
        let mut conn = self.read_conn().await?;
        let result = sqlx::query_scalar::<_, i64>(&self.sql.max_tid)
            .fetch_optional(&mut *conn)
            .await;
        drop(conn);
        Ok(Tid::new(self.recover(result).await?.unwrap_or(0)))
    }

    async fn get_conflicts(&self, txn: &Transaction) -> StoreResult<Vec<ConflictEntry>> {
        let Some(tid) = txn.tid() else {
            return Ok(Vec::new());
        };
        let modified = txn.modified();
        if modified.is_empty() {
            return Ok(Vec::new());
        }
        let restricted = modified.len() < MAX_CONFLICT_OIDS;

        // Read on the dedicated connection: the transaction's own snapshot
        // cannot see rows committed after it started.
        let mut conn = self.read_conn().await?;
        let result = if restricted {
            let mut builder =
                QueryBuilder::<Sqlite>::new(self.sql.txn_conflicts_on_oids_prefix.as_str());
            builder.push_bind(tid.get());
            builder.push(" AND zoid IN (");
            let mut list = builder.separated(", ");
            for oid in modified {
                list.push_bind(oid.into_string());
            }
            list.push_unseparated(")");
            builder
                .build_query_as::<ConflictRow>()
                .fetch_all(&mut *conn)
                .await
        } else {
            sqlx::query_as::<_, ConflictRow>(&self.sql.txn_conflicts)
                .bind(tid.get())
                .fetch_all(&mut *conn)
                .await
        };
        drop(conn);
        self.recover(result)
            .await?
            .into_iter()
            .map(ConflictRow::into_entry)
            .collect()
    }

    async fn load(&self, txn: &Transaction, oid: &Oid) -> StoreResult<ObjectRecord> {
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_as::<_, ObjectRow>(&self.sql.get_oid)
            .bind(oid.as_str())
            .fetch_optional(&mut *conn)
            .await;
        drop(conn);
        match self.recover(result).await?.map(ObjectRow::into_record).transpose()? {
            Some(record) if !record.is_trashed() => Ok(record),
            _ => Err(StoreError::NotFound(oid.clone())),
        }
    }

    async fn store(
        &self,
        txn: &Transaction,
        oid: &Oid,
        expected_tid: Option<Tid>,
        writer: &dyn ObjectWriter,
    ) -> StoreResult<Tid> {
        self.ensure_writable(txn)?;
        let tid = txn.tid().ok_or(StoreError::ReadOnly)?;
        if writer.parent_id() == Some(oid) {
            return Err(StoreError::SelfParent(oid.clone()));
        }
        if oid.is_trashed() {
            return Err(StoreError::ReservedOid(oid.clone()));
        }
        if let Some(reserved) = [writer.parent_id(), writer.of()]
            .into_iter()
            .flatten()
            .find(|target| target.is_trashed())
        {
            return Err(StoreError::ReservedOid(reserved.clone()));
        }

        let state = writer.serialize();
        let state_size = i64::try_from(state.len())
            .map_err(|_| StoreError::Serialization(format!("state of {oid} is too large")))?;
        if state.len() >= self.config.large_record_size {
            info!(oid = %oid, size = state.len(), "storing large record");
        }
        let json = if self.config.store_json {
            writer.json().map(|value| value.to_string())
        } else {
            None
        };
        let statement = if expected_tid.is_some() {
            &self.sql.update
        } else {
            &self.sql.naive_upsert
        };

        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query(statement)
            .bind(oid.as_str())
            .bind(tid.get())
            .bind(state_size)
            .bind(writer.part().unwrap_or(0))
            .bind(writer.resource())
            .bind(writer.of().map(Oid::as_str))
            .bind(expected_tid.map(Tid::get))
            .bind(writer.parent_id().map(Oid::as_str))
            .bind(writer.id())
            .bind(writer.type_name())
            .bind(json)
            .bind(state)
            .execute(&mut *conn)
            .await;
        drop(conn);

        let done = match result {
            Ok(done) => done,
            Err(err) => return Err(self.write_error(err, oid, writer).await),
        };
        if let Some(expected) = expected_tid {
            if done.rows_affected() == 0 {
                debug!(oid = %oid, expected = %expected, "stale tid");
                return Err(StoreError::TidConflict {
                    oid: oid.clone(),
                    expected,
                });
            }
            txn.mark_modified(oid.clone());
        }
        Ok(tid)
    }

    async fn delete(&self, txn: &Transaction, oid: &Oid) -> StoreResult<()> {
        self.ensure_writable(txn)?;
        if oid.is_trashed() {
            return Err(StoreError::ReservedOid(oid.clone()));
        }
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query(&self.sql.trash_parent_id)
            .bind(oid.as_str())
            .execute(&mut *conn)
            .await;
        drop(conn);
        self.recover(result).await?;

        if self.config.autovacuum {
            let vacuum = self.connections.vacuum()?;
            let table = self.sql.objects_table.clone();
            let oid = oid.clone();
            txn.add_after_commit_hook(move |committed| async move {
                if !committed {
                    return;
                }
                if let Err(e) = vacuum.add_to_queue(oid.clone(), table) {
                    debug!(oid = %oid, error = %e, "could not queue vacuum");
                }
            });
        }
        Ok(())
    }

    async fn get_child(
        &self,
        txn: &Transaction,
        parent: &Oid,
        id: &str,
    ) -> StoreResult<Option<ObjectRecord>> {
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_as::<_, ObjectRow>(&self.sql.get_child)
            .bind(parent.as_str())
            .bind(id)
            .fetch_optional(&mut *conn)
            .await;
        drop(conn);
        self.recover(result)
            .await?
            .map(ObjectRow::into_record)
            .transpose()
    }

    async fn get_children(
        &self,
        txn: &Transaction,
        parent: &Oid,
        ids: &[String],
    ) -> StoreResult<Vec<ObjectRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(self.sql.get_children_batch_prefix.as_str());
        builder.push_bind(parent.as_str().to_string());
        builder.push(" AND id IN (");
        let mut list = builder.separated(", ");
        for id in ids {
            list.push_bind(id.clone());
        }
        list.push_unseparated(") ORDER BY id");

        let mut conn = self.txn_conn(txn).await?;
        let result = builder
            .build_query_as::<ObjectRow>()
            .fetch_all(&mut *conn)
            .await;
        drop(conn);
        self.recover(result)
            .await?
            .into_iter()
            .map(ObjectRow::into_record)
            .collect()
    }

    async fn items(&self, txn: &Transaction, parent: &Oid) -> StoreResult<Vec<ObjectRecord>> {
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_as::<_, ObjectRow>(&self.sql.get_children)
            .bind(parent.as_str())
            .fetch_all(&mut *conn)
            .await;
        drop(conn);
        self.recover(result)
            .await?
            .into_iter()
            .map(ObjectRow::into_record)
            .collect()
    }

    async fn keys(&self, txn: &Transaction, parent: &Oid) -> StoreResult<Vec<String>> {
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_scalar::<_, Option<String>>(&self.sql.get_children_keys)
            .bind(parent.as_str())
            .fetch_all(&mut *conn)
            .await;
        drop(conn);
        Ok(self.recover(result).await?.into_iter().flatten().collect())
    }

    async fn get_page_of_keys(
        &self,
        txn: &Transaction,
        parent: &Oid,
        page: u32,
        page_size: u32,
    ) -> StoreResult<Vec<String>> {
        let (limit, offset) = page_bounds(page, page_size);
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_scalar::<_, Option<String>>(&self.sql.batched_get_children_keys)
            .bind(parent.as_str())
            .bind(limit)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await;
        drop(conn);
        Ok(self.recover(result).await?.into_iter().flatten().collect())
    }

    async fn len(&self, txn: &Transaction, parent: &Oid) -> StoreResult<usize> {
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_scalar::<_, i64>(&self.sql.num_children)
            .bind(parent.as_str())
            .fetch_one(&mut *conn)
            .await;
        drop(conn);
        Ok(usize::try_from(self.recover(result).await?).unwrap_or_default())
    }

    async fn contains(&self, txn: &Transaction, parent: &Oid, id: &str) -> StoreResult<bool> {
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_scalar::<_, String>(&self.sql.exist_child)
            .bind(parent.as_str())
            .bind(id)
            .fetch_optional(&mut *conn)
            .await;
        drop(conn);
        Ok(self.recover(result).await?.is_some())
    }

    async fn get_annotation(
        &self,
        txn: &Transaction,
        oid: &Oid,
        id: &str,
    ) -> StoreResult<Option<ObjectRecord>> {
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_as::<_, ObjectRow>(&self.sql.get_annotation)
            .bind(oid.as_str())
            .bind(id)
            .fetch_all(&mut *conn)
            .await;
        drop(conn);
        for row in self.recover(result).await? {
            let record = row.into_record()?;
            if !record.is_trashed() {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn get_annotation_keys(
        &self,
        txn: &Transaction,
        oid: &Oid,
    ) -> StoreResult<Vec<AnnotationKey>> {
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_as::<_, AnnotationRow>(&self.sql.get_annotations_keys)
            .bind(oid.as_str())
            .fetch_all(&mut *conn)
            .await;
        drop(conn);
        let mut keys = Vec::new();
        for row in self.recover(result).await? {
            if row.parent_id.as_deref() == Some(TRASHED_ID) {
                continue;
            }
            let Some(id) = row.id else { continue };
            keys.push(AnnotationKey {
                id,
                parent_id: row.parent_id.map(Oid::new).transpose()?,
            });
        }
        Ok(keys)
    }

    async fn write_blob_chunk(
        &self,
        txn: &Transaction,
        blob_id: &str,
        oid: &Oid,
        chunk_index: i32,
        data: &[u8],
    ) -> StoreResult<()> {
        self.ensure_writable(txn)?;
        let mut conn = self.txn_conn(txn).await?;
        let result = async {
            let owner = sqlx::query_scalar::<_, String>(&self.sql.has_object)
                .bind(oid.as_str())
                .fetch_optional(&mut *conn)
                .await?;
            if owner.is_none() {
                sqlx::query(&self.sql.insert_stub)
                    .bind(oid.as_str())
                    .execute(&mut *conn)
                    .await?;
                debug!(oid = %oid, blob_id, "created stub owner for blob");
            }
            sqlx::query(&self.sql.insert_blob_chunk)
                .bind(blob_id)
                .bind(oid.as_str())
                .bind(chunk_index)
                .bind(data)
                .execute(&mut *conn)
                .await?;
            Ok::<_, sqlx::Error>(())
        }
        .await;
        drop(conn);
        self.recover(result).await
    }

    async fn read_blob_chunk(
        &self,
        txn: &Transaction,
        blob_id: &str,
        chunk_index: i32,
    ) -> StoreResult<Option<BlobChunk>> {
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_as::<_, BlobRow>(&self.sql.read_blob_chunk)
            .bind(blob_id)
            .bind(chunk_index)
            .fetch_optional(&mut *conn)
            .await;
        drop(conn);
        self.recover(result)
            .await?
            .map(BlobRow::into_chunk)
            .transpose()
    }

    async fn read_blob_chunks(&self, txn: &Transaction, blob_id: &str) -> StoreResult<Vec<BlobChunk>> {
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query_as::<_, BlobRow>(&self.sql.read_blob_chunks)
            .bind(blob_id)
            .fetch_all(&mut *conn)
            .await;
        drop(conn);
        self.recover(result)
            .await?
            .into_iter()
            .map(BlobRow::into_chunk)
            .collect()
    }

    async fn delete_blob(&self, txn: &Transaction, blob_id: &str) -> StoreResult<()> {
        self.ensure_writable(txn)?;
        let mut conn = self.txn_conn(txn).await?;
        let result = sqlx::query(&self.sql.delete_blob)
            .bind(blob_id)
            .execute(&mut *conn)
            .await;
        drop(conn);
        self.recover(result).await?;
        Ok(())
    }

    async fn get_trashed_objects(&self) -> StoreResult<Vec<Oid>> {
        let mut conn = self.read_conn().await?;
        let result = sqlx::query_scalar::<_, String>(&self.sql.get_trashed_objects)
            .fetch_all(&mut *conn)
            .await;
        drop(conn);
        self.recover(result)
            .await?
            .into_iter()
            .map(|oid| Oid::new(oid).map_err(StoreError::from))
            .collect()
    }

    async fn vacuum(&self) -> StoreResult<usize> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        let trashed = self.get_trashed_objects().await?;
        let worker = self.connections.vacuum()?;
        for oid in &trashed {
            worker.add_to_queue(oid.clone(), self.sql.objects_table.as_str())?;
        }
        worker.drain().await;
        info!(count = trashed.len(), "vacuum finished");
        Ok(trashed.len())
    }
}

fn is_identity_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("parent_id"))
}

fn validate_table_name(name: &str) -> StoreResult<()> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::Configuration(format!("invalid table name: {name:?}")))
    }
}

/// `(limit, offset)` for a 1-based page.
fn page_bounds(page: u32, page_size: u32) -> (i64, i64) {
    let limit = i64::from(page_size);
    (limit, i64::from(page.saturating_sub(1)) * limit)
}

fn to_count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or_default()
}
