//! SQL statements, formatted once per table pair.
//!
//! We never use row locks (`FOR UPDATE`); concurrent writers are resolved
//! by the optimistic TID check on update instead.

use tessera_types::{STUB_TYPE, TRASHED_ID, TRASH_TYPE};

/// Columns of the object table in the order every full-row query selects them.
pub const OBJECT_COLUMNS: &str =
    r#"zoid, tid, state_size, part, resource, "of", otid, parent_id, id, type, json, state"#;

/// Name of the sequence table the TIDs are drawn from.
pub const TID_SEQUENCE_TABLE: &str = "tid_sequence";

/// Every statement used against one object table and its blob table.
#[derive(Clone, Debug)]
pub struct Statements {
    pub objects_table: String,
    pub blobs_table: String,

    pub get_oid: String,
    pub has_object: String,
    pub get_child: String,
    pub get_children_batch_prefix: String,
    pub get_children: String,
    pub get_children_keys: String,
    pub batched_get_children_keys: String,
    pub exist_child: String,
    pub num_children: String,
    pub get_annotation: String,
    pub get_annotations_keys: String,

    pub naive_upsert: String,
    pub update: String,
    pub trash_parent_id: String,
    pub delete_object: String,
    pub get_trashed_objects: String,
    pub create_trash: String,
    pub insert_stub: String,

    pub insert_blob_chunk: String,
    pub read_blob_chunk: String,
    pub read_blob_chunks: String,
    pub delete_blob: String,

    pub txn_conflicts: String,
    pub txn_conflicts_on_oids_prefix: String,

    pub num_rows: String,
    pub num_resources: String,
    pub num_resources_by_type: String,
    pub resources_by_type: String,

    pub next_tid: String,
    pub max_tid: String,
    pub init_sequence: String,
}

impl Statements {
    pub fn new(objects_table: &str, blobs_table: &str) -> Self {
        let o = objects_table;
        let b = blobs_table;
        let seq = TID_SEQUENCE_TABLE;
        let cols = OBJECT_COLUMNS;

        Self {
            objects_table: o.to_string(),
            blobs_table: b.to_string(),

            get_oid: format!("SELECT {cols} FROM {o} WHERE zoid = ?1"),
            has_object: format!("SELECT zoid FROM {o} WHERE zoid = ?1"),
            get_child: format!("SELECT {cols} FROM {o} WHERE parent_id = ?1 AND id = ?2"),
            get_children_batch_prefix: format!("SELECT {cols} FROM {o} WHERE parent_id = "),
            get_children: format!("SELECT {cols} FROM {o} WHERE parent_id = ?1 ORDER BY id"),
            get_children_keys: format!("SELECT id FROM {o} WHERE parent_id = ?1 ORDER BY id"),
            batched_get_children_keys: format!(
                "SELECT id FROM {o} WHERE parent_id = ?1 ORDER BY zoid LIMIT ?2 OFFSET ?3"
            ),
            exist_child: format!("SELECT zoid FROM {o} WHERE parent_id = ?1 AND id = ?2"),
            num_children: format!("SELECT count(*) FROM {o} WHERE parent_id = ?1"),
            get_annotation: format!(r#"SELECT {cols} FROM {o} WHERE "of" = ?1 AND id = ?2"#),
            get_annotations_keys: format!(r#"SELECT id, parent_id FROM {o} WHERE "of" = ?1 ORDER BY id"#),

            naive_upsert: format!(
                r#"INSERT INTO {o} ({cols})
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT (zoid) DO UPDATE SET
    tid = excluded.tid,
    state_size = excluded.state_size,
    part = excluded.part,
    resource = excluded.resource,
    "of" = excluded."of",
    otid = excluded.otid,
    parent_id = excluded.parent_id,
    id = excluded.id,
    type = excluded.type,
    json = excluded.json,
    state = excluded.state"#
            ),
            update: format!(
                r#"UPDATE {o} SET
    tid = ?2,
    state_size = ?3,
    part = ?4,
    resource = ?5,
    "of" = ?6,
    otid = ?7,
    parent_id = ?8,
    id = ?9,
    type = ?10,
    json = ?11,
    state = ?12
WHERE zoid = ?1 AND tid = ?7"#
            ),
            trash_parent_id: format!("UPDATE {o} SET parent_id = '{TRASHED_ID}' WHERE zoid = ?1"),
            delete_object: delete_object_sql(o),
            get_trashed_objects: format!("SELECT zoid FROM {o} WHERE parent_id = '{TRASHED_ID}'"),
            create_trash: format!(
                "INSERT OR IGNORE INTO {o} (zoid, tid, state_size, part, resource, type)
VALUES ('{TRASHED_ID}', 0, 0, 0, 0, '{TRASH_TYPE}')"
            ),
            insert_stub: format!(
                "INSERT INTO {o} (zoid, tid, state_size, part, resource, type)
VALUES (?1, -1, 0, 0, 1, '{STUB_TYPE}')"
            ),

            insert_blob_chunk: format!(
                "INSERT INTO {b} (bid, zoid, chunk_index, data) VALUES (?1, ?2, ?3, ?4)"
            ),
            read_blob_chunk: format!(
                "SELECT bid, zoid, chunk_index, data FROM {b} WHERE bid = ?1 AND chunk_index = ?2"
            ),
            read_blob_chunks: format!(
                "SELECT bid, zoid, chunk_index, data FROM {b} WHERE bid = ?1 ORDER BY chunk_index"
            ),
            delete_blob: format!("DELETE FROM {b} WHERE bid = ?1"),

            txn_conflicts: format!(
                "SELECT zoid, tid, state_size, resource, type, id FROM {o} WHERE tid > ?1"
            ),
            txn_conflicts_on_oids_prefix: format!(
                "SELECT zoid, tid, state_size, resource, type, id FROM {o} WHERE tid > "
            ),

            num_rows: format!("SELECT count(*) FROM {o}"),
            num_resources: format!("SELECT count(*) FROM {o} WHERE resource = 1"),
            num_resources_by_type: format!("SELECT count(*) FROM {o} WHERE type = ?1"),
            resources_by_type: format!(
                "SELECT {cols} FROM {o} WHERE type = ?1 ORDER BY zoid LIMIT ?2 OFFSET ?3"
            ),

            next_tid: format!(
                "UPDATE {seq} SET last_value = last_value + 1 WHERE name = 'tid' RETURNING last_value"
            ),
            max_tid: format!("SELECT last_value FROM {seq} WHERE name = 'tid'"),
            init_sequence: format!("INSERT OR IGNORE INTO {seq} (name, last_value) VALUES ('tid', 0)"),
        }
    }

    /// Schema creation statements, safe to run repeatedly.
    pub fn create_statements(&self) -> Vec<String> {
        let o = &self.objects_table;
        let b = &self.blobs_table;
        let oi = index_prefix(o, "objects", "object");
        let bi = index_prefix(b, "blobs", "blob");
        let seq = TID_SEQUENCE_TABLE;
        vec![
            format!(
                r#"CREATE TABLE IF NOT EXISTS {o} (
    zoid VARCHAR(64) NOT NULL PRIMARY KEY,
    tid BIGINT NOT NULL,
    state_size BIGINT NOT NULL,
    part BIGINT NOT NULL,
    resource BOOLEAN NOT NULL,
    "of" VARCHAR(64) REFERENCES {o} (zoid) ON DELETE CASCADE,
    otid BIGINT,
    parent_id VARCHAR(64) REFERENCES {o} (zoid) ON DELETE CASCADE,
    id TEXT,
    type TEXT NOT NULL,
    json TEXT,
    state BLOB,
    CHECK (parent_id IS NULL OR parent_id != zoid)
)"#
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {b} (
    bid VARCHAR(64) NOT NULL,
    zoid VARCHAR(64) NOT NULL REFERENCES {o} (zoid) ON DELETE CASCADE,
    chunk_index INT NOT NULL,
    data BLOB,
    PRIMARY KEY (bid, zoid, chunk_index)
)"
            ),
            format!("CREATE INDEX IF NOT EXISTS {oi}_tid ON {o} (tid)"),
            format!(r#"CREATE INDEX IF NOT EXISTS {oi}_of ON {o} ("of")"#),
            format!("CREATE INDEX IF NOT EXISTS {oi}_part ON {o} (part)"),
            format!("CREATE INDEX IF NOT EXISTS {oi}_parent ON {o} (parent_id)"),
            format!("CREATE INDEX IF NOT EXISTS {oi}_id ON {o} (id)"),
            format!("CREATE INDEX IF NOT EXISTS {oi}_type ON {o} (type)"),
            format!("CREATE INDEX IF NOT EXISTS {bi}_bid ON {b} (bid)"),
            format!("CREATE INDEX IF NOT EXISTS {bi}_zoid ON {b} (zoid)"),
            format!("CREATE INDEX IF NOT EXISTS {bi}_chunk ON {b} (chunk_index)"),
            self.unique_constraint(),
            format!(
                "CREATE TABLE IF NOT EXISTS {seq} (name TEXT NOT NULL PRIMARY KEY, last_value BIGINT NOT NULL)"
            ),
        ]
    }

    /// Name of the partial unique index over `(parent_id, id)`.
    pub fn unique_constraint_name(&self) -> String {
        format!("{}_parent_id_id_key", self.objects_table)
    }

    fn unique_constraint(&self) -> String {
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} (parent_id, id) WHERE parent_id != '{TRASHED_ID}'",
            self.unique_constraint_name(),
            self.objects_table
        )
    }

    /// Statements dropping both tables.
    pub fn drop_statements(&self) -> Vec<String> {
        vec![
            format!("DROP TABLE IF EXISTS {}", self.blobs_table),
            format!("DROP TABLE IF EXISTS {}", self.objects_table),
        ]
    }
}

/// Physical delete of one row; cascades to children, annotations and blobs.
pub fn delete_object_sql(objects_table: &str) -> String {
    format!("DELETE FROM {objects_table} WHERE zoid = ?1")
}

/// Singular index-name prefix for the default table names.
fn index_prefix(table: &str, default: &str, singular: &str) -> String {
    if table == default {
        singular.to_string()
    } else {
        table.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_use_table_names() {
        let s = Statements::new("objs", "chunks");
        assert!(s.get_oid.contains("FROM objs"));
        assert!(s.insert_blob_chunk.contains("INTO chunks"));
        assert_eq!(s.delete_object, "DELETE FROM objs WHERE zoid = ?1");
    }

    #[test]
    fn update_is_guarded_by_expected_tid() {
        let s = Statements::new("objects", "blobs");
        assert!(s.update.ends_with("WHERE zoid = ?1 AND tid = ?7"));
        assert!(s.naive_upsert.contains("ON CONFLICT (zoid)"));
    }

    #[test]
    fn index_names_are_singular_for_default_tables() {
        let s = Statements::new("objects", "blobs");
        let create = s.create_statements().join("\n");
        assert!(create.contains("object_tid ON objects"));
        assert!(create.contains("blob_bid ON blobs"));
        assert!(create.contains("objects_parent_id_id_key"));
        assert!(create.contains(TRASHED_ID));

        let custom = Statements::new("objs", "bl").create_statements().join("\n");
        assert!(custom.contains("objs_tid ON objs"));
    }

    #[test]
    fn trash_statements_reference_sentinel() {
        let s = Statements::new("objects", "blobs");
        assert!(s.trash_parent_id.contains(TRASHED_ID));
        assert!(s.get_trashed_objects.contains(TRASHED_ID));
        assert!(s.create_trash.contains(TRASH_TYPE));
    }
}
