use tessera_types::{ObjectRecord, Oid};

/// What happened to a record inside a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Modified,
    Added,
    Deleted,
}

/// Derives cache keys of the form `<db>-<oid>[/<id>][-<variant>]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheKeys {
    db_id: String,
}

impl CacheKeys {
    pub fn new(db_id: impl Into<String>) -> Self {
        Self {
            db_id: db_id.into(),
        }
    }

    pub fn db_id(&self) -> &str {
        &self.db_id
    }

    pub fn object(&self, oid: &Oid) -> String {
        format!("{}-{}", self.db_id, oid.as_str())
    }

    pub fn child(&self, parent: &Oid, id: &str) -> String {
        format!("{}-{}/{}", self.db_id, parent.as_str(), id)
    }

    pub fn keys(&self, parent: &Oid) -> String {
        format!("{}-{}-keys", self.db_id, parent.as_str())
    }

    pub fn len(&self, parent: &Oid) -> String {
        format!("{}-{}-len", self.db_id, parent.as_str())
    }

    pub fn annotation(&self, of: &Oid, id: &str) -> String {
        format!("{}-{}/{}-annotation", self.db_id, of.as_str(), id)
    }

    pub fn annotation_keys(&self, of: &Oid) -> String {
        format!("{}-{}-annotation-keys", self.db_id, of.as_str())
    }

    /// Keys that go stale when `record` changes as `change`.
    ///
    /// Renames and moves are expressed by calling this for the old record
    /// with [`ChangeKind::Deleted`] and the new one with
    /// [`ChangeKind::Added`].
    pub fn keys_for(&self, record: &ObjectRecord, change: ChangeKind) -> Vec<String> {
        let mut keys = vec![self.object(&record.oid)];
        let membership = matches!(change, ChangeKind::Added | ChangeKind::Deleted);
        if let Some(of) = &record.of {
            if let Some(id) = &record.id {
                keys.push(self.annotation(of, id));
            }
            if membership {
                keys.push(self.annotation_keys(of));
            }
            return keys;
        }
        if let Some(parent) = &record.parent_id {
            if let Some(id) = &record.id {
                keys.push(self.child(parent, id));
            }
            if membership {
                keys.push(self.keys(parent));
                keys.push(self.len(parent));
            }
        }
        keys
    }
}
