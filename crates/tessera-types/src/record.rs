use serde::{Deserialize, Serialize};

use crate::oid::{Oid, Tid};

/// A row of the object table.
///
/// `state` is opaque to the store: it is whatever the writer serialized.
/// `state_size` is recorded at write time and is what the cache uses for
/// size accounting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub oid: Oid,
    pub tid: Tid,
    pub state_size: i64,
    pub part: i64,
    pub resource: bool,
    /// OID of the record this one annotates, if it is an annotation.
    pub of: Option<Oid>,
    /// TID the writer expected when this version was stored.
    pub otid: Option<Tid>,
    pub parent_id: Option<Oid>,
    /// Name of the record under `parent_id`; unique among live siblings.
    pub id: Option<String>,
    pub type_name: String,
    pub json: Option<serde_json::Value>,
    pub state: Vec<u8>,
}

impl ObjectRecord {
    /// Returns `true` if the record has been re-parented under the trash
    /// sentinel and is waiting to be vacuumed.
    pub fn is_trashed(&self) -> bool {
        self.parent_id.as_ref().is_some_and(Oid::is_trashed)
    }

    /// Returns `true` for stub rows created by blob uploads that arrived
    /// before their owning object was stored.
    pub fn is_stub(&self) -> bool {
        self.tid == Tid::STUB && self.type_name == STUB_TYPE
    }
}

/// Type tag written on stub records.
pub const STUB_TYPE: &str = "stub";

/// Type tag of the trash sentinel row.
pub const TRASH_TYPE: &str = "TRASH_REF";

/// Key of an annotation record attached to another object via `of`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationKey {
    pub id: String,
    pub parent_id: Option<Oid>,
}

/// Summary row returned by conflict detection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub oid: Oid,
    pub tid: Tid,
    pub state_size: i64,
    pub resource: bool,
    pub type_name: String,
    pub id: Option<String>,
}

/// One chunk of a binary large object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobChunk {
    pub blob_id: String,
    pub oid: Oid,
    pub chunk_index: i32,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(parent: Option<&str>) -> ObjectRecord {
        ObjectRecord {
            oid: Oid::new("doc1").unwrap(),
            tid: Tid::new(1),
            state_size: 3,
            part: 0,
            resource: true,
            of: None,
            otid: None,
            parent_id: parent.map(|p| Oid::new(p).unwrap()),
            id: Some("doc1".into()),
            type_name: "Item".into(),
            json: None,
            state: b"abc".to_vec(),
        }
    }

    #[test]
    fn trashed_detection() {
        assert!(!record(Some("root")).is_trashed());
        assert!(!record(None).is_trashed());
        assert!(record(Some(crate::TRASHED_ID)).is_trashed());
    }

    #[test]
    fn stub_detection() {
        let mut r = record(None);
        assert!(!r.is_stub());
        r.tid = Tid::STUB;
        r.type_name = STUB_TYPE.into();
        assert!(r.is_stub());
    }
}
