use crate::oid::Oid;

/// Source of everything the store persists for one object.
///
/// The content model lives outside the store; it hands the store a writer
/// that knows how to serialize its state and where the object sits in the
/// hierarchy.
pub trait ObjectWriter: Send + Sync {
    /// Opaque serialized state.
    fn serialize(&self) -> Vec<u8>;

    /// Optional secondary JSON projection stored alongside the state.
    fn json(&self) -> Option<serde_json::Value> {
        None
    }

    /// Partition hint; `None` stores partition 0.
    fn part(&self) -> Option<i64> {
        None
    }

    fn resource(&self) -> bool;

    fn of(&self) -> Option<&Oid>;

    fn parent_id(&self) -> Option<&Oid>;

    fn id(&self) -> Option<&str>;

    fn type_name(&self) -> &str;
}

/// Plain-data [`ObjectWriter`] for callers that already hold serialized state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteRequest {
    pub state: Vec<u8>,
    pub json: Option<serde_json::Value>,
    pub part: Option<i64>,
    pub resource: bool,
    pub of: Option<Oid>,
    pub parent_id: Option<Oid>,
    pub id: Option<String>,
    pub type_name: String,
}

impl WriteRequest {
    /// A resource of `type_name` named `id` inside `parent`.
    pub fn child(parent: Oid, id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            resource: true,
            parent_id: Some(parent),
            id: Some(id.into()),
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    /// A top-level object with no parent (e.g. a database root).
    pub fn root(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            resource: true,
            id: Some(id.into()),
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    /// An annotation named `id` attached to `of`.
    pub fn annotation(of: Oid, id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            resource: false,
            of: Some(of),
            id: Some(id.into()),
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: impl Into<Vec<u8>>) -> Self {
        self.state = state.into();
        self
    }

    pub fn with_json(mut self, json: serde_json::Value) -> Self {
        self.json = Some(json);
        self
    }

    pub fn with_part(mut self, part: i64) -> Self {
        self.part = Some(part);
        self
    }
}

impl ObjectWriter for WriteRequest {
    fn serialize(&self) -> Vec<u8> {
        self.state.clone()
    }

    fn json(&self) -> Option<serde_json::Value> {
        self.json.clone()
    }

    fn part(&self) -> Option<i64> {
        self.part
    }

    fn resource(&self) -> bool {
        self.resource
    }

    fn of(&self) -> Option<&Oid> {
        self.of.as_ref()
    }

    fn parent_id(&self) -> Option<&Oid> {
        self.parent_id.as_ref()
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_request_defaults() {
        let parent = Oid::new("root").unwrap();
        let req = WriteRequest::child(parent.clone(), "doc1", "Item").with_state(b"s".to_vec());
        assert_eq!(req.parent_id(), Some(&parent));
        assert_eq!(req.id(), Some("doc1"));
        assert!(req.resource());
        assert_eq!(req.part(), None);
        assert_eq!(req.serialize(), b"s".to_vec());
    }

    #[test]
    fn annotation_request() {
        let of = Oid::new("doc1").unwrap();
        let req = WriteRequest::annotation(of.clone(), "behavior", "Annotation").with_part(3);
        assert_eq!(req.of(), Some(&of));
        assert!(req.parent_id().is_none());
        assert!(!req.resource());
        assert_eq!(req.part(), Some(3));
    }
}
