use serde::{Deserialize, Serialize};
use serde_json::Value;

use tessera_types::{ObjectRecord, Oid, Tid};

use crate::error::{CacheError, CacheResult};

/// Weight charged for values whose size cannot be read off directly.
pub const DEFAULT_WEIGHT: usize = 1024;

/// A cached value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CacheValue {
    Record(ObjectRecord),
    /// Child names of a container, or any other list of names.
    Keys(Vec<String>),
    Count(u64),
    Bytes(Vec<u8>),
    Json(Value),
}

impl CacheValue {
    /// Estimated memory cost in bytes.
    ///
    /// Records cost the length of their opaque state. Lists are estimated
    /// from their first element times their length. Scalars cost their
    /// natural size; anything else costs [`DEFAULT_WEIGHT`].
    pub fn size(&self) -> usize {
        match self {
            Self::Record(record) => record.state.len(),
            Self::Keys(keys) => keys.first().map_or(0, String::len) * keys.len(),
            Self::Count(_) => std::mem::size_of::<u64>(),
            Self::Bytes(bytes) => bytes.len(),
            Self::Json(value) => json_size(value),
        }
    }

    pub fn as_record(&self) -> Option<&ObjectRecord> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Encoding used by the remote tier.
    pub fn to_bytes(&self) -> CacheResult<Vec<u8>> {
        bincode::serialize(&WireValue::from(self))
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> CacheResult<Self> {
        let wire: WireValue =
            bincode::deserialize(bytes).map_err(|e| CacheError::Serialization(e.to_string()))?;
        wire.try_into()
    }

    /// Form carried in the `push` map of an invalidation message.
    pub fn to_json(&self) -> CacheResult<Value> {
        serde_json::to_value(self).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    pub fn from_json(value: Value) -> CacheResult<Self> {
        serde_json::from_value(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

fn json_size(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(_) | Value::Object(_) => DEFAULT_WEIGHT,
    }
}

// bincode is not self-describing, so JSON values travel as text.

#[derive(Serialize, Deserialize)]
enum WireValue {
    Record(WireRecord),
    Keys(Vec<String>),
    Count(u64),
    Bytes(Vec<u8>),
    Json(String),
}

#[derive(Serialize, Deserialize)]
struct WireRecord {
    oid: Oid,
    tid: Tid,
    state_size: i64,
    part: i64,
    resource: bool,
    of: Option<Oid>,
    otid: Option<Tid>,
    parent_id: Option<Oid>,
    id: Option<String>,
    type_name: String,
    json: Option<String>,
    state: Vec<u8>,
}

impl From<&CacheValue> for WireValue {
    fn from(value: &CacheValue) -> Self {
        match value {
            CacheValue::Record(r) => WireValue::Record(WireRecord {
                oid: r.oid.clone(),
                tid: r.tid,
                state_size: r.state_size,
                part: r.part,
                resource: r.resource,
                of: r.of.clone(),
                otid: r.otid,
                parent_id: r.parent_id.clone(),
                id: r.id.clone(),
                type_name: r.type_name.clone(),
                json: r.json.as_ref().map(Value::to_string),
                state: r.state.clone(),
            }),
            CacheValue::Keys(keys) => WireValue::Keys(keys.clone()),
            CacheValue::Count(n) => WireValue::Count(*n),
            CacheValue::Bytes(bytes) => WireValue::Bytes(bytes.clone()),
            CacheValue::Json(value) => WireValue::Json(value.to_string()),
        }
    }
}

impl TryFrom<WireValue> for CacheValue {
    type Error = CacheError;

    fn try_from(wire: WireValue) -> CacheResult<Self> {
        let parse = |raw: &str| {
            serde_json::from_str::<Value>(raw).map_err(|e| CacheError::Serialization(e.to_string()))
        };
        Ok(match wire {
            WireValue::Record(r) => CacheValue::Record(ObjectRecord {
                oid: r.oid,
                tid: r.tid,
                state_size: r.state_size,
                part: r.part,
                resource: r.resource,
                of: r.of,
                otid: r.otid,
                parent_id: r.parent_id,
                id: r.id,
                type_name: r.type_name,
                json: r.json.as_deref().map(parse).transpose()?,
                state: r.state,
            }),
            WireValue::Keys(keys) => CacheValue::Keys(keys),
            WireValue::Count(n) => CacheValue::Count(n),
            WireValue::Bytes(bytes) => CacheValue::Bytes(bytes),
            WireValue::Json(raw) => CacheValue::Json(parse(&raw)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn record(state: &[u8]) -> ObjectRecord {
        ObjectRecord {
            oid: Oid::new("doc1").unwrap(),
            tid: Tid::new(4),
            state_size: state.len() as i64,
            part: 0,
            resource: true,
            of: None,
            otid: Some(Tid::new(2)),
            parent_id: Some(Oid::new("root").unwrap()),
            id: Some("doc1".into()),
            type_name: "Item".into(),
            json: Some(serde_json::json!({"title": "t", "tags": [1, 2]})),
            state: state.to_vec(),
        }
    }

    #[test]
    fn size_heuristic() {
        assert_eq!(CacheValue::Record(record(b"12345")).size(), 5);
        assert_eq!(CacheValue::Keys(vec!["abc".into(), "x".into()]).size(), 6);
        assert_eq!(CacheValue::Keys(vec![]).size(), 0);
        assert_eq!(CacheValue::Count(9).size(), 8);
        assert_eq!(CacheValue::Bytes(vec![0; 10]).size(), 10);
        assert_eq!(CacheValue::Json(serde_json::json!("four")).size(), 4);
        assert_eq!(CacheValue::Json(serde_json::json!(true)).size(), 1);
        assert_eq!(CacheValue::Json(serde_json::json!({"a": 1})).size(), DEFAULT_WEIGHT);
    }

    #[test]
    fn remote_encoding_keeps_json_projection() {
        let value = CacheValue::Record(record(b"state"));
        let decoded = CacheValue::from_bytes(&value.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, value);

        let json = CacheValue::Json(serde_json::json!({"nested": [1, {"x": null}]}));
        assert_eq!(CacheValue::from_bytes(&json.to_bytes().unwrap()).unwrap(), json);
    }

    #[test]
    fn push_form() {
        let value = CacheValue::Keys(vec!["a".into()]);
        let json = value.to_json().unwrap();
        assert_eq!(json["kind"], "keys");
        assert_eq!(CacheValue::from_json(json).unwrap(), value);
        assert!(CacheValue::from_json(serde_json::json!({"kind": "nope"})).is_err());
    }

    #[test]
    fn garbage_bytes_are_a_serialization_error() {
        assert!(matches!(
            CacheValue::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0xff]),
            Err(CacheError::Serialization(_))
        ));
    }

    proptest! {
        #[test]
        fn keys_size_is_sampled(first in "[a-z]{0,16}", rest in 0usize..50) {
            let mut keys = vec![first.clone()];
            keys.extend(std::iter::repeat("zz".to_string()).take(rest));
            prop_assert_eq!(CacheValue::Keys(keys).size(), first.len() * (rest + 1));
        }
    }
}
