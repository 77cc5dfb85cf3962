use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tessera_types::Tid;

use crate::error::{PubSubError, PubSubResult};

/// Envelope schema version written by this crate.
pub const ENVELOPE_VERSION: u64 = 1;

/// Change notification for one committed transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    /// TID of the transaction that made the change.
    pub tid: Tid,
    /// Cache keys to evict.
    pub keys: Vec<String>,
    /// Fresh values the receiver may cache directly, by cache key.
    #[serde(default)]
    pub push: BTreeMap<String, Value>,
}

impl InvalidationMessage {
    pub fn new(tid: Tid, keys: Vec<String>) -> Self {
        Self {
            tid,
            keys,
            push: BTreeMap::new(),
        }
    }
}

/// What goes over the wire: a message tagged with the publisher's id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub v: u64,
    pub origin: String,
    pub data: InvalidationMessage,
}

fn default_version() -> u64 {
    ENVELOPE_VERSION
}

impl Envelope {
    pub fn new(origin: impl Into<String>, data: InvalidationMessage) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            origin: origin.into(),
            data,
        }
    }

    pub fn encode(&self) -> PubSubResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| PubSubError::Serialization(e.to_string()))
    }

    /// Decode a payload received from a driver.
    ///
    /// The version is checked before the body so a newer peer is reported
    /// as [`PubSubError::UnsupportedVersion`] rather than as garbage.
    pub fn decode(bytes: &[u8]) -> PubSubResult<Self> {
        let raw: Value =
            serde_json::from_slice(bytes).map_err(|e| PubSubError::Malformed(e.to_string()))?;
        let Some(object) = raw.as_object() else {
            return Err(PubSubError::Malformed("envelope is not an object".into()));
        };
        match object.get("v") {
            None => {}
            Some(v) => match v.as_u64() {
                Some(ENVELOPE_VERSION) => {}
                Some(other) => return Err(PubSubError::UnsupportedVersion(other)),
                None => return Err(PubSubError::Malformed(format!("bad version field: {v}"))),
            },
        }
        serde_json::from_value(raw).map_err(|e| PubSubError::Malformed(e.to_string()))
    }
}
