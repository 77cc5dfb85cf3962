use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Maximum length of an object identifier, in bytes.
pub const MAX_OID_LENGTH: usize = 64;

/// Reserved identifier of the trash sentinel row.
///
/// Deleted records are re-parented under this OID until the vacuum worker
/// removes them physically.
pub const TRASHED_ID: &str = "DDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDD";

/// Object identifier: the primary key of a stored record.
///
/// OIDs are opaque strings. They are usually generated with [`Oid::generate`]
/// but any non-empty string up to [`MAX_OID_LENGTH`] bytes is accepted.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Oid(String);

impl Oid {
    /// Validate and wrap an identifier.
    pub fn new(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        if value.is_empty() {
            return Err(TypeError::EmptyOid);
        }
        if value.len() > MAX_OID_LENGTH {
            return Err(TypeError::OidTooLong {
                length: value.len(),
                max: MAX_OID_LENGTH,
            });
        }
        Ok(Self(value))
    }

    /// Generate a fresh random identifier (32 hex characters).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// The trash sentinel OID.
    pub fn trashed() -> Self {
        Self(TRASHED_ID.to_string())
    }

    /// Returns `true` if this is the trash sentinel.
    pub fn is_trashed(&self) -> bool {
        self.0 == TRASHED_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Oid {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Oid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Oid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Transaction identifier, drawn from a per-database monotonic sequence.
///
/// A record's TID is the TID of the last transaction that wrote it, which
/// makes it the record's version stamp for optimistic concurrency checks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tid(i64);

impl Tid {
    /// TID written on stub records created ahead of their owning object.
    pub const STUB: Tid = Tid(-1);

    /// TID of the trash sentinel and other bootstrap rows.
    pub const ZERO: Tid = Tid(0);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({})", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Tid {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>()
            .map(Self)
            .map_err(|_| TypeError::InvalidTid(s.to_string()))
    }
}

impl From<i64> for Tid {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Tid> for i64 {
    fn from(tid: Tid) -> Self {
        tid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_oid_rejected() {
        assert_eq!(Oid::new(""), Err(TypeError::EmptyOid));
    }

    #[test]
    fn long_oid_rejected() {
        let long = "x".repeat(MAX_OID_LENGTH + 1);
        assert!(matches!(
            Oid::new(long),
            Err(TypeError::OidTooLong { length: 65, max: 64 })
        ));
    }

    #[test]
    fn generated_oids_are_distinct() {
        let a = Oid::generate();
        let b = Oid::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn trashed_sentinel() {
        assert!(Oid::trashed().is_trashed());
        assert!(!Oid::new("doc1").unwrap().is_trashed());
    }

    #[test]
    fn serde_is_transparent() {
        let oid = Oid::new("doc1").unwrap();
        assert_eq!(serde_json::to_string(&oid).unwrap(), "\"doc1\"");
        let tid = Tid::new(42);
        assert_eq!(serde_json::to_string(&tid).unwrap(), "42");
    }

    #[test]
    fn tid_ordering_and_parse() {
        assert!(Tid::new(2) > Tid::new(1));
        assert!(Tid::STUB < Tid::ZERO);
        assert_eq!("7".parse::<Tid>().unwrap(), Tid::new(7));
        assert!("seven".parse::<Tid>().is_err());
    }

    proptest! {
        #[test]
        fn valid_oids_roundtrip_through_display(s in "[a-zA-Z0-9_-]{1,64}") {
            let oid = Oid::new(s.clone()).unwrap();
            prop_assert_eq!(oid.to_string(), s.clone());
            prop_assert_eq!(s.parse::<Oid>().unwrap(), oid);
        }
    }
}
