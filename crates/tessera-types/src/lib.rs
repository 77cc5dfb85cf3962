//! Foundation types for Tessera.
//!
//! Every other Tessera crate depends on `tessera-types`. It defines the
//! identifiers and row shapes shared by the object store, the cache and the
//! invalidation bus.
//!
//! # Key Types
//!
//! - [`Oid`] -- object identifier, primary key of a stored record
//! - [`Tid`] -- transaction identifier and record version stamp
//! - [`ObjectRecord`] -- one row of the object table
//! - [`BlobChunk`] -- one chunk of a binary large object
//! - [`ObjectWriter`] -- what the content model hands the store on write

pub mod error;
pub mod oid;
pub mod record;
pub mod writer;

pub use error::TypeError;
pub use oid::{Oid, Tid, MAX_OID_LENGTH, TRASHED_ID};
pub use record::{AnnotationKey, BlobChunk, ConflictEntry, ObjectRecord, STUB_TYPE, TRASH_TYPE};
pub use writer::{ObjectWriter, WriteRequest};
