//! Cross-process invalidation bus for Tessera.
//!
//! Processes sharing a store publish one [`InvalidationMessage`] per
//! committed transaction so their peers can evict (or directly refresh)
//! cache entries. Delivery is best-effort and at-most-once; a lost message
//! only costs cache freshness, never store correctness.

pub mod bus;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod memory;

pub use bus::{InvalidationBus, Subscriber};
pub use driver::{MessageStream, PubSubDriver};
pub use envelope::{Envelope, InvalidationMessage, ENVELOPE_VERSION};
pub use error::{PubSubError, PubSubResult};
pub use memory::{InMemoryBroker, InMemoryPubSub};
