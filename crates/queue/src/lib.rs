//! Durable per-tenant work queue abstraction (mechanics only).
//!
//! The broker-backed implementation lives in `pirepsync-infra`; this crate
//! owns the contract, the payload codec, stream/consumer naming, and an
//! in-memory implementation with the same consumer-group semantics.

pub mod clock;
pub mod in_memory;
pub mod item;
pub mod naming;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use in_memory::InMemoryQueueStore;
pub use item::{Delivery, MessageId, PendingEntry, QueueItem, PAYLOAD_FIELD};
pub use naming::{
    claimer_consumer_name, stream_name, tenant_from_stream, worker_consumer_name, CONSUMER_GROUP,
};
pub use store::{QueueError, QueueStore, DEFAULT_CLAIM_BATCH};
