//! `pirepsync-core`: domain building blocks shared by the queue and the workers.
//!
//! This crate contains **pure domain** types (no IO): tenant identifiers, the
//! tagged raw field value, and the canonical PIREP record.

pub mod error;
pub mod field;
pub mod id;
pub mod pirep;

pub use error::{DomainError, DomainResult};
pub use field::{CoercionError, FieldKind, FieldValue};
pub use id::TenantId;
pub use pirep::{BackfillStatus, PirepField, PirepFields, PirepRecord, PIREP_RECORD_KIND};
