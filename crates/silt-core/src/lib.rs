//! silt-core - Offline-first synchronization core
//!
//! Writes are mirrored across an always-available local store and a remote
//! backend of uncertain availability. While the backend is unreachable,
//! writes land in a durable operation log and replay in issuance order once
//! it comes back. Independently, per-device databases converge by
//! exchanging full snapshots through the remote tier, reconciled with
//! row-granularity last-writer-wins timestamps.

pub mod device;
pub mod error;
pub mod models;
pub mod queue;
pub mod schema;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use models::{ColumnValue, Operation, OperationKind, Value};
