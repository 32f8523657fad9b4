//! Data models for silt

mod operation;
mod stamp;

pub use operation::{ColumnValue, Operation, OperationKind, Value};
pub use stamp::{device_from_key, SyncStamp, STAMP_SCHEMA_VERSION};

pub(crate) use operation::now_ms;
