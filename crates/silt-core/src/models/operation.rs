//! Mutation operation model

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// What an operation does to its target row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// A typed column value carried by an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// UTF-8 text
    Text(String),
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit float
    Real(f64),
    /// Point in time (Unix ms)
    Timestamp(i64),
    /// Raw bytes
    Blob(Vec<u8>),
    /// Reference to an externally stored asset (object key)
    Asset(String),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

/// One named column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnValue {
    /// Column name
    pub name: String,
    /// Typed value
    pub value: Value,
}

impl ColumnValue {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An immutable insert/update/delete mutation against one logical row
///
/// Constructed when the application issues a write; consumed exactly once by
/// a successful execution against a backend, or persisted in the operation
/// log until a later replay succeeds.
///
/// An empty `row_id` addresses every row of `table`; an empty `table`
/// addresses every table. Both wildcards are valid for deletes only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Mutation kind
    pub kind: OperationKind,
    /// Issuance timestamp (Unix ms); used for ordering and conflict resolution
    pub timestamp: i64,
    /// Logical table name; `""` means all tables
    pub table: String,
    /// Row identifier within the table; `""` means all rows
    pub row_id: String,
    /// Ordered column values; empty for deletes
    pub data: Vec<ColumnValue>,
}

impl Operation {
    /// Create an insert for one row, stamped with the current time
    #[must_use]
    pub fn insert(
        table: impl Into<String>,
        row_id: impl Into<String>,
        data: Vec<ColumnValue>,
    ) -> Self {
        Self {
            kind: OperationKind::Insert,
            timestamp: now_ms(),
            table: table.into(),
            row_id: row_id.into(),
            data,
        }
    }

    /// Create an update for one row, stamped with the current time
    #[must_use]
    pub fn update(
        table: impl Into<String>,
        row_id: impl Into<String>,
        data: Vec<ColumnValue>,
    ) -> Self {
        Self {
            kind: OperationKind::Update,
            timestamp: now_ms(),
            table: table.into(),
            row_id: row_id.into(),
            data,
        }
    }

    /// Create a delete for one row
    #[must_use]
    pub fn delete(table: impl Into<String>, row_id: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Delete,
            timestamp: now_ms(),
            table: table.into(),
            row_id: row_id.into(),
            data: Vec::new(),
        }
    }

    /// Create a delete for every row of one table
    #[must_use]
    pub fn delete_table(table: impl Into<String>) -> Self {
        Self::delete(table, "")
    }

    /// Create a delete for every row of every table
    #[must_use]
    pub fn delete_all() -> Self {
        Self::delete("", "")
    }

    /// Override the issuance timestamp (Unix ms)
    ///
    /// Useful for deterministic ordering in tests and for callers that stamp
    /// writes from their own clock.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = timestamp_ms;
        self
    }

    /// Whether this operation addresses every table
    #[must_use]
    pub fn targets_all_tables(&self) -> bool {
        self.table.is_empty()
    }

    /// Whether this operation addresses every row of its table
    #[must_use]
    pub fn targets_all_rows(&self) -> bool {
        self.row_id.is_empty()
    }

    /// Check the structural invariants of this operation
    ///
    /// Constructors only produce valid shapes; this re-checks values that
    /// crossed a serialization boundary (queue entries) or were assembled by
    /// hand.
    pub fn validate(&self) -> crate::Result<()> {
        match self.kind {
            OperationKind::Delete => {
                if !self.data.is_empty() {
                    return Err(crate::Error::InvalidInput(
                        "delete operations carry no column data".to_string(),
                    ));
                }
            }
            OperationKind::Insert | OperationKind::Update => {
                if self.targets_all_tables() || self.targets_all_rows() {
                    return Err(crate::Error::InvalidInput(
                        "wildcard targets are valid for deletes only".to_string(),
                    ));
                }
                if self.data.is_empty() {
                    return Err(crate::Error::InvalidInput(
                        "insert/update operations require column data".to_string(),
                    ));
                }
            }
        }

        if self.targets_all_tables() && !self.targets_all_rows() {
            return Err(crate::Error::InvalidInput(
                "an all-tables delete cannot name a row".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for column in &self.data {
            if !seen.insert(column.name.as_str()) {
                return Err(crate::Error::InvalidInput(format!(
                    "duplicate column in operation data: {}",
                    column.name
                )));
            }
        }

        Ok(())
    }
}

/// Current Unix timestamp in milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
