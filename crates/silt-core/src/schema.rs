//! Explicit table schema registry
//!
//! Stores declare their tables up front instead of deriving columns from
//! record types at runtime. The registry is built once at startup, shared by
//! `Arc`, and is the only source of identifiers that ever reach generated
//! SQL; everything it admits has been validated, so the SQLite tier can
//! interpolate names it looks up here.

use std::collections::BTreeMap;

use crate::models::Value;

/// Column names maintained by the local store on every managed table
pub const RESERVED_COLUMNS: [&str; 2] = ["id", "_modified"];

/// Declared type of a column; maps 1:1 to [`Value`] variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    /// Unix ms, stored as INTEGER
    Timestamp,
    Blob,
    /// External asset reference, stored as TEXT
    Asset,
}

impl ColumnKind {
    /// SQLite column type for DDL
    #[must_use]
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Text | Self::Asset => "TEXT",
            Self::Integer | Self::Timestamp => "INTEGER",
            Self::Real => "REAL",
            Self::Blob => "BLOB",
        }
    }

    /// Whether `value` agrees with this column's declared kind
    #[must_use]
    pub const fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::Text, Value::Text(_))
                | (Self::Integer, Value::Integer(_))
                | (Self::Real, Value::Real(_))
                | (Self::Timestamp, Value::Timestamp(_))
                | (Self::Blob, Value::Blob(_))
                | (Self::Asset, Value::Asset(_))
        )
    }
}

/// One declared column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
}

/// One declared table (user columns only; `id` and `_modified` are implicit)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    name: String,
    columns: Vec<ColumnDef>,
}

impl TableSchema {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Add a column (declaration order is preserved)
    #[must_use]
    pub fn with_column(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            kind,
        });
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Look up a declared column by name
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }
}

/// The set of tables a store manages
///
/// Iteration order is the tables' name order, so derived DDL and merge
/// statements are deterministic.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table, validating every identifier it introduces
    ///
    /// Rejects names that are not plain identifiers, tables registered
    /// twice, columns declared twice, and the reserved `id`/`_modified`
    /// columns.
    pub fn with_table(mut self, table: TableSchema) -> crate::Result<Self> {
        validate_identifier("table", &table.name)?;
        if table.name.to_ascii_lowercase().starts_with("sqlite_") {
            return Err(crate::Error::InvalidInput(format!(
                "table name is reserved by sqlite: {}",
                table.name
            )));
        }
        if self.tables.contains_key(&table.name) {
            return Err(crate::Error::InvalidInput(format!(
                "table registered twice: {}",
                table.name
            )));
        }

        for (index, column) in table.columns.iter().enumerate() {
            validate_identifier("column", &column.name)?;
            if RESERVED_COLUMNS
                .iter()
                .any(|reserved| column.name.eq_ignore_ascii_case(reserved))
            {
                return Err(crate::Error::InvalidInput(format!(
                    "column name is reserved: {}",
                    column.name
                )));
            }
            let duplicated = table.columns[..index]
                .iter()
                .any(|earlier| earlier.name.eq_ignore_ascii_case(&column.name));
            if duplicated {
                return Err(crate::Error::InvalidInput(format!(
                    "column declared twice in {}: {}",
                    table.name, column.name
                )));
            }
        }

        self.tables.insert(table.name.clone(), table);
        Ok(self)
    }

    /// Look up a registered table
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Registered tables in name order
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

// ---------- Private ----------

/// ASCII identifier check: letters, digits, underscores, no leading digit
fn validate_identifier(what: &str, name: &str) -> crate::Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(crate::Error::InvalidInput(format!(
            "invalid {what} name: {name:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages() -> TableSchema {
        TableSchema::new("messages")
            .with_column("content", ColumnKind::Text)
            .with_column("sent_at", ColumnKind::Timestamp)
    }

    #[test]
    fn registers_and_looks_up_tables() {
        let registry = SchemaRegistry::new().with_table(messages()).unwrap();
        let table = registry.table("messages").unwrap();
        assert_eq!(table.columns().len(), 2);
        assert_eq!(table.column("content").unwrap().kind, ColumnKind::Text);
        assert!(table.column("missing").is_none());
        assert!(registry.contains("messages"));
        assert!(!registry.contains("other"));
    }

    #[test]
    fn iterates_tables_in_name_order() {
        let registry = SchemaRegistry::new()
            .with_table(TableSchema::new("zebra"))
            .unwrap()
            .with_table(TableSchema::new("alpha"))
            .unwrap();
        let names: Vec<_> = registry.tables().map(TableSchema::name).collect();
        assert_eq!(names, ["alpha", "zebra"]);
    }

    #[test]
    fn rejects_reserved_columns() {
        for name in ["id", "_modified", "ID", "_MODIFIED"] {
            let table = TableSchema::new("messages").with_column(name, ColumnKind::Text);
            assert!(SchemaRegistry::new().with_table(table).is_err(), "{name}");
        }
    }

    #[test]
    fn rejects_invalid_identifiers() {
        for name in ["", "1abc", "has space", "drop;table", "semi-colon"] {
            let table = TableSchema::new(name);
            assert!(SchemaRegistry::new().with_table(table).is_err(), "{name:?}");
        }
    }

    #[test]
    fn rejects_sqlite_internal_table_names() {
        let table = TableSchema::new("sqlite_stat1");
        assert!(SchemaRegistry::new().with_table(table).is_err());
    }

    #[test]
    fn rejects_duplicate_registrations() {
        let registry = SchemaRegistry::new().with_table(messages()).unwrap();
        assert!(registry.with_table(messages()).is_err());

        let doubled = TableSchema::new("messages")
            .with_column("content", ColumnKind::Text)
            .with_column("Content", ColumnKind::Text);
        assert!(SchemaRegistry::new().with_table(doubled).is_err());
    }

    #[test]
    fn column_kinds_accept_matching_values() {
        assert!(ColumnKind::Text.accepts(&Value::Text("x".to_string())));
        assert!(ColumnKind::Timestamp.accepts(&Value::Timestamp(1)));
        assert!(!ColumnKind::Integer.accepts(&Value::Text("7".to_string())));
        assert!(!ColumnKind::Text.accepts(&Value::Asset("k".to_string())));
    }

    #[test]
    fn column_kinds_map_to_sqlite_types() {
        assert_eq!(ColumnKind::Asset.sql_type(), "TEXT");
        assert_eq!(ColumnKind::Timestamp.sql_type(), "INTEGER");
        assert_eq!(ColumnKind::Blob.sql_type(), "BLOB");
    }
}
