//! SQLite implementation of the local tier
//!
//! One connection behind a `tokio::sync::Mutex`. Tables come from the
//! schema registry; every identifier that reaches generated SQL was
//! validated there. Each managed table carries the implicit
//! `id TEXT PRIMARY KEY` and `_modified INTEGER` columns, and `_modified`
//! drives both snapshot merging and publish freshness.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{LocalStore, MergeReport};
use crate::models::{ColumnValue, Operation, OperationKind, Value};
use crate::schema::{SchemaRegistry, TableSchema};

/// Local store backed by a SQLite database file
pub struct SqliteStore {
    conn: Mutex<Connection>,
    registry: Arc<SchemaRegistry>,
}

impl SqliteStore {
    /// Open a database at the given path, creating it and any missing
    /// registered tables
    pub async fn open(
        path: impl AsRef<Path>,
        registry: Arc<SchemaRegistry>,
    ) -> crate::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, registry)
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory(registry: Arc<SchemaRegistry>) -> crate::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, registry)
    }

    // ---------- Private ----------

    fn with_connection(conn: Connection, registry: Arc<SchemaRegistry>) -> crate::Result<Self> {
        configure(&conn)?;
        ensure_schema(&conn, &registry)?;
        Ok(Self {
            conn: Mutex::new(conn),
            registry,
        })
    }

    fn table(&self, name: &str) -> crate::Result<&TableSchema> {
        self.registry
            .table(name)
            .ok_or_else(|| crate::Error::InvalidInput(format!("unknown table: {name}")))
    }

    fn insert_row(&self, conn: &Connection, op: &Operation) -> crate::Result<()> {
        let table = self.table(&op.table)?;
        check_columns(table, &op.data)?;

        let mut names = vec!["id"];
        let mut values: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(op.row_id.clone())];
        for column in &op.data {
            names.push(column.name.as_str());
            values.push(bind_value(&column.value));
        }
        names.push("_modified");
        values.push(rusqlite::types::Value::Integer(op.timestamp));

        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            table.name(),
            names.join(", "),
            placeholders.join(", ")
        );
        conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(())
    }

    fn update_row(&self, conn: &Connection, op: &Operation) -> crate::Result<()> {
        let table = self.table(&op.table)?;
        check_columns(table, &op.data)?;

        let mut assignments = Vec::with_capacity(op.data.len() + 1);
        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(op.data.len() + 2);
        for (index, column) in op.data.iter().enumerate() {
            assignments.push(format!("{} = ?{}", column.name, index + 1));
            values.push(bind_value(&column.value));
        }
        assignments.push(format!("_modified = ?{}", op.data.len() + 1));
        values.push(rusqlite::types::Value::Integer(op.timestamp));
        values.push(rusqlite::types::Value::Text(op.row_id.clone()));

        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            table.name(),
            assignments.join(", "),
            op.data.len() + 2
        );
        let changed = conn.execute(&sql, rusqlite::params_from_iter(values))?;
        if changed == 0 {
            return Err(crate::Error::NotFound(format!(
                "{}/{}",
                op.table, op.row_id
            )));
        }
        Ok(())
    }

    fn delete_rows(&self, conn: &Connection, op: &Operation) -> crate::Result<()> {
        if op.targets_all_tables() {
            let mut batch = String::from("BEGIN;\n");
            for table in self.registry.tables() {
                batch.push_str(&format!("DELETE FROM {};\n", table.name()));
            }
            batch.push_str("COMMIT;");
            conn.execute_batch(&batch)?;
            return Ok(());
        }

        let table = self.table(&op.table)?;
        if op.targets_all_rows() {
            conn.execute(&format!("DELETE FROM {}", table.name()), [])?;
        } else {
            conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", table.name()),
                params![op.row_id],
            )?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LocalStore for SqliteStore {
    async fn execute(&self, op: &Operation) -> crate::Result<()> {
        op.validate()?;
        let conn = self.conn.lock().await;
        match op.kind {
            OperationKind::Insert => self.insert_row(&conn, op),
            OperationKind::Update => self.update_row(&conn, op),
            OperationKind::Delete => self.delete_rows(&conn, op),
        }
    }

    async fn read(&self, table: &str, row_id: &str) -> crate::Result<Option<Vec<ColumnValue>>> {
        let table = self.table(table)?;
        let conn = self.conn.lock().await;

        let select_list = if table.columns().is_empty() {
            "id".to_string()
        } else {
            let names: Vec<&str> = table
                .columns()
                .iter()
                .map(|column| column.name.as_str())
                .collect();
            names.join(", ")
        };
        let sql = format!(
            "SELECT {select_list} FROM {} WHERE id = ?1",
            table.name()
        );

        let row = conn
            .query_row(&sql, params![row_id], |row| {
                let mut data = Vec::with_capacity(table.columns().len());
                for (index, column) in table.columns().iter().enumerate() {
                    if let Some(value) = extract_value(row, index, column.kind)? {
                        data.push(ColumnValue {
                            name: column.name.clone(),
                            value,
                        });
                    }
                }
                Ok(data)
            })
            .optional()?;
        Ok(row)
    }

    async fn snapshot_to(&self, dest: &Path) -> crate::Result<()> {
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }
        let conn = self.conn.lock().await;
        conn.execute("VACUUM INTO ?1", params![dest.to_string_lossy()])?;
        Ok(())
    }

    async fn merge_snapshot(
        &self,
        source: &Path,
        newer_than_ms: i64,
    ) -> crate::Result<MergeReport> {
        let mut conn = self.conn.lock().await;
        conn.execute(
            "ATTACH DATABASE ?1 AS incoming",
            params![source.to_string_lossy()],
        )?;

        let merged = merge_attached(&mut conn, &self.registry, newer_than_ms);
        let detached = conn.execute("DETACH DATABASE incoming", []);

        let report = merged?;
        detached?;
        Ok(report)
    }

    async fn max_modified(&self) -> crate::Result<i64> {
        let conn = self.conn.lock().await;
        let mut newest = 0;
        for table in self.registry.tables() {
            let sql = format!(
                "SELECT COALESCE(MAX(_modified), 0) FROM {}",
                table.name()
            );
            let table_max: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            newest = newest.max(table_max);
        }
        Ok(newest)
    }
}

// ---------- Private ----------

/// Pragmas applied to every connection
fn configure(conn: &Connection) -> crate::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Create each registered table plus its `_modified` index
fn ensure_schema(conn: &Connection, registry: &SchemaRegistry) -> crate::Result<()> {
    for table in registry.tables() {
        let mut columns = vec!["id TEXT PRIMARY KEY".to_string()];
        for column in table.columns() {
            columns.push(format!("{} {}", column.name, column.kind.sql_type()));
        }
        columns.push("_modified INTEGER NOT NULL DEFAULT 0".to_string());

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {name} ({columns});\n\
             CREATE INDEX IF NOT EXISTS idx_{name}_modified ON {name} (_modified);",
            name = table.name(),
            columns = columns.join(", ")
        );
        conn.execute_batch(&ddl)?;
    }
    Ok(())
}

/// Reject operation data naming columns the table does not declare
fn check_columns(table: &TableSchema, data: &[ColumnValue]) -> crate::Result<()> {
    for column in data {
        let declared = table.column(&column.name).ok_or_else(|| {
            crate::Error::InvalidInput(format!(
                "unknown column: {}.{}",
                table.name(),
                column.name
            ))
        })?;
        if !declared.kind.accepts(&column.value) {
            return Err(crate::Error::InvalidInput(format!(
                "value does not match declared kind of {}.{}",
                table.name(),
                column.name
            )));
        }
    }
    Ok(())
}

fn bind_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Text(text) | Value::Asset(text) => rusqlite::types::Value::Text(text.clone()),
        Value::Integer(n) | Value::Timestamp(n) => rusqlite::types::Value::Integer(*n),
        Value::Real(n) => rusqlite::types::Value::Real(*n),
        Value::Blob(bytes) => rusqlite::types::Value::Blob(bytes.clone()),
    }
}

/// Typed extraction; NULL columns are omitted from the result
fn extract_value(
    row: &rusqlite::Row<'_>,
    index: usize,
    kind: crate::schema::ColumnKind,
) -> rusqlite::Result<Option<Value>> {
    use crate::schema::ColumnKind;
    let value = match kind {
        ColumnKind::Text => row.get::<_, Option<String>>(index)?.map(Value::Text),
        ColumnKind::Integer => row.get::<_, Option<i64>>(index)?.map(Value::Integer),
        ColumnKind::Real => row.get::<_, Option<f64>>(index)?.map(Value::Real),
        ColumnKind::Timestamp => row.get::<_, Option<i64>>(index)?.map(Value::Timestamp),
        ColumnKind::Blob => row.get::<_, Option<Vec<u8>>>(index)?.map(Value::Blob),
        ColumnKind::Asset => row.get::<_, Option<String>>(index)?.map(Value::Asset),
    };
    Ok(value)
}

/// Merge every registered table from the attached `incoming` database
///
/// Row-granularity last-writer-wins: rows absent locally are always
/// inserted, rows present on both sides are replaced only when the incoming
/// `_modified` is strictly newer. `newer_than_ms` bounds the overwrite scan
/// only.
fn merge_attached(
    conn: &mut Connection,
    registry: &SchemaRegistry,
    newer_than_ms: i64,
) -> crate::Result<MergeReport> {
    let tx = conn.transaction()?;
    let mut report = MergeReport::default();

    for table in registry.tables() {
        let present: i64 = tx.query_row(
            "SELECT COUNT(*) FROM incoming.sqlite_master WHERE type = 'table' AND name = ?1",
            params![table.name()],
            |row| row.get(0),
        )?;
        if present == 0 {
            tracing::debug!("Snapshot has no {} table, skipping", table.name());
            continue;
        }

        let mut names = vec!["id".to_string()];
        names.extend(table.columns().iter().map(|column| column.name.clone()));
        names.push("_modified".to_string());
        let columns = names.join(", ");
        let incoming_columns: Vec<String> =
            names.iter().map(|name| format!("i.{name}")).collect();
        let incoming_columns = incoming_columns.join(", ");

        // Newest row that will actually apply; computed before the inserts
        // because afterwards both sides carry the same `_modified`.
        let applied_max: i64 = tx.query_row(
            &format!(
                "SELECT COALESCE(MAX(i._modified), 0) FROM incoming.{name} AS i \
                 LEFT JOIN {name} AS m ON m.id = i.id \
                 WHERE m.id IS NULL OR (i._modified > ?1 AND i._modified > m._modified)",
                name = table.name()
            ),
            params![newer_than_ms],
            |row| row.get(0),
        )?;

        // Rows absent locally cannot conflict, so they copy over no matter
        // how old they are; the cutoff only bounds the overwrite scan.
        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO {name} ({columns}) \
                 SELECT {columns} FROM incoming.{name}",
                name = table.name()
            ),
            [],
        )?;

        let overwritten = tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {name} ({columns}) \
                 SELECT {incoming_columns} FROM incoming.{name} AS i \
                 JOIN {name} AS m ON m.id = i.id \
                 WHERE i._modified > ?1 AND i._modified > m._modified",
                name = table.name()
            ),
            params![newer_than_ms],
        )?;

        report.inserted += inserted;
        report.overwritten += overwritten;
        report.max_modified = report.max_modified.max(applied_max);
    }

    tx.commit()?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::new()
                .with_table(
                    TableSchema::new("messages")
                        .with_column("content", crate::schema::ColumnKind::Text)
                        .with_column("sent_at", crate::schema::ColumnKind::Timestamp),
                )
                .unwrap()
                .with_table(
                    TableSchema::new("contacts")
                        .with_column("name", crate::schema::ColumnKind::Text),
                )
                .unwrap(),
        )
    }

    async fn store() -> SqliteStore {
        SqliteStore::open_in_memory(registry()).await.unwrap()
    }

    fn message(row: &str, content: &str, ts: i64) -> Operation {
        Operation::insert(
            "messages",
            row,
            vec![
                ColumnValue::new("content", content),
                ColumnValue::new("sent_at", Value::Timestamp(ts)),
            ],
        )
        .with_timestamp(ts)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_then_read_round_trips() {
        let store = store().await;
        store.execute(&message("1", "hello", 1_000)).await.unwrap();

        let row = store.read("messages", "1").await.unwrap().unwrap();
        assert_eq!(
            row,
            vec![
                ColumnValue::new("content", "hello"),
                ColumnValue::new("sent_at", Value::Timestamp(1_000)),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_omits_unset_columns() {
        let store = store().await;
        let op = Operation::insert("messages", "1", vec![ColumnValue::new("content", "hi")]);
        store.execute(&op).await.unwrap();

        let row = store.read("messages", "1").await.unwrap().unwrap();
        assert_eq!(row, vec![ColumnValue::new("content", "hi")]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_missing_row_returns_none() {
        let store = store().await;
        assert!(store.read("messages", "nope").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_requires_an_existing_row() {
        let store = store().await;
        store.execute(&message("1", "old", 1_000)).await.unwrap();

        let update = Operation::update(
            "messages",
            "1",
            vec![ColumnValue::new("content", "new")],
        )
        .with_timestamp(2_000);
        store.execute(&update).await.unwrap();

        let row = store.read("messages", "1").await.unwrap().unwrap();
        assert!(row.contains(&ColumnValue::new("content", "new")));
        assert_eq!(store.max_modified().await.unwrap(), 2_000);

        let missing = Operation::update(
            "messages",
            "ghost",
            vec![ColumnValue::new("content", "x")],
        );
        assert!(matches!(
            store.execute(&missing).await,
            Err(crate::Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deletes_are_idempotent_and_scoped() {
        let store = store().await;
        store.execute(&message("1", "a", 1)).await.unwrap();
        store.execute(&message("2", "b", 2)).await.unwrap();
        store
            .execute(&Operation::insert(
                "contacts",
                "c1",
                vec![ColumnValue::new("name", "ada")],
            ))
            .await
            .unwrap();

        let delete = Operation::delete("messages", "1");
        store.execute(&delete).await.unwrap();
        store.execute(&delete).await.unwrap();
        assert!(store.read("messages", "1").await.unwrap().is_none());
        assert!(store.read("messages", "2").await.unwrap().is_some());

        store
            .execute(&Operation::delete_table("messages"))
            .await
            .unwrap();
        assert!(store.read("messages", "2").await.unwrap().is_none());
        assert!(store.read("contacts", "c1").await.unwrap().is_some());

        store.execute(&Operation::delete_all()).await.unwrap();
        assert!(store.read("contacts", "c1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_unknown_tables_columns_and_kinds() {
        let store = store().await;

        let unknown_table =
            Operation::insert("ghosts", "1", vec![ColumnValue::new("content", "x")]);
        assert!(matches!(
            store.execute(&unknown_table).await,
            Err(crate::Error::InvalidInput(_))
        ));

        let unknown_column =
            Operation::insert("messages", "1", vec![ColumnValue::new("subject", "x")]);
        assert!(matches!(
            store.execute(&unknown_column).await,
            Err(crate::Error::InvalidInput(_))
        ));

        let wrong_kind = Operation::insert(
            "messages",
            "1",
            vec![ColumnValue::new("content", Value::Integer(7))],
        );
        assert!(matches!(
            store.execute(&wrong_kind).await,
            Err(crate::Error::InvalidInput(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshot_merge_brings_over_new_rows() {
        let source = store().await;
        source.execute(&message("1", "one", 1_000)).await.unwrap();
        source.execute(&message("2", "two", 2_000)).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("peer.snapshot");
        source.snapshot_to(&snapshot).await.unwrap();

        let target = store().await;
        let report = target.merge_snapshot(&snapshot, 0).await.unwrap();
        assert_eq!(
            report,
            MergeReport {
                inserted: 2,
                overwritten: 0,
                max_modified: 2_000,
            }
        );
        assert!(target.read("messages", "1").await.unwrap().is_some());
        assert!(target.read("messages", "2").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merge_overwrites_only_strictly_newer_rows() {
        let source = store().await;
        source.execute(&message("1", "stale", 1_000)).await.unwrap();
        source.execute(&message("2", "fresh", 5_000)).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("peer.snapshot");
        source.snapshot_to(&snapshot).await.unwrap();

        let target = store().await;
        target.execute(&message("1", "mine", 3_000)).await.unwrap();
        target.execute(&message("2", "mine", 3_000)).await.unwrap();

        let report = target.merge_snapshot(&snapshot, 0).await.unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.overwritten, 1);
        assert_eq!(report.max_modified, 5_000);

        let kept = target.read("messages", "1").await.unwrap().unwrap();
        assert!(kept.contains(&ColumnValue::new("content", "mine")));
        let replaced = target.read("messages", "2").await.unwrap().unwrap();
        assert!(replaced.contains(&ColumnValue::new("content", "fresh")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merging_the_same_snapshot_twice_changes_nothing() {
        let source = store().await;
        source.execute(&message("1", "one", 1_000)).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("peer.snapshot");
        source.snapshot_to(&snapshot).await.unwrap();

        let target = store().await;
        target.merge_snapshot(&snapshot, 0).await.unwrap();
        let second = target.merge_snapshot(&snapshot, 0).await.unwrap();
        assert_eq!(second, MergeReport::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merge_inserts_absent_rows_regardless_of_cutoff() {
        let source = store().await;
        source.execute(&message("1", "old", 500)).await.unwrap();
        source.execute(&message("2", "new", 2_000)).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("peer.snapshot");
        source.snapshot_to(&snapshot).await.unwrap();

        // A row absent locally cannot conflict; it must come over even when
        // its `_modified` predates the device cutoff.
        let target = store().await;
        let report = target.merge_snapshot(&snapshot, 1_000).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert!(target.read("messages", "1").await.unwrap().is_some());
        assert!(target.read("messages", "2").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cutoff_bounds_overwrites_only() {
        let source = store().await;
        source.execute(&message("1", "peer", 800)).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("peer.snapshot");
        source.snapshot_to(&snapshot).await.unwrap();

        let target = store().await;
        target.execute(&message("1", "mine", 500)).await.unwrap();

        let report = target.merge_snapshot(&snapshot, 1_000).await.unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.overwritten, 0);
        let kept = target.read("messages", "1").await.unwrap().unwrap();
        assert!(kept.contains(&ColumnValue::new("content", "mine")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn max_modified_covers_every_table() {
        let store = store().await;
        assert_eq!(store.max_modified().await.unwrap(), 0);

        store.execute(&message("1", "a", 1_000)).await.unwrap();
        store
            .execute(
                &Operation::insert("contacts", "c1", vec![ColumnValue::new("name", "ada")])
                    .with_timestamp(9_000),
            )
            .await
            .unwrap();
        assert_eq!(store.max_modified().await.unwrap(), 9_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.db");
        let store = SqliteStore::open(&path, registry()).await.unwrap();
        store.execute(&message("1", "hi", 1)).await.unwrap();
        assert!(path.exists());
    }
}
