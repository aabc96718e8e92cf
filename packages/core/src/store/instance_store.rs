//! SQLite-backed instance store

use anyhow::Context;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::error::{HierarchyError, Result};

use super::functions::register_store_functions;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS Instances (
    Id TEXT PRIMARY KEY,
    ClassName TEXT NOT NULL,
    Label TEXT NOT NULL DEFAULT '',
    Properties TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS IX_Instances_ClassName ON Instances(ClassName);

CREATE TABLE IF NOT EXISTS Relationships (
    Id INTEGER PRIMARY KEY AUTOINCREMENT,
    ClassName TEXT NOT NULL,
    SourceId TEXT NOT NULL REFERENCES Instances(Id) ON DELETE CASCADE,
    TargetId TEXT NOT NULL REFERENCES Instances(Id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS IX_Relationships_Source ON Relationships(ClassName, SourceId);
CREATE INDEX IF NOT EXISTS IX_Relationships_Target ON Relationships(ClassName, TargetId);
"#;

/// Convert a JSON binding into an SQLite value
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Instances and relationships queried by navigation queries
///
/// A single connection guarded by a mutex; statements from different threads
/// are serialized.
pub struct InstanceStore {
    conn: Mutex<Connection>,
    connection_id: String,
    executed_queries: AtomicUsize,
}

impl InstanceStore {
    /// Open (or create) a store database file
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(busy_timeout)?;
        Self::initialize(conn)
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        register_store_functions(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            connection_id: Uuid::new_v4().to_string(),
            executed_queries: AtomicUsize::new(0),
        })
    }

    /// Identifier hierarchy caches use to separate stores
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| HierarchyError::invariant("instance store connection mutex poisoned"))
    }

    pub fn insert_instance(
        &self,
        id: &str,
        class_name: &str,
        label: &str,
        properties: &Value,
    ) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO Instances (Id, ClassName, Label, Properties) VALUES (?1, ?2, ?3, ?4)",
            params![id, class_name, label, properties.to_string()],
        )
        .map_err(|e| HierarchyError::sql_execution(format!("Failed to insert instance {}: {}", id, e)))?;
        Ok(())
    }

    pub fn insert_relationship(&self, class_name: &str, source_id: &str, target_id: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO Relationships (ClassName, SourceId, TargetId) VALUES (?1, ?2, ?3)",
            params![class_name, source_id, target_id],
        )
        .map_err(|e| {
            HierarchyError::sql_execution(format!(
                "Failed to relate {} -> {} via {}: {}",
                source_id, target_id, class_name, e
            ))
        })?;
        Ok(())
    }

    /// Run a query and map every row, polling `cancel` before each row
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::Cancelled`] when the token fires mid-read and
    /// [`HierarchyError::SqlExecution`] when preparation or mapping fails.
    pub fn query_map<T, F>(
        &self,
        sql: &str,
        bindings: &[Value],
        cancel: &CancellationToken,
        mut map: F,
    ) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> anyhow::Result<T>,
    {
        cancel.check()?;
        let conn = self.connection()?;
        self.executed_queries.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(sql, "executing navigation query");

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| HierarchyError::sql_execution(format!("Failed to prepare query: {}\n{}", e, sql)))?;
        let mut rows = stmt.query(params_from_iter(bindings.iter().map(to_sql_value)))?;

        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            cancel.check()?;
            results.push(map(row).context("Failed to read navigation row")?);
        }
        Ok(results)
    }

    /// Run a query returning a single integer
    pub fn query_scalar(&self, sql: &str, bindings: &[Value], cancel: &CancellationToken) -> Result<i64> {
        let values = self.query_map(sql, bindings, cancel, |row| {
            row.get::<_, Option<i64>>(0).context("Failed to get scalar")
        })?;
        Ok(values.into_iter().next().flatten().unwrap_or(0))
    }

    /// Number of statements executed through [`query_map`](Self::query_map)
    pub fn executed_queries(&self) -> usize {
        self.executed_queries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use anyhow::Result;
    use tempfile::TempDir;

    fn create_test_store() -> Result<(InstanceStore, TempDir)> {
        let temp_dir = TempDir::new()?;
        let store = InstanceStore::open(temp_dir.path().join("store.db"), Duration::from_secs(5))?;
        Ok((store, temp_dir))
    }

    #[test]
    fn test_insert_and_query_instances() -> Result<()> {
        let (store, _temp_dir) = create_test_store()?;
        store.insert_instance("w1", "Widget", "Alpha", &json!({"Color": "red"}))?;
        store.insert_instance("w2", "Widget", "Beta", &json!({}))?;

        let cancel = CancellationToken::new();
        let labels = store.query_map(
            "SELECT Label FROM Instances WHERE ClassName = ? ORDER BY sorting_value(Label)",
            &[json!("Widget")],
            &cancel,
            |row| row.get::<_, String>(0).context("Failed to get label"),
        )?;
        assert_eq!(labels, vec!["Alpha", "Beta"]);

        let count = store.query_scalar(
            "SELECT COUNT(*) FROM Instances WHERE json_extract(Properties, ?) = ?",
            &[json!("$.Color"), json!("red")],
            &cancel,
        )?;
        assert_eq!(count, 1);
        assert_eq!(store.executed_queries(), 2);
        Ok(())
    }

    #[test]
    fn test_relationship_requires_instances() -> Result<()> {
        let (store, _temp_dir) = create_test_store()?;
        store.insert_instance("a", "Person", "A", &json!({}))?;
        assert!(store.insert_relationship("Knows", "a", "missing").is_err());
        Ok(())
    }

    #[test]
    fn test_cancelled_query_is_not_executed() -> Result<()> {
        let store = InstanceStore::open_in_memory()?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = store.query_scalar("SELECT 1", &[], &cancel);
        assert!(matches!(result, Err(HierarchyError::Cancelled)));
        assert_eq!(store.executed_queries(), 0);
        Ok(())
    }

    #[test]
    fn test_to_sql_value() {
        assert_eq!(to_sql_value(&json!(true)), SqlValue::Integer(1));
        assert_eq!(to_sql_value(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(to_sql_value(&json!(["a"])), SqlValue::Text("[\"a\"]".into()));
    }
}
