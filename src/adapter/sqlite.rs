//! SQLite adapter over the embedded database
//!
//! The reference adapter: every universal operation is supported, statements
//! are built by [`QueryBuilder`] and written rows come back through
//! `RETURNING *`.

use super::{
    blocking, BackupPayload, DataAdapter, Provider, QueryResult, RestoreReport, BACKUP_TABLES,
    RESTORE_BATCH_SIZE,
};
use crate::database::{ConnectionManager, TransactionManager};
use crate::error::{DataError, Result};
use crate::query::{BuiltStatement, Dialect, Operation, QueryBuilder, Row, UniversalQuery};
use crate::security::User;
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Credentials for the `sqlite` provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Separate database file; `None` means the shared embedded database
    #[serde(default)]
    pub path: Option<PathBuf>,
}

pub struct SqliteAdapter {
    connection: Arc<ConnectionManager>,
}

impl SqliteAdapter {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Run `f` against the connection manager on the blocking pool
    async fn blocking<T, F>(&self, context: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ConnectionManager) -> Result<T> + Send + 'static,
    {
        let connection = self.connection.clone();
        blocking(Provider::Sqlite, context, move || f(connection.as_ref())).await
    }
}

fn run(connection: &ConnectionManager, query: &UniversalQuery) -> Result<QueryResult> {
    let context = query.describe();
    let builder = QueryBuilder::from_query(Dialect::Sqlite, query);

    connection.with_connection(|conn| match query.operation {
        Operation::Select => {
            let rows = fetch(conn, &builder.to_select_sql()?, &context)?;
            Ok(QueryResult::Rows { rows })
        }
        Operation::Count => {
            let stmt = builder.to_count_sql()?;
            debug!("sqlite {}: {}", context, stmt.sql);
            let count: i64 = conn
                .query_row(&stmt.sql, params_from_iter(bind(&stmt.params)), |row| row.get(0))
                .map_err(|e| DataError::sqlite(context.as_str(), e))?;
            Ok(QueryResult::Count {
                count: count.max(0) as u64,
            })
        }
        Operation::Insert => {
            let data = query.data.clone().unwrap_or_default();
            let row = insert_row(conn, &query.collection, data, &context)?;
            Ok(QueryResult::Inserted { row })
        }
        Operation::Update => {
            let data = query.data.clone().unwrap_or_default();
            let rows = fetch(conn, &builder.returning().to_update_sql(&data)?, &context)?;
            Ok(QueryResult::Affected {
                count: rows.len() as u64,
                rows,
            })
        }
        Operation::Delete => {
            let rows = fetch(conn, &builder.returning().to_delete_sql()?, &context)?;
            Ok(QueryResult::Affected {
                count: rows.len() as u64,
                rows,
            })
        }
    })
}

/// Rows plus each table's `CREATE TABLE` statement
fn snapshot(connection: &ConnectionManager) -> Result<BackupPayload> {
    let (schema, data) = connection.with_connection(|conn| {
        let mut schema = BTreeMap::new();
        let mut data = BTreeMap::new();
        for table in BACKUP_TABLES {
            let ddl: Option<String> = conn
                .query_row(
                    "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| DataError::sqlite(format!("backup schema of {}", table), e))?;
            let Some(ddl) = ddl else {
                warn!("sqlite backup skipped missing table {}", table);
                continue;
            };
            let stmt = QueryBuilder::new(Dialect::Sqlite).from(table).to_select_sql()?;
            let rows = fetch(conn, &stmt, &format!("backup of {}", table))?;
            schema.insert(table.to_string(), ddl);
            data.insert(table.to_string(), rows);
        }
        Ok::<_, DataError>((schema, data))
    })?;
    Ok(BackupPayload::new(Provider::Sqlite, schema, data))
}

fn restore_into(connection: &Arc<ConnectionManager>, payload: &BackupPayload) -> RestoreReport {
    let transactions = TransactionManager::new(connection.clone());
    let mut report = RestoreReport::default();

    for table in payload.restore_order() {
        let rows = payload.data.get(table).map(Vec::as_slice).unwrap_or(&[]);
        let context = format!("restore into {}", table);

        let prepared = connection.with_connection(|conn| {
            if crate::database::core::table_exists(conn, table)? {
                return Ok(());
            }
            match payload.schema.get(table) {
                Some(ddl) => conn
                    .execute_batch(ddl)
                    .map_err(|e| DataError::sqlite(format!("create {}", table), e)),
                None => Err(DataError::adapter(
                    Provider::Sqlite,
                    context.as_str(),
                    anyhow::anyhow!("table {} does not exist and the payload has no schema for it", table),
                )),
            }
        });
        if let Err(e) = prepared {
            report.record_failure(Provider::Sqlite, table, &e);
            continue;
        }

        let mut written = 0u64;
        let mut failure = None;
        for batch in rows.chunks(RESTORE_BATCH_SIZE) {
            let outcome = transactions.execute_immediate(|tx| {
                for row in batch {
                    insert_row(tx.connection(), table, row.clone(), &context)?;
                }
                Ok::<_, DataError>(())
            });
            match outcome {
                Ok(()) => written += batch.len() as u64,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        match failure {
            Some(e) => report.record_failure(Provider::Sqlite, table, &e),
            None => {
                report.restored.insert(table.to_string(), written);
            }
        }
    }
    report
}

// =============================================================================
// Value conversion
// =============================================================================

/// JSON to SQLite storage class; booleans become 0/1, containers become JSON text
pub(crate) fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn bind(params: &[Value]) -> impl Iterator<Item = SqlValue> + '_ {
    params.iter().map(to_sql_value)
}

pub(crate) fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| json!(b)).collect()),
    }
}

pub(crate) fn fetch(conn: &Connection, stmt: &BuiltStatement, context: &str) -> Result<Vec<Row>> {
    debug!("sqlite {}: {}", context, stmt.sql);
    let mut prepared = conn
        .prepare(&stmt.sql)
        .map_err(|e| DataError::sqlite(context, e))?;
    let columns: Vec<String> = prepared
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let rows = prepared
        .query_map(params_from_iter(bind(&stmt.params)), |row| {
            let mut out = Row::new();
            for (idx, name) in columns.iter().enumerate() {
                out.insert(name.clone(), from_sql_value(row.get_ref(idx)?));
            }
            Ok(out)
        })
        .map_err(|e| DataError::sqlite(context, e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| DataError::sqlite(context, e))
}

/// Whether the table declares a textual `id` column
fn id_is_text(conn: &Connection, table: &str) -> Result<bool> {
    let declared: Option<String> = conn
        .query_row(
            "SELECT type FROM pragma_table_info(?1) WHERE name = 'id'",
            [table],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DataError::sqlite(format!("inspect {}", table), e))?;
    Ok(declared.is_some_and(|t| {
        let t = t.to_uppercase();
        t.contains("TEXT") || t.contains("CHAR")
    }))
}

fn insert_row(conn: &Connection, table: &str, mut data: Row, context: &str) -> Result<Row> {
    if !data.contains_key("id") && id_is_text(conn, table)? {
        data.insert("id".to_string(), json!(uuid::Uuid::new_v4().to_string()));
    }
    let stmt = QueryBuilder::new(Dialect::Sqlite)
        .from(table)
        .returning()
        .to_insert_sql(&data)?;
    fetch(conn, &stmt, context)?
        .into_iter()
        .next()
        .ok_or_else(|| DataError::adapter(Provider::Sqlite, context, anyhow::anyhow!("insert returned no row")))
}

#[async_trait]
impl DataAdapter for SqliteAdapter {
    fn provider(&self) -> Provider {
        Provider::Sqlite
    }

    async fn query(&self, query: &UniversalQuery, _user: &User) -> Result<QueryResult> {
        query.validate()?;
        let query = query.clone();
        self.blocking(&query.describe(), move |connection| run(connection, &query))
            .await
    }

    async fn test_connection(&self) -> bool {
        self.blocking("health check", |connection| Ok(connection.health_check()))
            .await
            .unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<()> {
        self.blocking("close", |connection| {
            connection.close();
            Ok(())
        })
        .await
    }

    async fn count(&self, table: &str) -> Result<u64> {
        let table = table.to_string();
        self.blocking("count", move |connection| connection.table_count(&table))
            .await
    }

    /// Snapshot rows plus each table's `CREATE TABLE` statement
    async fn backup(&self) -> Result<BackupPayload> {
        let payload = self.blocking("backup", snapshot).await?;
        info!("sqlite backup captured {} records", payload.metadata.total_records);
        Ok(payload)
    }

    /// Restore in transactions of [`RESTORE_BATCH_SIZE`] rows; tables missing
    /// from the target are created from the payload's DDL when present
    async fn restore(&self, payload: &BackupPayload) -> Result<RestoreReport> {
        let payload = payload.clone();
        let connection = self.connection.clone();
        let report = blocking(Provider::Sqlite, "restore", move || {
            Ok(restore_into(&connection, &payload))
        })
        .await?;
        info!("sqlite restore wrote {} records", report.total_restored());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{builtin_migrations, MigrationManager};
    use crate::query::{Condition, Operator};

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn migrated_adapter() -> SqliteAdapter {
        let conn = Arc::new(ConnectionManager::in_memory());
        let mut migrations = MigrationManager::new(conn.clone()).unwrap();
        for m in builtin_migrations() {
            migrations.register(m).unwrap();
        }
        migrations.migrate().unwrap();
        SqliteAdapter::new(conn)
    }

    #[tokio::test]
    async fn test_crud_cycle() {
        let adapter = migrated_adapter();
        let user = User::system();

        let inserted = adapter
            .query(
                &UniversalQuery::insert(
                    "projects",
                    row(json!({"name": "Acme Promo", "creator_id": "u1", "budget": 250.5})),
                ),
                &user,
            )
            .await
            .unwrap();
        let QueryResult::Inserted { row: project } = inserted else {
            panic!("expected an inserted row");
        };
        let id = project["id"].as_str().unwrap().to_string();
        assert_eq!(id.len(), 36);
        assert_eq!(project["status"], json!("open"));
        assert_eq!(project["budget"], json!(250.5));

        let updated = adapter
            .query(
                &UniversalQuery::update("projects", row(json!({"status": "closed"})))
                    .where_eq("id", id.as_str()),
                &user,
            )
            .await
            .unwrap();
        assert_eq!(updated.count(), 1);
        assert_eq!(updated.rows()[0]["status"], json!("closed"));

        let count = adapter
            .query(&UniversalQuery::count("projects").where_eq("creator_id", "u1"), &user)
            .await
            .unwrap();
        assert_eq!(count, QueryResult::Count { count: 1 });

        let deleted = adapter
            .query(&UniversalQuery::delete("projects").where_eq("id", id.as_str()), &user)
            .await
            .unwrap();
        assert_eq!(deleted.count(), 1);
        assert_eq!(adapter.count("projects").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_select_shapes() {
        let adapter = migrated_adapter();
        let user = User::system();
        for (name, status) in [("a", "open"), ("b", "draft"), ("c", "closed")] {
            adapter
                .query(
                    &UniversalQuery::insert(
                        "projects",
                        row(json!({"name": name, "creator_id": "u1", "status": status})),
                    ),
                    &user,
                )
                .await
                .unwrap();
        }

        let result = adapter
            .query(
                &UniversalQuery::select("projects")
                    .fields(&["name"])
                    .filter("status", Operator::In, json!(["open", "draft"]))
                    .order_by_desc("name")
                    .limit(1),
                &user,
            )
            .await
            .unwrap();
        assert_eq!(result.rows(), &[row(json!({"name": "b"}))]);

        let result = adapter
            .query(
                &UniversalQuery::select("projects")
                    .where_eq("status", "closed")
                    .or_group(vec![Condition::new("name", Operator::Like, "A%")]),
                &user,
            )
            .await
            .unwrap();
        assert_eq!(result.count(), 2);
    }

    #[tokio::test]
    async fn test_writes_without_predicate_fail() {
        let adapter = migrated_adapter();
        let err = adapter
            .query(&UniversalQuery::delete("projects"), &User::system())
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::MissingPredicate { .. }));
    }

    #[tokio::test]
    async fn test_backup_restore_into_fresh_database() {
        let source = migrated_adapter();
        let user = User::system();
        source
            .query(
                &UniversalQuery::insert("profiles", row(json!({"id": "u1", "email": "u1@example.com"}))),
                &user,
            )
            .await
            .unwrap();
        for i in 0..250 {
            source
                .query(
                    &UniversalQuery::insert(
                        "projects",
                        row(json!({"name": format!("p{}", i), "creator_id": "u1"})),
                    ),
                    &user,
                )
                .await
                .unwrap();
        }

        let payload = source.backup().await.unwrap();
        assert_eq!(payload.metadata.total_records, 251);
        assert!(payload.schema.contains_key("projects"));

        // empty database without any migrations: tables come from the payload DDL
        let target = SqliteAdapter::new(Arc::new(ConnectionManager::in_memory()));
        let report = target.restore(&payload).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.restored["projects"], 250);
        assert_eq!(target.count("projects").await.unwrap(), 250);
        assert_eq!(target.backup().await.unwrap().data, payload.data);
    }

    #[tokio::test]
    async fn test_restore_skips_failing_table() {
        let target = migrated_adapter();
        let mut data = BTreeMap::new();
        data.insert(
            "profiles".to_string(),
            vec![row(json!({"id": "u1", "email": "u1@example.com"}))],
        );
        // user_id references a profile that does not exist
        data.insert(
            "user_roles".to_string(),
            vec![row(json!({"id": "r1", "user_id": "ghost", "role": "member"}))],
        );
        let payload = BackupPayload::new(Provider::Sqlite, BTreeMap::new(), data);

        let report = target.restore(&payload).await.unwrap();
        assert_eq!(report.restored["profiles"], 1);
        assert_eq!(report.failed_tables, vec!["user_roles".to_string()]);
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(to_sql_value(&json!(true)), SqlValue::Integer(1));
        assert_eq!(to_sql_value(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(
            to_sql_value(&json!({"a": 1})),
            SqlValue::Text("{\"a\":1}".to_string())
        );
        assert_eq!(from_sql_value(ValueRef::Integer(7)), json!(7));
        assert_eq!(from_sql_value(ValueRef::Text(b"x")), json!("x"));
    }
}
