//! PostgreSQL adapter
//!
//! Statements come from the shared [`QueryBuilder`] in the Postgres dialect.
//! PostgreSQL is strict about parameter types, so JSON values are bound
//! through [`PgParam`], which converts each value according to the type the
//! server inferred for its placeholder.

use super::{BackupPayload, DataAdapter, Provider, QueryResult, RestoreReport, RESTORE_BATCH_SIZE};
use crate::error::{DataError, Result};
use crate::query::{BuiltStatement, Dialect, Operation, QueryBuilder, Row, UniversalQuery};
use crate::security::User;
use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, GenericClient, NoTls, Row as PgRow};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Full libpq-style connection string; overrides the discrete fields
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_user")]
    pub database: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

impl PostgresConfig {
    pub fn connection_string(&self) -> String {
        match &self.connection_string {
            Some(s) => s.clone(),
            None => format!(
                "host={} port={} user={} password={} dbname={}",
                self.host, self.port, self.user, self.password, self.database
            ),
        }
    }
}

pub struct PostgresAdapter {
    config: PostgresConfig,
    client: Mutex<Option<Client>>,
}

fn pg_error(context: impl Into<String>, err: tokio_postgres::Error) -> DataError {
    let transient = err.is_closed()
        || matches!(
            err.code(),
            Some(code) if *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::TOO_MANY_CONNECTIONS
        );
    if transient {
        DataError::transient(Provider::Postgres, context, err)
    } else {
        DataError::adapter(Provider::Postgres, context, err)
    }
}

impl PostgresAdapter {
    pub fn new(config: PostgresConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    /// Lock the client, connecting first if needed
    async fn client(&self) -> Result<MutexGuard<'_, Option<Client>>> {
        let mut guard = self.client.lock().await;
        if guard.as_ref().map_or(true, Client::is_closed) {
            let (client, connection) = tokio_postgres::connect(&self.config.connection_string(), NoTls)
                .await
                .map_err(|e| DataError::Connection {
                    target: format!("postgres://{}:{}/{}", self.config.host, self.config.port, self.config.database),
                    reason: e.to_string(),
                })?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("postgres connection error: {}", e);
                }
            });
            info!("connected to postgres {}", self.config.database);
            *guard = Some(client);
        }
        Ok(guard)
    }

    async fn fetch<C: GenericClient + Sync>(client: &C, stmt: &BuiltStatement, context: &str) -> Result<Vec<Row>> {
        debug!("postgres {}: {}", context, stmt.sql);
        let params: Vec<PgParam<'_>> = stmt.params.iter().map(PgParam).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = client
            .query(stmt.sql.as_str(), &refs)
            .await
            .map_err(|e| pg_error(context, e))?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    /// Whether the table's `id` column wants a generated UUID
    async fn id_is_generated_text<C: GenericClient + Sync>(client: &C, table: &str) -> Result<bool> {
        let row = client
            .query_opt(
                "SELECT data_type FROM information_schema.columns WHERE table_name = $1 AND column_name = 'id'",
                &[&table],
            )
            .await
            .map_err(|e| pg_error(format!("inspect {}", table), e))?;
        Ok(row
            .and_then(|r| r.try_get::<_, String>(0).ok())
            .is_some_and(|t| matches!(t.as_str(), "text" | "character varying" | "uuid")))
    }

    async fn insert_row<C: GenericClient + Sync>(client: &C, table: &str, data: &Row, context: &str) -> Result<Row> {
        let mut data = data.clone();
        if !data.contains_key("id") && Self::id_is_generated_text(client, table).await? {
            data.insert("id".to_string(), json!(uuid::Uuid::new_v4().to_string()));
        }
        let stmt = QueryBuilder::new(Dialect::Postgres)
            .from(table)
            .returning()
            .to_insert_sql(&data)?;
        Self::fetch(client, &stmt, context)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DataError::adapter(Provider::Postgres, context, anyhow::anyhow!("insert returned no row")))
    }
}

// =============================================================================
// Type-directed parameter binding
// =============================================================================

/// A JSON value bound according to its placeholder's server-side type
#[derive(Debug)]
pub(crate) struct PgParam<'a>(pub &'a Value);

type BoxError = Box<dyn std::error::Error + Sync + Send>;

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_i64(value: &Value) -> std::result::Result<i64, BoxError> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| format!("{} is not an integer", n).into()),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::String(s) => s.parse::<i64>().map_err(|e| e.into()),
        other => Err(format!("cannot bind {} as integer", other).into()),
    }
}

fn as_f64(value: &Value) -> std::result::Result<f64, BoxError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("{} is not a number", n).into()),
        Value::String(s) => s.parse::<f64>().map_err(|e| e.into()),
        other => Err(format!("cannot bind {} as float", other).into()),
    }
}

fn as_bool(value: &Value) -> std::result::Result<bool, BoxError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        Value::String(s) => s.parse::<bool>().map_err(|e| e.into()),
        other => Err(format!("cannot bind {} as boolean", other).into()),
    }
}

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        let value = self.0;
        if value.is_null() {
            return Ok(IsNull::Yes);
        }
        match *ty {
            Type::BOOL => as_bool(value)?.to_sql(ty, out),
            Type::INT2 => i16::try_from(as_i64(value)?)?.to_sql(ty, out),
            Type::INT4 => i32::try_from(as_i64(value)?)?.to_sql(ty, out),
            Type::INT8 => as_i64(value)?.to_sql(ty, out),
            Type::FLOAT4 => (as_f64(value)? as f32).to_sql(ty, out),
            Type::FLOAT8 => as_f64(value)?.to_sql(ty, out),
            Type::JSON | Type::JSONB => value.to_sql(ty, out),
            Type::UUID => uuid::Uuid::parse_str(&as_text(value))?.to_sql(ty, out),
            Type::TIMESTAMPTZ => chrono::DateTime::parse_from_rfc3339(&as_text(value))?
                .with_timezone(&chrono::Utc)
                .to_sql(ty, out),
            Type::TIMESTAMP => parse_naive_timestamp(&as_text(value))?.to_sql(ty, out),
            Type::DATE => chrono::NaiveDate::parse_from_str(&as_text(value), "%Y-%m-%d")?.to_sql(ty, out),
            _ => as_text(value).as_str().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn parse_naive_timestamp(text: &str) -> std::result::Result<chrono::NaiveDateTime, BoxError> {
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|e| e.into())
}

// =============================================================================
// Row decoding
// =============================================================================

fn column_value(row: &PgRow, idx: usize, ty: &Type) -> Value {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).ok().flatten().map(Value::from),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx).ok().flatten().map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx).ok().flatten().map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).ok().flatten().map(Value::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::from(f64::from(v))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).ok().flatten().map(Value::from),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx).ok().flatten(),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::from(v.to_string())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::from(v.to_rfc3339())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::from(v.format("%Y-%m-%d %H:%M:%S").to_string())),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::from(v.to_string())),
        _ => row.try_get::<_, Option<String>>(idx).ok().flatten().map(Value::from),
    };
    value.unwrap_or(Value::Null)
}

fn row_to_json(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| (col.name().to_string(), column_value(row, idx, col.type_())))
        .collect()
}

#[async_trait]
impl DataAdapter for PostgresAdapter {
    fn provider(&self) -> Provider {
        Provider::Postgres
    }

    async fn query(&self, query: &UniversalQuery, _user: &User) -> Result<QueryResult> {
        query.validate()?;
        let context = query.describe();
        let guard = self.client().await?;
        let client = guard.as_ref().ok_or_else(|| DataError::Connection {
            target: "postgres".to_string(),
            reason: "client unavailable".to_string(),
        })?;
        let builder = QueryBuilder::from_query(Dialect::Postgres, query);

        match query.operation {
            Operation::Select => {
                let rows = Self::fetch(client, &builder.to_select_sql()?, &context).await?;
                Ok(QueryResult::Rows { rows })
            }
            Operation::Count => {
                let rows = Self::fetch(client, &builder.to_count_sql()?, &context).await?;
                let count = rows
                    .first()
                    .and_then(|r| r.get("count"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                Ok(QueryResult::Count { count })
            }
            Operation::Insert => {
                let data = query.data.clone().unwrap_or_default();
                let row = Self::insert_row(client, &query.collection, &data, &context).await?;
                Ok(QueryResult::Inserted { row })
            }
            Operation::Update => {
                let data = query.data.clone().unwrap_or_default();
                let stmt = builder.returning().to_update_sql(&data)?;
                let rows = Self::fetch(client, &stmt, &context).await?;
                Ok(QueryResult::Affected {
                    count: rows.len() as u64,
                    rows,
                })
            }
            Operation::Delete => {
                let stmt = builder.returning().to_delete_sql()?;
                let rows = Self::fetch(client, &stmt, &context).await?;
                Ok(QueryResult::Affected {
                    count: rows.len() as u64,
                    rows,
                })
            }
        }
    }

    async fn test_connection(&self) -> bool {
        match self.client().await {
            Ok(guard) => match guard.as_ref() {
                Some(client) => client.simple_query("SELECT 1").await.is_ok(),
                None => false,
            },
            Err(e) => {
                debug!("postgres connectivity test failed: {}", e);
                false
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        if self.client.lock().await.take().is_some() {
            info!("disconnected from postgres {}", self.config.database);
        }
        Ok(())
    }

    /// Restore in transactions of [`RESTORE_BATCH_SIZE`] rows
    async fn restore(&self, payload: &BackupPayload) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();
        let mut guard = self.client().await?;
        let client = guard.as_mut().ok_or_else(|| DataError::Connection {
            target: "postgres".to_string(),
            reason: "client unavailable".to_string(),
        })?;

        for table in payload.restore_order() {
            let rows = payload.data.get(table).map(Vec::as_slice).unwrap_or(&[]);
            let context = format!("restore into {}", table);
            let mut written = 0u64;
            let mut failure = None;

            for batch in rows.chunks(RESTORE_BATCH_SIZE) {
                let outcome: Result<()> = async {
                    let tx = client.transaction().await.map_err(|e| pg_error(&context, e))?;
                    for row in batch {
                        Self::insert_row(&tx, table, row, &context).await?;
                    }
                    tx.commit().await.map_err(|e| pg_error(&context, e))
                }
                .await;
                match outcome {
                    Ok(()) => written += batch.len() as u64,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            match failure {
                Some(e) => report.record_failure(Provider::Postgres, table, &e),
                None => {
                    report.restored.insert(table.to_string(), written);
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string() {
        let config: PostgresConfig =
            serde_json::from_value(json!({"host": "db", "password": "pw", "database": "app"})).unwrap();
        assert_eq!(
            config.connection_string(),
            "host=db port=5432 user=postgres password=pw dbname=app"
        );

        let config: PostgresConfig =
            serde_json::from_value(json!({"connection_string": "postgres://u@h/d"})).unwrap();
        assert_eq!(config.connection_string(), "postgres://u@h/d");
    }

    #[test]
    fn test_type_directed_binding() {
        let mut buf = BytesMut::new();
        let value = json!(42);
        PgParam(&value).to_sql(&Type::INT4, &mut buf).unwrap();
        assert_eq!(&buf[..], &42i32.to_be_bytes());

        let mut buf = BytesMut::new();
        PgParam(&value).to_sql(&Type::INT8, &mut buf).unwrap();
        assert_eq!(&buf[..], &42i64.to_be_bytes());

        let mut buf = BytesMut::new();
        let text = json!("open");
        PgParam(&text).to_sql(&Type::TEXT, &mut buf).unwrap();
        assert_eq!(&buf[..], b"open");

        let mut buf = BytesMut::new();
        assert!(matches!(
            PgParam(&Value::Null).to_sql(&Type::INT4, &mut buf).unwrap(),
            IsNull::Yes
        ));

        let mut buf = BytesMut::new();
        let too_big = json!(70000);
        assert!(PgParam(&too_big).to_sql(&Type::INT2, &mut buf).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let adapter = PostgresAdapter::new(
            serde_json::from_value(json!({"host": "127.0.0.1", "port": 1})).unwrap(),
        );
        assert!(!adapter.test_connection().await);
        let err = adapter
            .query(&UniversalQuery::select("projects"), &User::system())
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Connection { .. }));
    }
}
