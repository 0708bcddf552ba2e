//! Storage adapters
//!
//! Every backing store implements [`DataAdapter`]: one universal query in,
//! one [`QueryResult`] out. Adapters are selected at runtime by [`Provider`]
//! and constructed from JSON credentials through the [`AdapterRegistry`].
//!
//! | Provider | Transport | Status |
//! |----------|-----------|--------|
//! | `sqlite` | embedded (rusqlite) | complete |
//! | `postgres` | tokio-postgres | complete (feature `postgres`) |
//! | `mysql` | none | translation only |
//! | `mongodb` | Atlas Data API (ureq) | complete |
//! | `supabase` | PostgREST (ureq) | complete |
//! | `firestore` | none | placeholder |

pub mod firestore;
pub mod mongodb;
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;
pub mod supabase;

mod http;

pub use firestore::FirestoreAdapter;
pub use mongodb::{MongoDbAdapter, MongoDbConfig};
pub use mysql::{MySqlAdapter, MySqlConfig};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresAdapter, PostgresConfig};
pub use sqlite::{SqliteAdapter, SqliteConfig};
pub use supabase::{SupabaseAdapter, SupabaseConfig};

use crate::database::ConnectionManager;
use crate::error::{DataError, Result};
use crate::query::{Row, UniversalQuery};
use crate::security::User;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Tables captured by logical backups, in dependency order
pub const BACKUP_TABLES: &[&str] = &["profiles", "user_roles", "projects", "project_applications"];

/// Rows written per restore transaction
pub const RESTORE_BATCH_SIZE: usize = 100;

pub const BACKUP_FORMAT_VERSION: &str = "1.0";

// =============================================================================
// Provider
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Sqlite,
    Postgres,
    MySql,
    MongoDb,
    Supabase,
    Firestore,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Sqlite => "sqlite",
            Provider::Postgres => "postgres",
            Provider::MySql => "mysql",
            Provider::MongoDb => "mongodb",
            Provider::Supabase => "supabase",
            Provider::Firestore => "firestore",
        }
    }

    pub fn all() -> &'static [Provider] {
        &[
            Provider::Sqlite,
            Provider::Postgres,
            Provider::MySql,
            Provider::MongoDb,
            Provider::Supabase,
            Provider::Firestore,
        ]
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Provider {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Provider::Sqlite),
            "postgres" | "postgresql" => Ok(Provider::Postgres),
            "mysql" => Ok(Provider::MySql),
            "mongodb" | "mongo" => Ok(Provider::MongoDb),
            "supabase" => Ok(Provider::Supabase),
            "firestore" => Ok(Provider::Firestore),
            other => Err(DataError::Config(format!("unknown provider '{}'", other))),
        }
    }
}

// =============================================================================
// Results and payloads
// =============================================================================

/// Outcome of a universal query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryResult {
    Rows { rows: Vec<Row> },
    Inserted { row: Row },
    /// `rows` is empty when the backend cannot return affected rows
    Affected { count: u64, rows: Vec<Row> },
    Count { count: u64 },
}

impl QueryResult {
    /// Rows carried by the result, if any
    pub fn rows(&self) -> &[Row] {
        match self {
            QueryResult::Rows { rows } | QueryResult::Affected { rows, .. } => rows,
            QueryResult::Inserted { row } => std::slice::from_ref(row),
            QueryResult::Count { .. } => &[],
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryResult::Rows { rows } | QueryResult::Affected { rows, .. } => rows,
            QueryResult::Inserted { row } => vec![row],
            QueryResult::Count { .. } => Vec::new(),
        }
    }

    /// Row count for selects, affected count for writes, the count itself for counts
    pub fn count(&self) -> u64 {
        match self {
            QueryResult::Rows { rows } => rows.len() as u64,
            QueryResult::Inserted { .. } => 1,
            QueryResult::Affected { count, .. } | QueryResult::Count { count } => *count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub format_version: String,
    pub timestamp: DateTime<Utc>,
    pub total_records: u64,
    pub provider: Provider,
}

/// Logical, backend-neutral snapshot of the application tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPayload {
    /// Table name to DDL, where the backend can report it
    #[serde(default)]
    pub schema: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<Row>>,
    /// Entries of [`BACKUP_TABLES`] the backend could not read
    #[serde(default)]
    pub skipped_tables: Vec<String>,
    pub metadata: BackupMetadata,
}

impl BackupPayload {
    pub fn new(provider: Provider, schema: BTreeMap<String, String>, data: BTreeMap<String, Vec<Row>>) -> Self {
        let total_records = data.values().map(|rows| rows.len() as u64).sum();
        let skipped_tables = BACKUP_TABLES
            .iter()
            .filter(|t| !data.contains_key(**t))
            .map(|t| t.to_string())
            .collect();
        Self {
            schema,
            data,
            skipped_tables,
            metadata: BackupMetadata {
                format_version: BACKUP_FORMAT_VERSION.to_string(),
                timestamp: Utc::now(),
                total_records,
                provider,
            },
        }
    }

    /// Whether every table of [`BACKUP_TABLES`] was captured
    pub fn is_complete(&self) -> bool {
        self.skipped_tables.is_empty() && BACKUP_TABLES.iter().all(|t| self.data.contains_key(*t))
    }

    /// Tables in restore order: the known dependency order, then the rest by name
    pub fn restore_order(&self) -> Vec<&str> {
        let mut order: Vec<&str> = BACKUP_TABLES
            .iter()
            .copied()
            .filter(|t| self.data.contains_key(*t))
            .collect();
        order.extend(
            self.data
                .keys()
                .map(String::as_str)
                .filter(|t| !BACKUP_TABLES.contains(t)),
        );
        order
    }
}

/// Outcome of a best-effort restore
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Rows written per table
    pub restored: BTreeMap<String, u64>,
    /// Tables skipped because a batch failed
    pub failed_tables: Vec<String>,
}

impl RestoreReport {
    pub fn total_restored(&self) -> u64 {
        self.restored.values().sum()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_tables.is_empty()
    }

    pub(crate) fn record_failure(&mut self, provider: Provider, table: &str, err: &DataError) {
        warn!("{} restore skipped table {}: {}", provider, table, err);
        self.failed_tables.push(table.to_string());
    }
}

// =============================================================================
// Adapter trait
// =============================================================================

/// The contract every backing store implements
///
/// Adapters do not authorize: the caller identity is passed for auditing and
/// for backends that need it. Authorization happens in the security engine
/// before an adapter is reached.
#[async_trait]
pub trait DataAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn query(&self, query: &UniversalQuery, user: &User) -> Result<QueryResult>;

    async fn test_connection(&self) -> bool;

    async fn disconnect(&self) -> Result<()>;

    /// Exact row count of a table
    async fn count(&self, table: &str) -> Result<u64> {
        let result = self
            .query(&UniversalQuery::count(table), &User::system())
            .await?;
        Ok(result.count())
    }

    /// Snapshot [`BACKUP_TABLES`]; unreadable tables are left out and listed
    /// in [`BackupPayload::skipped_tables`]
    async fn backup(&self) -> Result<BackupPayload> {
        let system = User::system();
        let mut data = BTreeMap::new();
        for table in BACKUP_TABLES {
            match self.query(&UniversalQuery::select(*table), &system).await {
                Ok(result) => {
                    data.insert(table.to_string(), result.into_rows());
                }
                Err(e) => warn!("{} backup skipped table {}: {}", self.provider(), table, e),
            }
        }
        let payload = BackupPayload::new(self.provider(), BTreeMap::new(), data);
        info!(
            "{} backup captured {} records",
            self.provider(),
            payload.metadata.total_records
        );
        Ok(payload)
    }

    /// Best-effort restore: tables are written in dependency order and a
    /// failing table is logged and skipped
    ///
    /// The default writes one insert per row; backends with transactions or
    /// bulk endpoints override it to write [`RESTORE_BATCH_SIZE`] rows at once.
    async fn restore(&self, payload: &BackupPayload) -> Result<RestoreReport> {
        let system = User::system();
        let mut report = RestoreReport::default();
        for table in payload.restore_order() {
            let rows = payload.data.get(table).map(Vec::as_slice).unwrap_or(&[]);
            let mut written = 0u64;
            let mut failure = None;
            for row in rows {
                let insert = UniversalQuery::insert(table, row.clone());
                match self.query(&insert, &system).await {
                    Ok(_) => written += 1,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            match failure {
                Some(e) => report.record_failure(self.provider(), table, &e),
                None => {
                    report.restored.insert(table.to_string(), written);
                }
            }
        }
        Ok(report)
    }
}

/// Run blocking driver or HTTP work off the async executor
pub(crate) async fn blocking<T, F>(provider: Provider, context: &str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DataError::adapter(provider, context, e))?
}

/// The active adapter; swapped atomically, in-flight calls keep their `Arc`
pub type AdapterSlot = Arc<RwLock<Arc<dyn DataAdapter>>>;

pub fn adapter_slot(adapter: Arc<dyn DataAdapter>) -> AdapterSlot {
    Arc::new(RwLock::new(adapter))
}

/// Deserialize provider credentials into a typed config
pub(crate) fn parse_credentials<T: serde::de::DeserializeOwned>(
    provider: Provider,
    credentials: &Value,
) -> Result<T> {
    serde_json::from_value(credentials.clone())
        .map_err(|e| DataError::Config(format!("invalid {} credentials: {}", provider, e)))
}

// =============================================================================
// Registry
// =============================================================================

type AdapterFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn DataAdapter>> + Send + Sync>;

/// Builds adapters from `(provider, credentials)` pairs
///
/// The embedded SQLite database is shared: `sqlite` credentials without a
/// `path` resolve to the process-wide connection. Factories can be replaced,
/// which is how hosts plug in drivers the crate does not ship.
pub struct AdapterRegistry {
    embedded: Arc<ConnectionManager>,
    factories: HashMap<Provider, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new(embedded: Arc<ConnectionManager>) -> Self {
        Self {
            embedded,
            factories: HashMap::new(),
        }
    }

    /// Override how adapters for `provider` are constructed
    pub fn register_factory<F>(&mut self, provider: Provider, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn DataAdapter>> + Send + Sync + 'static,
    {
        self.factories.insert(provider, Box::new(factory));
    }

    pub fn create(&self, provider: Provider, credentials: &Value) -> Result<Arc<dyn DataAdapter>> {
        if let Some(factory) = self.factories.get(&provider) {
            return factory(credentials);
        }
        let adapter: Arc<dyn DataAdapter> = match provider {
            Provider::Sqlite => {
                let config: SqliteConfig = parse_credentials(provider, credentials)?;
                match config.path {
                    Some(path) => Arc::new(SqliteAdapter::new(Arc::new(ConnectionManager::new(
                        path,
                        self.embedded.settings().clone(),
                    )))),
                    None => Arc::new(SqliteAdapter::new(self.embedded.clone())),
                }
            }
            #[cfg(feature = "postgres")]
            Provider::Postgres => Arc::new(PostgresAdapter::new(parse_credentials(provider, credentials)?)),
            #[cfg(not(feature = "postgres"))]
            Provider::Postgres => {
                return Err(DataError::Config(
                    "postgres support is not compiled in (enable the `postgres` feature)".to_string(),
                ))
            }
            Provider::MySql => Arc::new(MySqlAdapter::new(parse_credentials(provider, credentials)?)),
            Provider::MongoDb => Arc::new(MongoDbAdapter::new(parse_credentials(provider, credentials)?)),
            Provider::Supabase => Arc::new(SupabaseAdapter::new(parse_credentials(provider, credentials)?)),
            Provider::Firestore => Arc::new(FirestoreAdapter::new(credentials.clone())),
        };
        Ok(adapter)
    }
}
