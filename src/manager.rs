//! The data-access facade
//!
//! [`DataAccessManager`] is the single entry point the application talks to.
//! Every universal query runs through the same pipeline:
//!
//! ```text
//! authorize ─► pre-image ─► before handlers ─► adapter ─► after handlers ─► metric
//! ```
//!
//! It also owns the embedded database (layer tables, schema migrations,
//! file snapshots), the persisted backend configuration and the online
//! migration between backends.

use crate::adapter::sqlite::{fetch, to_sql_value};
use crate::adapter::{
    adapter_slot, AdapterRegistry, AdapterSlot, BackupPayload, DataAdapter, Provider, QueryResult,
    RestoreReport, SqliteAdapter,
};
use crate::config::PolystoreConfig;
use crate::database::{
    builtin_migrations, BackupManager, ConnectionManager, MigrationManager, SchemaManager, SchemaStatus,
    TransactionManager,
};
use crate::error::{DataError, Result};
use crate::events::triggers::{now_timestamp, TIMESTAMPED_TABLES};
use crate::events::{channel, install_default_triggers, DatabaseEvent, EventBus, Timing};
use crate::monitoring::{AlertRule, MonitoringService, MonitoringSettings, PerformanceMetric};
use crate::query::{BuiltStatement, Operation, Row, UniversalQuery};
use crate::security::{default_rules, SecurityEngine, User};
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Collection name recorded for raw SQL metrics
const RAW_SQL: &str = "raw_sql";

// =============================================================================
// Persisted backend configuration
// =============================================================================

/// A row of `database_configs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub id: String,
    pub provider: Provider,
    /// Provider credentials, stored as JSON text
    pub config: Value,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

type ConfigRow = (String, String, String, i64, String, String);

impl DatabaseConfig {
    fn from_parts(parts: ConfigRow) -> Result<Self> {
        let (id, provider, config, is_active, created_at, updated_at) = parts;
        let provider = provider.parse()?;
        let config = serde_json::from_str(&config)
            .map_err(|e| DataError::Config(format!("stored config {} is not valid JSON: {}", id, e)))?;
        Ok(Self {
            id,
            provider,
            config,
            is_active: is_active != 0,
            created_at,
            updated_at,
        })
    }
}

/// A row of `query_history`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHistoryEntry {
    pub id: i64,
    pub sql: String,
    pub user_id: String,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub executed_at: String,
}

// =============================================================================
// Backend migration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStage {
    Connecting,
    BackingUp,
    Restoring,
    Verifying,
}

impl Display for MigrationStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MigrationStage::Connecting => "connecting",
            MigrationStage::BackingUp => "backing_up",
            MigrationStage::Restoring => "restoring",
            MigrationStage::Verifying => "verifying",
        };
        write!(f, "{}", name)
    }
}

/// Where the current (or last) backend migration stands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum MigrationPhase {
    Idle,
    BackingUp,
    Restoring,
    Verifying,
    Swapped,
    Failed { stage: MigrationStage, reason: String },
}

impl Display for MigrationPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationPhase::Idle => write!(f, "idle"),
            MigrationPhase::BackingUp => write!(f, "backing_up"),
            MigrationPhase::Restoring => write!(f, "restoring"),
            MigrationPhase::Verifying => write!(f, "verifying"),
            MigrationPhase::Swapped => write!(f, "swapped"),
            MigrationPhase::Failed { stage, reason } => write!(f, "failed while {}: {}", stage, reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "display", derive(tabled::Tabled))]
pub struct TableVerification {
    pub table: String,
    pub expected: u64,
    pub actual: u64,
}

impl TableVerification {
    pub fn matches(&self) -> bool {
        self.expected == self.actual
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub from: Provider,
    pub to: Provider,
    pub phase: MigrationPhase,
    pub backed_up_records: u64,
    pub restore: Option<RestoreReport>,
    pub verification: Vec<TableVerification>,
    pub duration_ms: u64,
}

impl MigrationReport {
    pub fn succeeded(&self) -> bool {
        self.phase == MigrationPhase::Swapped
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct DataAccessManager {
    connection: Arc<ConnectionManager>,
    transactions: TransactionManager,
    migrations: MigrationManager,
    backups: Arc<BackupManager>,
    registry: RwLock<AdapterRegistry>,
    security: Arc<SecurityEngine>,
    events: Arc<EventBus>,
    monitoring: Arc<MonitoringService>,
    active: AdapterSlot,
    phase: Mutex<MigrationPhase>,
    migration_lock: tokio::sync::Mutex<()>,
}

impl DataAccessManager {
    /// Open the embedded database described by `config`, apply pending
    /// schema migrations and activate the persisted backend
    pub async fn open(config: &PolystoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| DataError::Connection {
            target: config.data_dir.clone(),
            reason: format!("unable to create data directory: {}", e),
        })?;
        let connection = Arc::new(ConnectionManager::new(
            config.sqlite_path(),
            config.connection_settings(),
        ));
        let manager = Self::assemble(
            connection,
            config.backup_dir(),
            config.monitoring_settings(),
            config.alert_rules(),
        )?;
        manager.activate_stored_backend().await;
        Ok(manager)
    }

    /// A private in-memory database with default settings
    pub async fn open_in_memory() -> Result<Self> {
        let connection = Arc::new(ConnectionManager::in_memory());
        let backup_dir = std::env::temp_dir().join("polystore-backups");
        let manager = Self::assemble(
            connection,
            backup_dir,
            MonitoringSettings::default(),
            crate::monitoring::default_alert_rules(),
        )?;
        manager.activate_stored_backend().await;
        Ok(manager)
    }

    fn assemble(
        connection: Arc<ConnectionManager>,
        backup_dir: PathBuf,
        monitoring: MonitoringSettings,
        alert_rules: Vec<AlertRule>,
    ) -> Result<Self> {
        let mut migrations = MigrationManager::new(connection.clone())?;
        for migration in builtin_migrations() {
            migrations.register(migration)?;
        }
        let applied = migrations.migrate()?;
        if !applied.is_empty() {
            info!("applied schema migrations {:?}", applied);
        }

        let monitoring = MonitoringService::new(monitoring);
        for rule in alert_rules {
            monitoring.add_alert_rule(rule);
        }

        let active = adapter_slot(Arc::new(SqliteAdapter::new(connection.clone())));
        let events = Arc::new(EventBus::new());
        install_default_triggers(&events, active.clone(), TIMESTAMPED_TABLES);

        Ok(Self {
            transactions: TransactionManager::new(connection.clone()),
            backups: Arc::new(BackupManager::new(connection.clone(), backup_dir)),
            registry: RwLock::new(AdapterRegistry::new(connection.clone())),
            security: Arc::new(SecurityEngine::with_rules(default_rules(active.clone()))),
            events,
            monitoring: Arc::new(monitoring),
            active,
            phase: Mutex::new(MigrationPhase::Idle),
            migration_lock: tokio::sync::Mutex::new(()),
            migrations,
            connection,
        })
    }

    /// Switch to the persisted active backend; stay on SQLite when it is
    /// missing, invalid or unreachable
    async fn activate_stored_backend(&self) {
        let stored = match self.get_active_config() {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(e) => {
                warn!("unable to read the active backend configuration: {}", e);
                return;
            }
        };
        if stored.provider == Provider::Sqlite && stored.config.get("path").is_none() {
            return;
        }
        let created = self.registry().create(stored.provider, &stored.config);
        let candidate = match created {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("stored {} backend is unusable, staying on sqlite: {}", stored.provider, e);
                return;
            }
        };
        if candidate.test_connection().await {
            *self.active.write().await = candidate;
            info!("activated stored {} backend", stored.provider);
        } else {
            warn!("stored {} backend is unreachable, staying on sqlite", stored.provider);
            if let Err(e) = candidate.disconnect().await {
                debug!("disconnecting {} failed: {}", stored.provider, e);
            }
        }
    }

    fn registry(&self) -> RwLockReadGuard<'_, AdapterRegistry> {
        self.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, phase: MigrationPhase) {
        info!("backend migration phase: {}", phase);
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = phase;
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn migrations(&self) -> &MigrationManager {
        &self.migrations
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    pub fn security(&self) -> &Arc<SecurityEngine> {
        &self.security
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn monitoring(&self) -> &Arc<MonitoringService> {
        &self.monitoring
    }

    /// Plug in how adapters for `provider` are built
    pub fn register_adapter_factory<F>(&self, provider: Provider, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn DataAdapter>> + Send + Sync + 'static,
    {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .register_factory(provider, factory);
    }

    pub async fn active_adapter(&self) -> Arc<dyn DataAdapter> {
        self.active.read().await.clone()
    }

    pub async fn active_provider(&self) -> Provider {
        self.active.read().await.provider()
    }

    /// State of the layer's own bookkeeping tables
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.connection
            .with_connection(|conn| SchemaManager::new(conn).check_status())
    }

    pub fn migration_phase(&self) -> MigrationPhase {
        self.phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    // -------------------------------------------------------------------------
    // Universal queries
    // -------------------------------------------------------------------------

    /// Run `query` on behalf of `user`
    pub async fn query(&self, query: UniversalQuery, user: &User) -> Result<QueryResult> {
        let operation = query.operation;
        let collection = query.collection.clone();
        let started = Instant::now();

        let outcome = self.run_query(query, user).await;

        let elapsed = started.elapsed();
        match &outcome {
            Ok(_) => self
                .monitoring
                .record_metric(PerformanceMetric::success(operation.as_str(), &collection, elapsed)),
            Err(e) => {
                let provider = self.active_provider().await;
                error!(
                    provider = %provider,
                    table = %collection,
                    operation = %operation,
                    user = %user.id,
                    "query failed: {}",
                    e
                );
                self.monitoring.record_metric(PerformanceMetric::failure(
                    operation.as_str(),
                    &collection,
                    elapsed,
                    e.kind(),
                ));
            }
        }
        outcome
    }

    async fn run_query(&self, query: UniversalQuery, user: &User) -> Result<QueryResult> {
        let mut query = self.security.enforce(&query, user).await?;
        let adapter = self.active_adapter().await;

        let before = channel(&query.collection, query.operation, Timing::Before);
        let after = channel(&query.collection, query.operation, Timing::After);
        if !self.events.has_subscribers(&before) && !self.events.has_subscribers(&after) {
            return adapter.query(&query, user).await;
        }

        let old_data = match query.operation {
            Operation::Update | Operation::Delete => self.pre_image(adapter.as_ref(), &query).await,
            _ => Vec::new(),
        };

        let mut event = DatabaseEvent::before(&query, user, old_data);
        self.events.emit_before(&mut event).await?;
        query.data = event.data.clone();

        let result = adapter.query(&query, user).await?;
        self.events.emit_after(&event.into_after(result.clone())).await;
        Ok(result)
    }

    /// Rows an update or delete is about to touch; empty when unreadable
    async fn pre_image(&self, adapter: &dyn DataAdapter, query: &UniversalQuery) -> Vec<Row> {
        let mut select = UniversalQuery::select(query.collection.clone());
        select.where_ = query.where_.clone();
        select.or = query.or.clone();
        match adapter.query(&select, &User::system()).await {
            Ok(result) => result.into_rows(),
            Err(e) => {
                warn!("pre-image for {} unavailable: {}", query.describe(), e);
                Vec::new()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Logical backups
    // -------------------------------------------------------------------------

    /// Snapshot the application tables of the active backend
    pub async fn backup(&self) -> Result<BackupPayload> {
        self.active_adapter().await.backup().await
    }

    /// Write a snapshot into the active backend, skipping tables that fail
    pub async fn restore(&self, payload: &BackupPayload) -> Result<RestoreReport> {
        let adapter = self.active_adapter().await;
        let report = adapter.restore(payload).await?;
        if !report.is_complete() {
            warn!(
                "{} restore skipped tables: {}",
                adapter.provider(),
                report.failed_tables.join(", ")
            );
        }
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Backend migration
    // -------------------------------------------------------------------------

    /// Copy every application table to a new backend and switch to it
    ///
    /// The active backend is only replaced after the target holds exactly
    /// the rows of the snapshot. On any failure the target is disconnected,
    /// the original stays active and the report carries
    /// [`MigrationPhase::Failed`]. A second call while one is running is an
    /// error.
    pub async fn migrate_to(&self, provider: Provider, credentials: Value) -> Result<MigrationReport> {
        let Ok(_guard) = self.migration_lock.try_lock() else {
            return Err(DataError::UnsupportedOperation(
                "a backend migration is already running".to_string(),
            ));
        };

        let started = Instant::now();
        let source = self.active_adapter().await;
        let mut report = MigrationReport {
            from: source.provider(),
            to: provider,
            phase: MigrationPhase::Idle,
            backed_up_records: 0,
            restore: None,
            verification: Vec::new(),
            duration_ms: 0,
        };
        info!("migrating from {} to {}", report.from, provider);

        let created = self.registry().create(provider, &credentials);
        let target = match created {
            Ok(target) => target,
            Err(e) => {
                return Ok(self.fail(report, None, MigrationStage::Connecting, e.to_string(), started).await)
            }
        };
        if !target.test_connection().await {
            let reason = format!("{} backend is unreachable", provider);
            return Ok(self
                .fail(report, Some(target), MigrationStage::Connecting, reason, started)
                .await);
        }

        self.set_phase(MigrationPhase::BackingUp);
        let payload = match source.backup().await {
            Ok(payload) => payload,
            Err(e) => {
                return Ok(self
                    .fail(report, Some(target), MigrationStage::BackingUp, e.to_string(), started)
                    .await)
            }
        };
        report.backed_up_records = payload.metadata.total_records;
        if !payload.is_complete() {
            let reason = format!("tables missing from the backup: {}", payload.skipped_tables.join(", "));
            return Ok(self
                .fail(report, Some(target), MigrationStage::BackingUp, reason, started)
                .await);
        }

        self.set_phase(MigrationPhase::Restoring);
        let restored = match target.restore(&payload).await {
            Ok(restored) => restored,
            Err(e) => {
                return Ok(self
                    .fail(report, Some(target), MigrationStage::Restoring, e.to_string(), started)
                    .await)
            }
        };
        let failed_tables = restored.failed_tables.clone();
        report.restore = Some(restored);
        if !failed_tables.is_empty() {
            let reason = format!("tables not restored: {}", failed_tables.join(", "));
            return Ok(self
                .fail(report, Some(target), MigrationStage::Restoring, reason, started)
                .await);
        }

        self.set_phase(MigrationPhase::Verifying);
        for table in payload.restore_order() {
            let expected = payload.data.get(table).map_or(0, |rows| rows.len() as u64);
            let actual = match target.count(table).await {
                Ok(actual) => actual,
                Err(e) => {
                    let reason = format!("counting {} failed: {}", table, e);
                    return Ok(self
                        .fail(report, Some(target), MigrationStage::Verifying, reason, started)
                        .await);
                }
            };
            report.verification.push(TableVerification {
                table: table.to_string(),
                expected,
                actual,
            });
        }
        let mismatched: Vec<String> = report
            .verification
            .iter()
            .filter(|v| !v.matches())
            .map(|v| format!("{} ({} of {})", v.table, v.actual, v.expected))
            .collect();
        if !mismatched.is_empty() {
            let reason = format!("row counts differ: {}", mismatched.join(", "));
            return Ok(self
                .fail(report, Some(target), MigrationStage::Verifying, reason, started)
                .await);
        }

        *self.active.write().await = target;
        if let Err(e) = self.save_config(provider, &credentials) {
            // the switch already happened; only the next startup is affected
            error!("migrated to {} but could not persist it as active: {}", provider, e);
        }
        self.set_phase(MigrationPhase::Swapped);
        report.phase = MigrationPhase::Swapped;
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "migration to {} finished: {} records in {} ms",
            provider, report.backed_up_records, report.duration_ms
        );
        Ok(report)
    }

    async fn fail(
        &self,
        mut report: MigrationReport,
        target: Option<Arc<dyn DataAdapter>>,
        stage: MigrationStage,
        reason: String,
        started: Instant,
    ) -> MigrationReport {
        error!(
            provider = %report.to,
            stage = %stage,
            "backend migration failed, keeping {}: {}",
            report.from,
            reason
        );
        if let Some(target) = target {
            if let Err(e) = target.disconnect().await {
                warn!("disconnecting {} after a failed migration: {}", report.to, e);
            }
        }
        let phase = MigrationPhase::Failed { stage, reason };
        self.set_phase(phase.clone());
        report.phase = phase;
        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }

    // -------------------------------------------------------------------------
    // Backend configuration
    // -------------------------------------------------------------------------

    /// Persist `credentials` for `provider` as the active backend
    ///
    /// Takes effect on the next [`open`](Self::open); use
    /// [`migrate_to`](Self::migrate_to) to switch a running manager.
    pub fn save_config(&self, provider: Provider, credentials: &Value) -> Result<DatabaseConfig> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_timestamp();
        let config = credentials.to_string();
        self.transactions.execute_immediate(|tx| {
            let conn = tx.connection();
            conn.execute(
                "UPDATE database_configs SET is_active = 0, updated_at = ?1 WHERE is_active = 1",
                params![now],
            )
            .map_err(|e| DataError::sqlite("deactivate configs", e))?;
            conn.execute(
                "INSERT INTO database_configs (id, provider, config, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?4)",
                params![id, provider.as_str(), config, now],
            )
            .map_err(|e| DataError::sqlite("save config", e))?;
            Ok::<_, DataError>(())
        })?;
        info!("saved {} as the active backend", provider);

        Ok(DatabaseConfig {
            id,
            provider,
            config: credentials.clone(),
            is_active: true,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_active_config(&self) -> Result<Option<DatabaseConfig>> {
        let parts: Option<ConfigRow> = self.connection.with_connection(|conn| {
            conn.query_row(
                "SELECT id, provider, config, is_active, created_at, updated_at
                 FROM database_configs WHERE is_active = 1
                 ORDER BY updated_at DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
            )
            .optional()
            .map_err(|e| DataError::sqlite("read active config", e))
        })?;
        parts.map(DatabaseConfig::from_parts).transpose()
    }

    /// Every saved configuration, newest first
    pub fn list_configs(&self) -> Result<Vec<DatabaseConfig>> {
        let rows: Vec<ConfigRow> = self.connection.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, provider, config, is_active, created_at, updated_at
                     FROM database_configs ORDER BY created_at DESC, rowid DESC",
                )
                .map_err(|e| DataError::sqlite("list configs", e))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
                })
                .map_err(|e| DataError::sqlite("list configs", e))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| DataError::sqlite("list configs", e))?;
            Ok::<_, DataError>(rows)
        })?;
        rows.into_iter().map(DatabaseConfig::from_parts).collect()
    }

    // -------------------------------------------------------------------------
    // Raw SQL
    // -------------------------------------------------------------------------

    /// Run a raw statement against the embedded database (admins only)
    ///
    /// Every attempt, denied ones included, lands in `query_history`.
    pub fn execute_raw(&self, sql: &str, params: &[Value], user: &User) -> Result<QueryResult> {
        let started = Instant::now();
        let outcome = if user.is_admin() {
            self.run_raw(sql, params)
        } else {
            Err(DataError::PermissionDenied {
                collection: RAW_SQL.to_string(),
                operation: "execute".to_string(),
                reason: format!("raw SQL requires the admin role, user {} is {}", user.id, user.role),
            })
        };
        let elapsed = started.elapsed();

        let error = outcome.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self.record_history(sql, &user.id, elapsed.as_millis() as u64, error.as_deref()) {
            warn!("unable to record query history: {}", e);
        }
        match &outcome {
            Ok(_) => self
                .monitoring
                .record_metric(PerformanceMetric::success("raw", RAW_SQL, elapsed)),
            Err(e) => {
                error!(provider = "sqlite", table = RAW_SQL, operation = "raw", user = %user.id, "raw sql failed: {}", e);
                self.monitoring
                    .record_metric(PerformanceMetric::failure("raw", RAW_SQL, elapsed, e.kind()));
            }
        }
        outcome
    }

    fn run_raw(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let stmt = BuiltStatement {
            sql: sql.to_string(),
            params: params.to_vec(),
        };
        self.connection.with_connection(|conn| {
            let returns_rows = conn
                .prepare(sql)
                .map_err(|e| DataError::sqlite("raw sql", e))?
                .column_count()
                > 0;
            if returns_rows {
                let rows = fetch(conn, &stmt, "raw sql")?;
                return Ok(QueryResult::Rows { rows });
            }
            let count = conn
                .execute(sql, params_from_iter(params.iter().map(to_sql_value)))
                .map_err(|e| DataError::sqlite("raw sql", e))?;
            Ok(QueryResult::Affected {
                count: count as u64,
                rows: Vec::new(),
            })
        })
    }

    fn record_history(&self, sql: &str, user_id: &str, duration_ms: u64, error: Option<&str>) -> Result<()> {
        self.connection.with_connection(|conn| {
            conn.execute(
                "INSERT INTO query_history (sql, user_id, duration_ms, success, error, executed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![sql, user_id, duration_ms as i64, error.is_none(), error, now_timestamp()],
            )
            .map_err(|e| DataError::sqlite("record query history", e))?;
            Ok(())
        })
    }

    /// Most recent raw statements first
    pub fn query_history(&self, limit: usize) -> Result<Vec<QueryHistoryEntry>> {
        self.connection.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, sql, user_id, duration_ms, success, error, executed_at
                     FROM query_history ORDER BY id DESC LIMIT ?1",
                )
                .map_err(|e| DataError::sqlite("read query history", e))?;
            let entries = stmt
                .query_map(params![limit as i64], |row| {
                    Ok(QueryHistoryEntry {
                        id: row.get(0)?,
                        sql: row.get(1)?,
                        user_id: row.get(2)?,
                        duration_ms: row.get::<_, i64>(3)?.max(0) as u64,
                        success: row.get(4)?,
                        error: row.get(5)?,
                        executed_at: row.get(6)?,
                    })
                })
                .map_err(|e| DataError::sqlite("read query history", e))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| DataError::sqlite("read query history", e))?;
            Ok(entries)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::Role;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_member_writes_fire_triggers() {
        let manager = DataAccessManager::open_in_memory().await.unwrap();
        let u1 = User::member("u1");

        manager
            .query(
                UniversalQuery::insert("profiles", row(json!({"id": "u1", "email": "u1@example.com"}))),
                &u1,
            )
            .await
            .unwrap();

        let roles = manager
            .query(UniversalQuery::select("user_roles"), &User::system())
            .await
            .unwrap();
        assert_eq!(roles.count(), 1);
        assert_eq!(manager.monitoring().metric_count(), 2);
    }

    #[tokio::test]
    async fn test_before_handler_veto_blocks_write() {
        let manager = DataAccessManager::open_in_memory().await.unwrap();
        manager.events().on(
            "projects.insert.before",
            |_: &mut DatabaseEvent| -> anyhow::Result<()> { anyhow::bail!("projects are frozen") },
        );

        let err = manager
            .query(
                UniversalQuery::insert("projects", row(json!({"name": "Acme", "creator_id": "u1"}))),
                &User::member("u1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::HandlerRejected { .. }));

        let count = manager.active_adapter().await.count("projects").await.unwrap();
        assert_eq!(count, 0);
        let stats = manager.monitoring().get_statistics(std::time::Duration::from_secs(60));
        assert_eq!(stats.errors_by_type.get("handler_rejected"), Some(&1));
    }

    #[tokio::test]
    async fn test_raw_sql_is_admin_only_and_audited() {
        let manager = DataAccessManager::open_in_memory().await.unwrap();
        let admin = User::new("root", "root@example.com", Role::Admin);

        let err = manager
            .execute_raw("DELETE FROM projects", &[], &User::member("u1"))
            .unwrap_err();
        assert!(matches!(err, DataError::PermissionDenied { .. }));

        manager
            .execute_raw(
                "INSERT INTO projects (id, name, creator_id) VALUES (?1, ?2, ?3)",
                &[json!("p1"), json!("Acme"), json!("root")],
                &admin,
            )
            .unwrap();
        let result = manager
            .execute_raw("SELECT name FROM projects WHERE id = ?1", &[json!("p1")], &admin)
            .unwrap();
        assert_eq!(result.rows()[0]["name"], json!("Acme"));

        let history = manager.query_history(10).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].success);
        assert!(!history[2].success);
        assert_eq!(history[2].user_id, "u1");
    }

    #[tokio::test]
    async fn test_config_persistence_keeps_one_active() {
        let manager = DataAccessManager::open_in_memory().await.unwrap();
        assert!(manager.get_active_config().unwrap().is_none());

        manager
            .save_config(Provider::Supabase, &json!({"url": "https://x.supabase.co", "api_key": "k"}))
            .unwrap();
        manager.save_config(Provider::Sqlite, &json!({})).unwrap();

        let active = manager.get_active_config().unwrap().unwrap();
        assert_eq!(active.provider, Provider::Sqlite);
        let all = manager.list_configs().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|c| c.is_active).count(), 1);
    }

    #[tokio::test]
    async fn test_layer_schema_is_current_after_open() {
        let manager = DataAccessManager::open_in_memory().await.unwrap();
        assert_eq!(manager.schema_status().unwrap(), SchemaStatus::Current);
    }

    #[test]
    fn test_phase_serialization() {
        let phase = MigrationPhase::Failed {
            stage: MigrationStage::Restoring,
            reason: "boom".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&phase).unwrap(),
            json!({"phase": "failed", "stage": "restoring", "reason": "boom"})
        );
        assert_eq!(phase.to_string(), "failed while restoring: boom");
    }
}
