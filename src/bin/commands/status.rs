use super::{fail, print_json, OutputFormat};
use polystore::database::{DatabaseStats, SchemaStatus};
use polystore::monitoring::HealthStatus;
use polystore::{DataAccessManager, PolystoreConfig, Provider};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct StatusInfo {
    database_path: String,
    active_provider: Provider,
    layer_schema: SchemaStatus,
    schema_version: u32,
    pending_migrations: usize,
    backups: usize,
    storage: Option<DatabaseStats>,
    health: HealthStatus,
}

pub async fn run(config: &PolystoreConfig, output_format: OutputFormat) {
    let manager = match DataAccessManager::open(config).await {
        Ok(manager) => manager,
        Err(e) => fail(format!("Unable to open the database: {}", e)),
    };

    let layer_schema = match manager.schema_status() {
        Ok(s) => s,
        Err(e) => fail(e),
    };
    let schema_version = match manager.migrations().current_version() {
        Ok(v) => v,
        Err(e) => fail(e),
    };
    let pending_migrations = manager
        .migrations()
        .pending_migrations()
        .map(|p| p.len())
        .unwrap_or_default();
    let backups = manager
        .backups()
        .list_backups()
        .map(|b| b.len())
        .unwrap_or_default();

    let status = StatusInfo {
        database_path: config.sqlite_path().display().to_string(),
        active_provider: manager.active_provider().await,
        layer_schema,
        schema_version,
        pending_migrations,
        backups,
        storage: manager.connection().stats().ok(),
        health: manager.monitoring().get_health_status(),
    };

    if output_format.is_json() {
        print_json(&status, output_format);
        return;
    }

    println!("Polystore Status");
    println!("================\n");
    println!("  Database:         {}", status.database_path);
    println!("  Active Backend:   {}", status.active_provider);
    println!("  Layer Schema:     {}", status.layer_schema);
    println!("  Schema Version:   {}", status.schema_version);
    println!("  Pending:          {}", status.pending_migrations);
    println!("  Backups:          {}", status.backups);
    if let Some(storage) = &status.storage {
        println!("  Journal Mode:     {}", storage.journal_mode);
        println!("  Size:             {}", format_size(storage.file_size + storage.wal_size));
        println!("  Free Pages:       {}", storage.freelist_count);
    }

    let stats = manager.monitoring().get_statistics(Duration::from_secs(5 * 60));
    println!();
    println!("  Health:           {}", status.health.status);
    println!("  Operations (5m):  {}", stats.total_operations);
}

pub(crate) fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
