use super::{fail, print_json, print_rows, OutputFormat};
use polystore::database::{builtin_migrations, ConnectionManager, MigrationManager};
use polystore::PolystoreConfig;
use std::sync::Arc;
use serde::Serialize;
use tabled::Tabled;

pub enum SchemaCommand {
    Applied,
    Pending,
    Migrate,
    Rollback,
    Optimize,
}

#[derive(Debug, Serialize, Tabled)]
struct PendingRow {
    version: u32,
    name: String,
}

pub fn run(config: &PolystoreConfig, command: SchemaCommand, output_format: OutputFormat) {
    // not through DataAccessManager, which applies pending migrations on open
    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        fail(format!("Unable to create {}: {}", config.data_dir, e));
    }
    let connection = Arc::new(ConnectionManager::new(
        config.sqlite_path(),
        config.connection_settings(),
    ));
    let mut migrations = match MigrationManager::new(connection.clone()) {
        Ok(m) => m,
        Err(e) => fail(format!("Unable to open the database: {}", e)),
    };
    for migration in builtin_migrations() {
        if let Err(e) = migrations.register(migration) {
            fail(e);
        }
    }

    match command {
        SchemaCommand::Applied => match migrations.applied_migrations() {
            Ok(applied) => print_rows(applied, output_format),
            Err(e) => fail(e),
        },
        SchemaCommand::Pending => match migrations.pending_migrations() {
            Ok(pending) => print_rows(
                pending
                    .into_iter()
                    .map(|(version, name)| PendingRow { version, name }),
                output_format,
            ),
            Err(e) => fail(e),
        },
        SchemaCommand::Migrate => match migrations.migrate() {
            Ok(applied) if output_format.is_json() => print_json(&applied, output_format),
            Ok(applied) if applied.is_empty() => println!("Schema is up to date"),
            Ok(applied) => println!("Applied migrations: {:?}", applied),
            Err(e) => fail(e),
        },
        SchemaCommand::Rollback => match migrations.rollback() {
            Ok(reverted) if output_format.is_json() => print_json(&reverted, output_format),
            Ok(Some(version)) => println!("Rolled back migration v{}", version),
            Ok(None) => println!("Nothing to roll back"),
            Err(e) => fail(e),
        },
        SchemaCommand::Optimize => {
            let result = connection.optimize().and_then(|_| connection.checkpoint());
            match result {
                Ok(()) => println!("Database optimized"),
                Err(e) => fail(e),
            }
        }
    }
}
