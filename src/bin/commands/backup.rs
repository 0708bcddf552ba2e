use super::status::format_size;
use super::{fail, print_json, print_rows, OutputFormat};
use clap::{Args, Subcommand};
use polystore::adapter::BackupPayload;
use polystore::database::BackupOptions;
use polystore::{DataAccessManager, PolystoreConfig};
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;

/// Arguments for the Backup command
#[derive(Args)]
pub struct BackupArgs {
    #[clap(subcommand)]
    pub command: Option<BackupCommands>,
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Snapshot the embedded database file
    Create {
        /// Suffix for the snapshot file name
        #[clap(long)]
        label: Option<String>,
    },

    /// List snapshots, newest first (default when no subcommand)
    List,

    /// Delete all but the newest snapshots
    Clean {
        /// Snapshots to keep, defaults to `backup_keep` from the config
        #[clap(long)]
        keep: Option<usize>,
    },

    /// Replace the embedded database with a snapshot
    Restore {
        /// Snapshot file to restore
        #[clap(value_name = "FILE")]
        file: PathBuf,
    },

    /// Write a logical backup of the active backend as JSON
    Export {
        #[clap(value_name = "FILE")]
        file: PathBuf,
    },

    /// Load a logical JSON backup into the active backend
    Import {
        #[clap(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct BackupRow {
    filename: String,
    size: String,
    created_at: String,
}

pub async fn run(config: &PolystoreConfig, args: BackupArgs, output_format: OutputFormat) {
    let manager = match DataAccessManager::open(config).await {
        Ok(manager) => manager,
        Err(e) => fail(format!("Unable to open the database: {}", e)),
    };
    let backups = manager.backups();

    match args.command.unwrap_or(BackupCommands::List) {
        BackupCommands::Create { label } => match backups.create_backup(BackupOptions { label }) {
            Ok(info) if output_format.is_json() => print_json(&info, output_format),
            Ok(info) => println!("Created {} ({})", info.path.display(), format_size(info.size_bytes)),
            Err(e) => fail(e),
        },
        BackupCommands::List => match backups.list_backups() {
            Ok(list) if output_format.is_json() => print_json(&list, output_format),
            Ok(list) => print_rows(
                list.into_iter().map(|b| BackupRow {
                    filename: b.filename,
                    size: format_size(b.size_bytes),
                    created_at: b.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                }),
                output_format,
            ),
            Err(e) => fail(e),
        },
        BackupCommands::Clean { keep } => {
            match backups.clean_old_backups(keep.unwrap_or(config.backup_keep)) {
                Ok(removed) => println!("Removed {} snapshot(s)", removed),
                Err(e) => fail(e),
            }
        }
        BackupCommands::Restore { file } => match backups.restore_backup(&file) {
            Ok(()) => println!("Restored {}", file.display()),
            Err(e) => fail(e),
        },
        BackupCommands::Export { file } => {
            let payload = match manager.backup().await {
                Ok(payload) => payload,
                Err(e) => fail(e),
            };
            let json = match serde_json::to_string_pretty(&payload) {
                Ok(json) => json,
                Err(e) => fail(e),
            };
            if let Err(e) = std::fs::write(&file, json) {
                fail(format!("Unable to write {}: {}", file.display(), e));
            }
            println!(
                "Exported {} records from {} to {}",
                payload.metadata.total_records,
                payload.metadata.provider,
                file.display()
            );
        }
        BackupCommands::Import { file } => {
            let payload: BackupPayload = match std::fs::read_to_string(&file)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
            {
                Ok(payload) => payload,
                Err(e) => fail(format!("Unable to read {}: {}", file.display(), e)),
            };
            match manager.restore(&payload).await {
                Ok(report) if output_format.is_json() => print_json(&report, output_format),
                Ok(report) => {
                    println!("Restored {} records", report.total_restored());
                    if !report.is_complete() {
                        println!("Skipped tables: {}", report.failed_tables.join(", "));
                    }
                }
                Err(e) => fail(e),
            }
        }
    }
}
