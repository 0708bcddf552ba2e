use super::{fail, print_json, OutputFormat};
use clap::{Args, Subcommand};
use polystore::{DataAccessManager, PolystoreConfig};
use serde::Serialize;
use serde_json::Value;

/// Arguments for the Config command
#[derive(Args)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub command: Option<ConfigCommands>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the local configuration and saved backends (default)
    Show,

    /// Save backend credentials as active for the next start
    Set {
        /// sqlite, postgres, mysql, mongodb, supabase or firestore
        provider: String,

        /// Credentials as a JSON object
        #[clap(default_value = "{}")]
        credentials: String,
    },
}

#[derive(Debug, Serialize)]
struct SavedBackend {
    id: String,
    provider: String,
    is_active: bool,
    updated_at: String,
}

#[derive(Debug, Serialize)]
struct ConfigInfo {
    config_file: String,
    data_dir: String,
    database: String,
    backup_dir: String,
    backends: Vec<SavedBackend>,
}

pub async fn run(config: &PolystoreConfig, args: ConfigArgs, output_format: OutputFormat) {
    let manager = match DataAccessManager::open(config).await {
        Ok(manager) => manager,
        Err(e) => fail(format!("Unable to open the database: {}", e)),
    };

    match args.command.unwrap_or(ConfigCommands::Show) {
        ConfigCommands::Show => {
            let backends = match manager.list_configs() {
                Ok(configs) => configs
                    .into_iter()
                    .map(|c| SavedBackend {
                        id: c.id,
                        provider: c.provider.to_string(),
                        is_active: c.is_active,
                        updated_at: c.updated_at,
                    })
                    .collect(),
                Err(e) => fail(e),
            };
            let info = ConfigInfo {
                config_file: PolystoreConfig::config_file_path(),
                data_dir: config.data_dir.clone(),
                database: config.sqlite_path().display().to_string(),
                backup_dir: config.backup_dir().display().to_string(),
                backends,
            };
            if output_format.is_json() {
                print_json(&info, output_format);
                return;
            }
            println!("Configuration File: {}", info.config_file);
            println!("{}", config.summary());
            println!();
            if info.backends.is_empty() {
                println!("No saved backends, using the embedded sqlite database");
            }
            for backend in &info.backends {
                let marker = if backend.is_active { "*" } else { " " };
                println!(
                    "{} {:<10} {}  (updated {})",
                    marker, backend.provider, backend.id, backend.updated_at
                );
            }
        }
        ConfigCommands::Set {
            provider,
            credentials,
        } => {
            let provider = match provider.parse() {
                Ok(p) => p,
                Err(e) => fail(e),
            };
            let credentials: Value = match serde_json::from_str(&credentials) {
                Ok(v) => v,
                Err(e) => fail(format!("credentials must be a JSON object: {}", e)),
            };
            match manager.save_config(provider, &credentials) {
                Ok(saved) => println!("Saved {} as the active backend ({})", saved.provider, saved.id),
                Err(e) => fail(e),
            }
        }
    }
}
