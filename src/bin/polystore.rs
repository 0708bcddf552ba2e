#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use clap::{Parser, Subcommand};
use polystore::PolystoreConfig;
use tracing::Level;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::backup::BackupArgs;
use commands::config::ConfigArgs;
use commands::query::{QueryArgs, SqlArgs};
use commands::schema::SchemaCommand;
use commands::switch::SwitchArgs;
use commands::OutputFormat;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// configuration file path, by default $HOME/.polystore/polystore.toml is used
    #[clap(short, long)]
    config: Option<String>,

    /// Print debug information
    #[clap(long, global = true)]
    debug: bool,

    /// Output format: table (default), markdown, json, json-pretty
    #[clap(short, long, global = true, default_value = "table")]
    format: OutputFormat,

    /// Shortcut for --format json
    #[clap(long, global = true)]
    json: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Active backend, schema version, storage and health
    Status,

    /// Apply pending schema migrations
    Migrate,

    /// Revert the most recently applied schema migration
    Rollback,

    /// Schema migrations registered but not applied yet
    Pending,

    /// Schema migrations already applied
    Applied,

    /// Run the storage optimizer and checkpoint the WAL
    Optimize,

    /// File snapshots and logical exports
    Backup(BackupArgs),

    /// Local configuration and saved backends
    Config(ConfigArgs),

    /// Copy all data to another backend and switch to it
    Switch(SwitchArgs),

    /// Run a universal query through authorization and events
    Query(QueryArgs),

    /// Run raw SQL against the embedded database (admin only)
    Sql(SqlArgs),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match PolystoreConfig::new(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    if cli.debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::DEBUG.as_str())),
            )
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_writer(std::io::stderr)
            .init();
    }

    let output_format = if cli.json { OutputFormat::Json } else { cli.format };

    match cli.command {
        Commands::Status => commands::status::run(&config, output_format).await,
        Commands::Migrate => commands::schema::run(&config, SchemaCommand::Migrate, output_format),
        Commands::Rollback => commands::schema::run(&config, SchemaCommand::Rollback, output_format),
        Commands::Pending => commands::schema::run(&config, SchemaCommand::Pending, output_format),
        Commands::Applied => commands::schema::run(&config, SchemaCommand::Applied, output_format),
        Commands::Optimize => commands::schema::run(&config, SchemaCommand::Optimize, output_format),
        Commands::Backup(args) => commands::backup::run(&config, args, output_format).await,
        Commands::Config(args) => commands::config::run(&config, args, output_format).await,
        Commands::Switch(args) => commands::switch::run(&config, args, output_format).await,
        Commands::Query(args) => commands::query::run_query(&config, args, output_format).await,
        Commands::Sql(args) => commands::query::run_sql(&config, args, output_format).await,
    }
}
