use super::{fail, print_json, print_rows, OutputFormat};
use clap::Args;
use polystore::{DataAccessManager, PolystoreConfig, Provider};
use serde_json::Value;

/// Arguments for the Switch command
#[derive(Args)]
pub struct SwitchArgs {
    /// Target backend: sqlite, postgres, mysql, mongodb, supabase or firestore
    pub provider: Provider,

    /// Target credentials as a JSON object
    #[clap(default_value = "{}")]
    pub credentials: String,
}

pub async fn run(config: &PolystoreConfig, args: SwitchArgs, output_format: OutputFormat) {
    let credentials: Value = match serde_json::from_str(&args.credentials) {
        Ok(v) => v,
        Err(e) => fail(format!("credentials must be a JSON object: {}", e)),
    };
    let manager = match DataAccessManager::open(config).await {
        Ok(manager) => manager,
        Err(e) => fail(format!("Unable to open the database: {}", e)),
    };

    let report = match manager.migrate_to(args.provider, credentials).await {
        Ok(report) => report,
        Err(e) => fail(e),
    };

    if output_format.is_json() {
        print_json(&report, output_format);
    } else {
        if !report.verification.is_empty() {
            print_rows(report.verification.iter().cloned(), output_format);
        }
        println!("{} -> {}: {} ({} ms)", report.from, report.to, report.phase, report.duration_ms);
    }
    if !report.succeeded() {
        std::process::exit(1);
    }
}
