use super::{fail, print_json, OutputFormat};
use clap::Args;
use polystore::query::UniversalQuery;
use polystore::security::{Role, User};
use polystore::{DataAccessManager, PolystoreConfig, QueryResult};
use serde_json::Value;

/// Arguments shared by the Query and Sql commands
#[derive(Args)]
pub struct CallerArgs {
    /// Caller id
    #[clap(long, default_value = "cli")]
    pub user: String,

    /// Caller role: admin, moderator or member
    #[clap(long, default_value = "admin")]
    pub role: String,
}

impl CallerArgs {
    fn user(&self) -> User {
        let role = match self.role.to_lowercase().as_str() {
            "admin" => Role::Admin,
            "moderator" => Role::Moderator,
            "member" => Role::Member,
            other => fail(format!("unknown role '{}'", other)),
        };
        User::new(self.user.clone(), format!("{}@cli.local", self.user), role)
    }
}

/// Arguments for the Query command
#[derive(Args)]
pub struct QueryArgs {
    /// Universal query as JSON, e.g. '{"collection":"projects","operation":"select"}'
    pub query: String,

    #[clap(flatten)]
    pub caller: CallerArgs,
}

/// Arguments for the Sql command
#[derive(Args)]
pub struct SqlArgs {
    /// Statement to run against the embedded database
    pub sql: String,

    /// Positional parameters as JSON values
    #[clap(long = "param")]
    pub params: Vec<String>,

    #[clap(flatten)]
    pub caller: CallerArgs,
}

fn print_result(result: &QueryResult, output_format: OutputFormat) {
    if output_format.is_json() {
        print_json(result, output_format);
        return;
    }
    match result {
        QueryResult::Count { count } => println!("{}", count),
        QueryResult::Affected { count, rows } if rows.is_empty() => println!("{} row(s) affected", count),
        _ => {
            for row in result.rows() {
                println!("{}", Value::Object(row.clone()));
            }
        }
    }
}

pub async fn run_query(config: &PolystoreConfig, args: QueryArgs, output_format: OutputFormat) {
    let value: Value = match serde_json::from_str(&args.query) {
        Ok(value) => value,
        Err(e) => fail(format!("query is not valid JSON: {}", e)),
    };
    let query = match UniversalQuery::from_json(value) {
        Ok(query) => query,
        Err(e) => fail(e),
    };
    let manager = match DataAccessManager::open(config).await {
        Ok(manager) => manager,
        Err(e) => fail(format!("Unable to open the database: {}", e)),
    };
    match manager.query(query, &args.caller.user()).await {
        Ok(result) => print_result(&result, output_format),
        Err(e) => fail(e),
    }
}

pub async fn run_sql(config: &PolystoreConfig, args: SqlArgs, output_format: OutputFormat) {
    let params: Vec<Value> = args
        .params
        .iter()
        // bare words are taken as strings
        .map(|p| serde_json::from_str(p).unwrap_or_else(|_| Value::String(p.clone())))
        .collect();
    let manager = match DataAccessManager::open(config).await {
        Ok(manager) => manager,
        Err(e) => fail(format!("Unable to open the database: {}", e)),
    };
    match manager.execute_raw(&args.sql, &params, &args.caller.user()) {
        Ok(result) => print_result(&result, output_format),
        Err(e) => fail(e),
    }
}
