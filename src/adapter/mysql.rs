//! MySQL adapter
//!
//! Queries are translated into MySQL-dialect SQL, but no driver ships with
//! the crate: execution reports an adapter error. Hosts with a driver can
//! register their own factory for [`Provider::MySql`] and reuse
//! [`MySqlAdapter::translate`].

use super::{DataAdapter, Provider, QueryResult};
use crate::error::{DataError, Result};
use crate::query::{BuiltStatement, Dialect, Operation, QueryBuilder, UniversalQuery};
use crate::security::User;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MySqlConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    3306
}

pub struct MySqlAdapter {
    config: MySqlConfig,
}

impl MySqlAdapter {
    pub fn new(config: MySqlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    /// The statement this adapter would send for `query`
    pub fn translate(query: &UniversalQuery) -> Result<BuiltStatement> {
        query.validate()?;
        let builder = QueryBuilder::from_query(Dialect::MySql, query);
        match query.operation {
            Operation::Select => builder.to_select_sql(),
            Operation::Count => builder.to_count_sql(),
            Operation::Insert => builder.to_insert_sql(&query.data.clone().unwrap_or_default()),
            Operation::Update => builder.to_update_sql(&query.data.clone().unwrap_or_default()),
            Operation::Delete => builder.to_delete_sql(),
        }
    }
}

#[async_trait]
impl DataAdapter for MySqlAdapter {
    fn provider(&self) -> Provider {
        Provider::MySql
    }

    async fn query(&self, query: &UniversalQuery, _user: &User) -> Result<QueryResult> {
        let statement = Self::translate(query)?;
        debug!(
            "mysql {}@{}:{}/{}: {}",
            self.config.user, self.config.host, self.config.port, self.config.database, statement.sql
        );
        Err(DataError::adapter(
            Provider::MySql,
            query.describe(),
            anyhow::anyhow!("no MySQL driver is available in this build"),
        ))
    }

    async fn test_connection(&self) -> bool {
        false
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Operator;
    use serde_json::json;

    #[test]
    fn test_translate_uses_mysql_dialect() {
        let query = UniversalQuery::select("projects")
            .filter("name", Operator::Like, "acme%")
            .where_eq("status", "open")
            .limit(5);
        let stmt = MySqlAdapter::translate(&query).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM `projects` WHERE `name` LIKE ? AND `status` = ? LIMIT 5"
        );
        assert_eq!(stmt.params, vec![json!("acme%"), json!("open")]);
    }

    #[tokio::test]
    async fn test_execution_reports_missing_driver() {
        let adapter = MySqlAdapter::new(
            serde_json::from_value(json!({"user": "app", "database": "app"})).unwrap(),
        );
        assert_eq!(adapter.config().port, 3306);
        assert!(!adapter.test_connection().await);

        let err = adapter
            .query(&UniversalQuery::select("projects"), &User::system())
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Adapter { provider: Provider::MySql, .. }));

        let err = adapter
            .query(&UniversalQuery::delete("projects"), &User::system())
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::MissingPredicate { .. }));
    }
}
