//! MongoDB adapter over the Atlas Data API
//!
//! Universal queries are translated into filter documents and sent to the
//! Data API's `action/*` endpoints. Documents keep the universal `id` field;
//! Mongo's own `_id` is stripped from results.

use super::http::{base_url, http_error, like_to_regex};
use super::{blocking, BackupPayload, DataAdapter, Provider, QueryResult, RestoreReport, RESTORE_BATCH_SIZE};
use crate::error::{DataError, Result};
use crate::query::{Condition, Direction, Operation, Operator, Row, UniversalQuery};
use crate::security::User;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoDbConfig {
    /// Data API base URL, e.g. `https://data.mongodb-api.com/app/<app-id>/endpoint/data/v1`
    pub url: String,
    pub api_key: String,
    /// Cluster name
    #[serde(default = "default_data_source")]
    pub data_source: String,
    pub database: String,
}

fn default_data_source() -> String {
    "Cluster0".to_string()
}

pub struct MongoDbAdapter {
    config: MongoDbConfig,
}

impl MongoDbAdapter {
    pub fn new(config: MongoDbConfig) -> Self {
        Self { config }
    }

    /// POST `body` to `action/<action>` for `collection`
    async fn action(&self, action: &str, collection: &str, mut body: Map<String, Value>) -> Result<Value> {
        body.insert("dataSource".to_string(), json!(self.config.data_source));
        body.insert("database".to_string(), json!(self.config.database));
        body.insert("collection".to_string(), json!(collection));

        let url = format!("{}/action/{}", base_url(&self.config.url), action);
        let api_key = self.config.api_key.clone();
        let context = format!("{} on {}", action, collection);
        debug!("mongodb {} -> {}", context, url);

        let ctx = context.clone();
        blocking(Provider::MongoDb, &context, move || {
            ureq::post(&url)
                .header("Content-Type", "application/json")
                .header("api-key", &api_key)
                .send_json(Value::Object(body))
                .map_err(|e| http_error(Provider::MongoDb, ctx.as_str(), e))?
                .body_mut()
                .read_json::<Value>()
                .map_err(|e| http_error(Provider::MongoDb, ctx.as_str(), e))
        })
        .await
    }
}

// =============================================================================
// Translation
// =============================================================================

fn condition_doc(condition: &Condition) -> Value {
    let expr = match condition.operator {
        Operator::Eq => json!({"$eq": condition.value}),
        Operator::Neq => json!({"$ne": condition.value}),
        Operator::Gt => json!({"$gt": condition.value}),
        Operator::Gte => json!({"$gte": condition.value}),
        Operator::Lt => json!({"$lt": condition.value}),
        Operator::Lte => json!({"$lte": condition.value}),
        Operator::Like => json!({
            "$regex": like_to_regex(condition.value.as_str().unwrap_or_default()),
            "$options": "i"
        }),
        Operator::In => json!({"$in": condition.value}),
        Operator::NotIn => json!({"$nin": condition.value}),
        Operator::IsNull => json!({"$eq": Value::Null}),
        Operator::IsNotNull => json!({"$exists": true, "$ne": Value::Null}),
    };
    let mut doc = Map::new();
    doc.insert(condition.field.clone(), expr);
    Value::Object(doc)
}

fn and_doc(conditions: &[Condition]) -> Value {
    match conditions {
        [] => json!({}),
        [single] => condition_doc(single),
        many => json!({"$and": many.iter().map(condition_doc).collect::<Vec<_>>()}),
    }
}

/// Filter document for the query's full predicate
pub(crate) fn filter_document(query: &UniversalQuery) -> Value {
    let groups: Vec<&Vec<Condition>> = query.or.iter().filter(|g| !g.is_empty()).collect();
    if groups.is_empty() {
        return and_doc(&query.where_);
    }
    let mut alternatives = Vec::with_capacity(groups.len() + 1);
    if !query.where_.is_empty() {
        alternatives.push(and_doc(&query.where_));
    }
    alternatives.extend(groups.into_iter().map(|g| and_doc(g)));
    json!({"$or": alternatives})
}

fn strip_mongo_id(value: Value) -> Option<Row> {
    match value {
        Value::Object(mut row) => {
            row.remove("_id");
            Some(row)
        }
        _ => None,
    }
}

fn read_documents(response: &Value) -> Vec<Row> {
    response
        .get("documents")
        .and_then(Value::as_array)
        .map(|docs| docs.iter().cloned().filter_map(strip_mongo_id).collect())
        .unwrap_or_default()
}

fn read_u64(response: &Value, field: &str) -> u64 {
    response.get(field).and_then(Value::as_u64).unwrap_or(0)
}

/// Ensure the document carries a universal `id`
fn with_id(mut data: Row) -> Row {
    if !data.contains_key("id") {
        data.insert("id".to_string(), json!(uuid::Uuid::new_v4().to_string()));
    }
    data
}

#[async_trait]
impl DataAdapter for MongoDbAdapter {
    fn provider(&self) -> Provider {
        Provider::MongoDb
    }

    async fn query(&self, query: &UniversalQuery, _user: &User) -> Result<QueryResult> {
        query.validate()?;
        if !query.join.is_empty() || !query.group_by.is_empty() || !query.aggregate.is_empty() {
            return Err(DataError::UnsupportedOperation(format!(
                "joins, grouping and aggregates are not supported by the mongodb adapter ({})",
                query.describe()
            )));
        }
        let collection = query.collection.as_str();
        let filter = filter_document(query);

        match query.operation {
            Operation::Select => {
                let mut body = Map::new();
                body.insert("filter".to_string(), filter);
                if !query.select.is_empty() {
                    let projection: Map<String, Value> =
                        query.select.iter().map(|f| (f.clone(), json!(1))).collect();
                    body.insert("projection".to_string(), Value::Object(projection));
                }
                if !query.order_by.is_empty() {
                    let sort: Map<String, Value> = query
                        .order_by
                        .iter()
                        .map(|o| {
                            let dir = if o.direction == Direction::Desc { -1 } else { 1 };
                            (o.field.clone(), json!(dir))
                        })
                        .collect();
                    body.insert("sort".to_string(), Value::Object(sort));
                }
                if let Some(limit) = query.limit {
                    body.insert("limit".to_string(), json!(limit));
                }
                if let Some(offset) = query.offset {
                    body.insert("skip".to_string(), json!(offset));
                }
                let response = self.action("find", collection, body).await?;
                Ok(QueryResult::Rows {
                    rows: read_documents(&response),
                })
            }
            Operation::Insert => {
                let document = with_id(query.data.clone().unwrap_or_default());
                let mut body = Map::new();
                body.insert("document".to_string(), Value::Object(document.clone()));
                self.action("insertOne", collection, body).await?;
                Ok(QueryResult::Inserted { row: document })
            }
            Operation::Update => {
                let mut body = Map::new();
                body.insert("filter".to_string(), filter);
                body.insert(
                    "update".to_string(),
                    json!({"$set": query.data.clone().unwrap_or_default()}),
                );
                let response = self.action("updateMany", collection, body).await?;
                Ok(QueryResult::Affected {
                    count: read_u64(&response, "matchedCount"),
                    rows: Vec::new(),
                })
            }
            Operation::Delete => {
                let mut body = Map::new();
                body.insert("filter".to_string(), filter);
                let response = self.action("deleteMany", collection, body).await?;
                Ok(QueryResult::Affected {
                    count: read_u64(&response, "deletedCount"),
                    rows: Vec::new(),
                })
            }
            Operation::Count => {
                let mut body = Map::new();
                body.insert(
                    "pipeline".to_string(),
                    json!([{"$match": filter}, {"$count": "count"}]),
                );
                let response = self.action("aggregate", collection, body).await?;
                let count = read_documents(&response)
                    .first()
                    .and_then(|doc| doc.get("count"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                Ok(QueryResult::Count { count })
            }
        }
    }

    async fn test_connection(&self) -> bool {
        let mut body = Map::new();
        body.insert("filter".to_string(), json!({}));
        self.action("findOne", "profiles", body).await.is_ok()
    }

    async fn disconnect(&self) -> Result<()> {
        // stateless HTTP; nothing to release
        Ok(())
    }

    /// Restore with one `insertMany` per batch
    async fn restore(&self, payload: &BackupPayload) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();
        for table in payload.restore_order() {
            let rows = payload.data.get(table).map(Vec::as_slice).unwrap_or(&[]);
            let mut written = 0u64;
            let mut failure = None;
            for batch in rows.chunks(RESTORE_BATCH_SIZE) {
                let documents: Vec<Value> = batch.iter().cloned().map(Value::Object).collect();
                let mut body = Map::new();
                body.insert("documents".to_string(), Value::Array(documents));
                match self.action("insertMany", table, body).await {
                    Ok(_) => written += batch.len() as u64,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            match failure {
                Some(e) => report.record_failure(Provider::MongoDb, table, &e),
                None => {
                    report.restored.insert(table.to_string(), written);
                }
            }
        }
        info!("mongodb restore wrote {} records", report.total_restored());
        Ok(report)
    }
}
