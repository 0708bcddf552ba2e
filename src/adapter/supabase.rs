//! Supabase adapter over the PostgREST HTTP interface
//!
//! Filters become PostgREST query parameters (`status=eq.open`); `or` groups
//! are folded into a single `or=(...)` logic tree so the universal
//! `where OR group` semantics survive the translation. Writes ask for
//! `return=representation` so affected rows come back; counts use
//! `count=exact` and read the total from `Content-Range`.

use super::http::{base_url, http_error};
use super::{blocking, BackupPayload, DataAdapter, Provider, QueryResult, RestoreReport, RESTORE_BATCH_SIZE};
use crate::error::{DataError, Result};
use crate::query::{Condition, Direction, Operation, Operator, Row, UniversalQuery};
use crate::security::User;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseConfig {
    /// Project URL, e.g. `https://<ref>.supabase.co`
    pub url: String,
    /// Anon or service-role key
    pub api_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Head,
    Post,
    Patch,
    Delete,
}

/// One PostgREST exchange
#[derive(Debug)]
struct RestRequest {
    method: Method,
    table: String,
    params: Vec<(String, String)>,
    body: Option<Value>,
    prefer: Option<&'static str>,
}

impl RestRequest {
    fn new(method: Method, table: &str) -> Self {
        Self {
            method,
            table: table.to_string(),
            params: Vec::new(),
            body: None,
            prefer: None,
        }
    }
}

struct RestResponse {
    body: Value,
    content_range: Option<String>,
}

pub struct SupabaseAdapter {
    config: SupabaseConfig,
}

impl SupabaseAdapter {
    pub fn new(config: SupabaseConfig) -> Self {
        Self { config }
    }

    async fn send(&self, request: RestRequest) -> Result<RestResponse> {
        let url = format!("{}/rest/v1/{}", base_url(&self.config.url), request.table);
        let api_key = self.config.api_key.clone();
        let context = format!("{:?} {}", request.method, request.table).to_lowercase();
        debug!("supabase {} {:?}", context, request.params);

        let ctx = context.clone();
        blocking(Provider::Supabase, &context, move || {
            fn decorate<B>(
                mut builder: ureq::RequestBuilder<B>,
                api_key: &str,
                request: &RestRequest,
            ) -> ureq::RequestBuilder<B> {
                builder = builder
                    .header("apikey", api_key)
                    .header("Authorization", &format!("Bearer {}", api_key));
                if let Some(prefer) = request.prefer {
                    builder = builder.header("Prefer", prefer);
                }
                for (key, value) in &request.params {
                    builder = builder.query(key, value);
                }
                builder
            }

            let body = request.body.clone().unwrap_or(Value::Null);
            let sent = match request.method {
                Method::Get => decorate(ureq::get(&url), &api_key, &request).call(),
                Method::Head => decorate(ureq::head(&url), &api_key, &request).call(),
                Method::Delete => decorate(ureq::delete(&url), &api_key, &request).call(),
                Method::Post => decorate(ureq::post(&url), &api_key, &request).send_json(&body),
                Method::Patch => decorate(ureq::patch(&url), &api_key, &request).send_json(&body),
            };
            let mut response = sent.map_err(|e| http_error(Provider::Supabase, ctx.as_str(), e))?;

            let content_range = response
                .headers()
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = response
                .body_mut()
                .read_to_string()
                .map_err(|e| http_error(Provider::Supabase, ctx.as_str(), e))?;
            let body = if text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text)
                    .map_err(|e| DataError::adapter(Provider::Supabase, ctx.as_str(), e))?
            };
            Ok(RestResponse { body, content_range })
        })
        .await
    }
}

// =============================================================================
// Translation
// =============================================================================

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Double-quote values that contain PostgREST delimiters
fn quoted(raw: String) -> String {
    if raw.chars().any(|c| matches!(c, ',' | '.' | ':' | '(' | ')' | '"' | '\\' | ' ')) {
        format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        raw
    }
}

fn list(value: &Value) -> String {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|item| quoted(literal(item)))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

/// `op.value` for a condition; `nested` values sit inside a logic tree and get quoted
fn operand(condition: &Condition, nested: bool) -> String {
    let value = &condition.value;
    let scalar = |raw: String| if nested { quoted(raw) } else { raw };
    match condition.operator {
        Operator::Eq if value.is_null() => "is.null".to_string(),
        Operator::Neq if value.is_null() => "not.is.null".to_string(),
        Operator::Eq => format!("eq.{}", scalar(literal(value))),
        Operator::Neq => format!("neq.{}", scalar(literal(value))),
        Operator::Gt => format!("gt.{}", scalar(literal(value))),
        Operator::Gte => format!("gte.{}", scalar(literal(value))),
        Operator::Lt => format!("lt.{}", scalar(literal(value))),
        Operator::Lte => format!("lte.{}", scalar(literal(value))),
        Operator::Like => format!("ilike.{}", scalar(literal(value).replace('%', "*"))),
        Operator::In => format!("in.({})", list(value)),
        Operator::NotIn => format!("not.in.({})", list(value)),
        Operator::IsNull => "is.null".to_string(),
        Operator::IsNotNull => "not.is.null".to_string(),
    }
}

fn and_expr(group: &[Condition]) -> String {
    let nested = |c: &Condition| format!("{}.{}", c.field, operand(c, true));
    match group {
        [single] => nested(single),
        many => format!("and({})", many.iter().map(nested).collect::<Vec<_>>().join(",")),
    }
}

/// Query parameters expressing the query's full predicate
pub(crate) fn filter_params(query: &UniversalQuery) -> Vec<(String, String)> {
    let groups: Vec<&Vec<Condition>> = query.or.iter().filter(|g| !g.is_empty()).collect();
    if groups.is_empty() {
        return query
            .where_
            .iter()
            .map(|c| (c.field.clone(), operand(c, false)))
            .collect();
    }
    let mut alternatives = Vec::with_capacity(groups.len() + 1);
    if !query.where_.is_empty() {
        alternatives.push(and_expr(&query.where_));
    }
    alternatives.extend(groups.into_iter().map(|g| and_expr(g)));
    vec![("or".to_string(), format!("({})", alternatives.join(",")))]
}

fn select_params(query: &UniversalQuery) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let select = if query.select.is_empty() {
        "*".to_string()
    } else {
        query.select.join(",")
    };
    params.push(("select".to_string(), select));
    params.extend(filter_params(query));
    if !query.order_by.is_empty() {
        let order = query
            .order_by
            .iter()
            .map(|o| {
                let dir = if o.direction == Direction::Desc { "desc" } else { "asc" };
                format!("{}.{}", o.field, dir)
            })
            .collect::<Vec<_>>()
            .join(",");
        params.push(("order".to_string(), order));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = query.offset {
        params.push(("offset".to_string(), offset.to_string()));
    }
    params
}

/// Total from a `Content-Range` header such as `0-24/573` or `*/0`
fn parse_content_range(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}

fn into_rows(body: Value) -> Vec<Row> {
    match body {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(row) => Some(row),
                _ => None,
            })
            .collect(),
        Value::Object(row) => vec![row],
        _ => Vec::new(),
    }
}

#[async_trait]
impl DataAdapter for SupabaseAdapter {
    fn provider(&self) -> Provider {
        Provider::Supabase
    }

    async fn query(&self, query: &UniversalQuery, _user: &User) -> Result<QueryResult> {
        query.validate()?;
        if !query.join.is_empty() || !query.group_by.is_empty() || !query.aggregate.is_empty() {
            return Err(DataError::UnsupportedOperation(format!(
                "joins and aggregates are not supported by the supabase adapter ({})",
                query.describe()
            )));
        }
        let table = query.collection.as_str();

        match query.operation {
            Operation::Select => {
                let mut request = RestRequest::new(Method::Get, table);
                request.params = select_params(query);
                let response = self.send(request).await?;
                Ok(QueryResult::Rows {
                    rows: into_rows(response.body),
                })
            }
            Operation::Count => {
                let mut request = RestRequest::new(Method::Head, table);
                request.params = filter_params(query);
                request.prefer = Some("count=exact");
                let response = self.send(request).await?;
                let count = response
                    .content_range
                    .as_deref()
                    .and_then(parse_content_range)
                    .ok_or_else(|| {
                        DataError::adapter(
                            Provider::Supabase,
                            query.describe(),
                            anyhow::anyhow!("response carried no usable Content-Range header"),
                        )
                    })?;
                Ok(QueryResult::Count { count })
            }
            Operation::Insert => {
                let mut request = RestRequest::new(Method::Post, table);
                request.body = query.data.clone().map(Value::Object);
                request.prefer = Some("return=representation");
                let response = self.send(request).await?;
                let row = into_rows(response.body)
                    .into_iter()
                    .next()
                    .or_else(|| query.data.clone())
                    .unwrap_or_default();
                Ok(QueryResult::Inserted { row })
            }
            Operation::Update => {
                let mut request = RestRequest::new(Method::Patch, table);
                request.params = filter_params(query);
                request.body = query.data.clone().map(Value::Object);
                request.prefer = Some("return=representation");
                let rows = into_rows(self.send(request).await?.body);
                Ok(QueryResult::Affected {
                    count: rows.len() as u64,
                    rows,
                })
            }
            Operation::Delete => {
                let mut request = RestRequest::new(Method::Delete, table);
                request.params = filter_params(query);
                request.prefer = Some("return=representation");
                let rows = into_rows(self.send(request).await?.body);
                Ok(QueryResult::Affected {
                    count: rows.len() as u64,
                    rows,
                })
            }
        }
    }

    async fn test_connection(&self) -> bool {
        let mut request = RestRequest::new(Method::Get, "profiles");
        request.params = vec![
            ("select".to_string(), "id".to_string()),
            ("limit".to_string(), "1".to_string()),
        ];
        self.send(request).await.is_ok()
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Restore with one bulk insert per batch
    async fn restore(&self, payload: &BackupPayload) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();
        for table in payload.restore_order() {
            let rows = payload.data.get(table).map(Vec::as_slice).unwrap_or(&[]);
            let mut written = 0u64;
            let mut failure = None;
            for batch in rows.chunks(RESTORE_BATCH_SIZE) {
                let mut request = RestRequest::new(Method::Post, table);
                request.body = Some(Value::Array(batch.iter().cloned().map(Value::Object).collect()));
                request.prefer = Some("return=minimal");
                match self.send(request).await {
                    Ok(_) => written += batch.len() as u64,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            match failure {
                Some(e) => report.record_failure(Provider::Supabase, table, &e),
                None => {
                    report.restored.insert(table.to_string(), written);
                }
            }
        }
        info!("supabase restore wrote {} records", report.total_restored());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(params: &[(String, String)]) -> Vec<(&str, &str)> {
        params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }

    #[test]
    fn test_plain_filters() {
        let query = UniversalQuery::select("projects")
            .where_eq("creator_id", "u1")
            .filter("budget", Operator::Gt, 100)
            .filter("name", Operator::Like, "%promo%")
            .filter("status", Operator::In, json!(["open", "in review"]))
            .filter("deleted_at", Operator::IsNull, Value::Null);
        assert_eq!(
            pairs(&filter_params(&query)),
            vec![
                ("creator_id", "eq.u1"),
                ("budget", "gt.100"),
                ("name", "ilike.*promo*"),
                ("status", "in.(open,\"in review\")"),
                ("deleted_at", "is.null"),
            ]
        );
    }

    #[test]
    fn test_or_groups_fold_into_logic_tree() {
        let query = UniversalQuery::select("projects")
            .where_eq("creator_id", "u1")
            .where_eq("status", "open")
            .or_group(vec![Condition::eq("status", "a.b")]);
        assert_eq!(
            pairs(&filter_params(&query)),
            vec![(
                "or",
                "(and(creator_id.eq.u1,status.eq.open),status.eq.\"a.b\")"
            )]
        );
    }

    #[test]
    fn test_select_params() {
        let query = UniversalQuery::select("projects")
            .fields(&["id", "name"])
            .order_by_desc("created_at")
            .limit(10)
            .offset(20);
        assert_eq!(
            pairs(&select_params(&query)),
            vec![
                ("select", "id,name"),
                ("order", "created_at.desc"),
                ("limit", "10"),
                ("offset", "20"),
            ]
        );
    }

    #[test]
    fn test_content_range() {
        assert_eq!(parse_content_range("0-24/573"), Some(573));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("0-24/*"), None);
    }

    #[test]
    fn test_into_rows() {
        let rows = into_rows(json!([{"id": "p1"}, 3, {"id": "p2"}]));
        assert_eq!(rows.len(), 2);
        assert!(into_rows(Value::Null).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_project_is_adapter_error() {
        let adapter = SupabaseAdapter::new(SupabaseConfig {
            url: "http://127.0.0.1:9".to_string(),
            api_key: "anon".to_string(),
        });
        let err = adapter
            .query(&UniversalQuery::select("projects"), &User::system())
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Adapter { provider: Provider::Supabase, .. }));
        assert!(!adapter.test_connection().await);
    }
}
