//! Universal query model
//!
//! A [`UniversalQuery`] is the backend-agnostic request every adapter accepts.
//! It can be assembled fluently or parsed from JSON:
//!
//! ```rust,ignore
//! use polystore::query::{Operator, UniversalQuery};
//!
//! let query = UniversalQuery::select("projects")
//!     .filter("status", Operator::Eq, "active")
//!     .order_by_desc("created_at")
//!     .limit(20);
//! ```
//!
//! Semantics: `where` conditions are AND-combined. Every `or` entry is an
//! AND-group of its own; the groups are OR-combined with the `where` group.

pub mod builder;
pub mod identifier;

pub use builder::{BuiltStatement, Dialect, QueryBuilder};
pub use identifier::{validate_identifier, validate_qualified_identifier};

use crate::error::{DataError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A single row/document as returned by any adapter
pub type Row = Map<String, Value>;

// =============================================================================
// Operation
// =============================================================================

/// The five operations the universal interface supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Count,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Select => "select",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Count => "count",
        }
    }

    /// Whether the operation mutates stored data
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Operation::Insert | Operation::Update | Operation::Delete
        )
    }

    /// Whether the operation must carry at least one `where` condition
    pub fn requires_predicate(&self) -> bool {
        matches!(self, Operation::Update | Operation::Delete)
    }
}

impl FromStr for Operation {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "select" => Ok(Operation::Select),
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            "count" => Ok(Operation::Count),
            other => Err(DataError::UnsupportedOperation(other.to_string())),
        }
    }
}

impl TryFrom<String> for Operation {
    type Error = DataError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// Comparison operators usable in a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl Operator {
    /// Whether the operator ignores its value
    pub fn is_unary(&self) -> bool {
        matches!(self, Operator::IsNull | Operator::IsNotNull)
    }
}

/// A `{field, operator, value}` predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Eq, value)
    }

    /// Evaluate the condition against an in-memory row
    ///
    /// Used by adapters that post-filter documents and by event handlers.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.field).unwrap_or(&Value::Null);
        match self.operator {
            Operator::IsNull => actual.is_null(),
            Operator::IsNotNull => !actual.is_null(),
            Operator::Eq => loose_eq(actual, &self.value),
            Operator::Neq => !loose_eq(actual, &self.value),
            Operator::Gt => compare(actual, &self.value).is_some_and(|o| o.is_gt()),
            Operator::Gte => compare(actual, &self.value).is_some_and(|o| o.is_ge()),
            Operator::Lt => compare(actual, &self.value).is_some_and(|o| o.is_lt()),
            Operator::Lte => compare(actual, &self.value).is_some_and(|o| o.is_le()),
            Operator::In => self
                .value
                .as_array()
                .is_some_and(|items| items.iter().any(|v| loose_eq(actual, v))),
            Operator::NotIn => self
                .value
                .as_array()
                .map_or(true, |items| !items.iter().any(|v| loose_eq(actual, v))),
            Operator::Like => match (actual.as_str(), self.value.as_str()) {
                (Some(text), Some(pattern)) => like_match(text, pattern),
                _ => false,
            },
        }
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQL LIKE semantics: `%` any run, `_` one character, case-insensitive
fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let (mut t, mut p) = (0usize, 0usize);
    let (mut star_p, mut star_t) = (None, 0usize);
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            star_p = Some(p);
            star_t = t;
            p += 1;
        } else if let Some(sp) = star_p {
            p = sp + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}

// =============================================================================
// Ordering, joins, aggregates
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
}

/// `JOIN <table> ON <left_field> = <right_field>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub table: String,
    #[serde(default)]
    pub kind: JoinKind,
    pub left_field: String,
    pub right_field: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }
}

/// An aggregate projection such as `COUNT(*) AS total`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub function: AggregateFunction,
    /// Column to aggregate; `None` means `*`
    #[serde(default)]
    pub field: Option<String>,
    pub alias: String,
}

// =============================================================================
// UniversalQuery
// =============================================================================

/// The vendor-neutral request object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniversalQuery {
    pub collection: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Row>,
    #[serde(default, rename = "where", skip_serializing_if = "Vec::is_empty")]
    pub where_: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub or: Vec<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub join: Vec<Join>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregate: Vec<Aggregate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
}

impl UniversalQuery {
    pub fn new(collection: impl Into<String>, operation: Operation) -> Self {
        Self {
            collection: collection.into(),
            operation,
            data: None,
            where_: Vec::new(),
            or: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            select: Vec::new(),
            join: Vec::new(),
            aggregate: Vec::new(),
            group_by: Vec::new(),
        }
    }

    pub fn select(collection: impl Into<String>) -> Self {
        Self::new(collection, Operation::Select)
    }

    pub fn insert(collection: impl Into<String>, data: Row) -> Self {
        Self::new(collection, Operation::Insert).with_data(data)
    }

    pub fn update(collection: impl Into<String>, data: Row) -> Self {
        Self::new(collection, Operation::Update).with_data(data)
    }

    pub fn delete(collection: impl Into<String>) -> Self {
        Self::new(collection, Operation::Delete)
    }

    pub fn count(collection: impl Into<String>) -> Self {
        Self::new(collection, Operation::Count)
    }

    /// Parse a query from its JSON form
    ///
    /// An unknown `operation` value is reported as
    /// [`DataError::UnsupportedOperation`] rather than a generic parse error.
    pub fn from_json(value: Value) -> Result<Self> {
        if let Some(op) = value.get("operation").and_then(Value::as_str) {
            op.parse::<Operation>()?;
        }
        serde_json::from_value(value)
            .map_err(|e| DataError::UnsupportedOperation(format!("malformed query: {}", e)))
    }

    pub fn with_data(mut self, data: Row) -> Self {
        self.data = Some(data);
        self
    }

    pub fn filter(mut self, field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        self.where_.push(Condition::new(field, operator, value));
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Operator::Eq, value)
    }

    pub fn or_group(mut self, group: Vec<Condition>) -> Self {
        self.or.push(group);
        self
    }

    pub fn order_by_asc(mut self, field: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction: Direction::Asc,
        });
        self
    }

    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction: Direction::Desc,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.select = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.join.push(join);
        self
    }

    pub fn aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregate.push(aggregate);
        self
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by.push(field.into());
        self
    }

    /// Whether any predicate is present
    pub fn has_predicate(&self) -> bool {
        !self.where_.is_empty() || self.or.iter().any(|g| !g.is_empty())
    }

    /// Restrict the query to rows matching `condition`
    ///
    /// The condition is added to every non-empty predicate group, so an `or`
    /// clause can never widen the result past the scope. An empty `where`
    /// next to `or` groups stays empty; it does not take part in the match.
    pub fn scope(mut self, condition: Condition) -> Self {
        let has_groups = self.or.iter().any(|g| !g.is_empty());
        for group in self.or.iter_mut().filter(|g| !g.is_empty()) {
            group.push(condition.clone());
        }
        if !self.where_.is_empty() || !has_groups {
            self.where_.push(condition);
        }
        self
    }

    /// Evaluate the full predicate (`where` OR any `or` group) against a row
    pub fn matches(&self, row: &Row) -> bool {
        let where_ok = self.where_.iter().all(|c| c.matches(row));
        let mut groups = self.or.iter().filter(|g| !g.is_empty()).peekable();
        if groups.peek().is_none() {
            return where_ok;
        }
        (!self.where_.is_empty() && where_ok) || groups.any(|g| g.iter().all(|c| c.matches(row)))
    }

    /// Structural validation shared by every adapter and the security engine
    ///
    /// Checks identifiers, the predicate requirement for update/delete and
    /// the payload requirement for insert/update.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.collection)?;

        let conditions = self.where_.iter().chain(self.or.iter().flatten());
        for condition in conditions {
            validate_qualified_identifier(&condition.field)?;
        }
        for field in &self.select {
            if field != "*" {
                validate_qualified_identifier(field)?;
            }
        }
        for order in &self.order_by {
            validate_qualified_identifier(&order.field)?;
        }
        for field in &self.group_by {
            validate_qualified_identifier(field)?;
        }
        for join in &self.join {
            validate_identifier(&join.table)?;
            validate_qualified_identifier(&join.left_field)?;
            validate_qualified_identifier(&join.right_field)?;
        }
        for agg in &self.aggregate {
            validate_identifier(&agg.alias)?;
            if let Some(field) = &agg.field {
                validate_qualified_identifier(field)?;
            }
        }

        if self.operation.requires_predicate() && !self.has_predicate() {
            return Err(DataError::missing_predicate(
                &self.collection,
                self.operation,
            ));
        }

        match self.operation {
            Operation::Insert | Operation::Update => {
                let data = self.data.as_ref().ok_or_else(|| {
                    DataError::UnsupportedOperation(format!(
                        "{} on '{}' requires a data payload",
                        self.operation, self.collection
                    ))
                })?;
                if data.is_empty() {
                    return Err(DataError::UnsupportedOperation(format!(
                        "{} on '{}' has an empty data payload",
                        self.operation, self.collection
                    )));
                }
                for key in data.keys() {
                    validate_identifier(key)?;
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// A short human-readable description for logs
    pub fn describe(&self) -> String {
        format!("{} on {}", self.operation, self.collection)
    }
}
