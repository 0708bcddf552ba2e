//! Parameterized SQL builder
//!
//! Translates structural query intent into statement text plus a positional
//! parameter list. Values are always bound; identifiers are validated and
//! quoted for the target dialect.
//!
//! ```rust,ignore
//! use polystore::query::{Dialect, Operator, QueryBuilder};
//!
//! let stmt = QueryBuilder::new(Dialect::Sqlite)
//!     .from("projects")
//!     .select(&["id", "name"])
//!     .filter("status", Operator::In, serde_json::json!(["open", "draft"]))
//!     .order_by_desc("created_at")
//!     .limit(10)
//!     .to_select_sql()?;
//! // SELECT "id", "name" FROM "projects" WHERE "status" IN (?, ?) ORDER BY "created_at" DESC LIMIT 10
//! ```

use super::identifier::{validate_identifier, validate_qualified_identifier};
use super::{
    Aggregate, AggregateFunction, Condition, Direction, Join, JoinKind, Operator, OrderBy, Row,
    UniversalQuery,
};
use crate::error::{DataError, Result};
use serde_json::Value;

/// SQL dialect the statement is rendered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    /// Quote a (possibly table-qualified) identifier
    fn quote(&self, ident: &str) -> String {
        if ident == "*" {
            return ident.to_string();
        }
        ident
            .split('.')
            .map(|part| match self {
                Dialect::MySql => format!("`{}`", part),
                _ => format!("\"{}\"", part),
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Positional placeholder for the 1-based parameter index
    fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index),
            _ => "?".to_string(),
        }
    }

    pub fn supports_returning(&self) -> bool {
        matches!(self, Dialect::Sqlite | Dialect::Postgres)
    }

    fn like_keyword(&self) -> &'static str {
        // Postgres LIKE is case-sensitive; the universal contract is not
        match self {
            Dialect::Postgres => "ILIKE",
            _ => "LIKE",
        }
    }
}

/// Statement text plus its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// A `HAVING` predicate over an aggregate
#[derive(Debug, Clone, PartialEq)]
pub struct HavingClause {
    pub function: AggregateFunction,
    pub field: Option<String>,
    pub operator: Operator,
    pub value: Value,
}

/// Collects bound values and hands out placeholders in order
struct ParamSink {
    dialect: Dialect,
    params: Vec<Value>,
}

impl ParamSink {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }
}

/// Chainable, injection-safe statement builder
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    dialect: Dialect,
    table: Option<String>,
    columns: Vec<String>,
    aggregates: Vec<Aggregate>,
    conditions: Vec<Condition>,
    or_groups: Vec<Vec<Condition>>,
    joins: Vec<Join>,
    order: Vec<OrderBy>,
    group_by: Vec<String>,
    having: Vec<HavingClause>,
    limit: Option<u64>,
    offset: Option<u64>,
    returning: bool,
}

impl QueryBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            ..Default::default()
        }
    }

    /// Seed a builder with every clause of a universal query
    pub fn from_query(dialect: Dialect, query: &UniversalQuery) -> Self {
        Self {
            dialect,
            table: Some(query.collection.clone()),
            columns: query.select.clone(),
            aggregates: query.aggregate.clone(),
            conditions: query.where_.clone(),
            or_groups: query.or.clone(),
            joins: query.join.clone(),
            order: query.order_by.clone(),
            group_by: query.group_by.clone(),
            having: Vec::new(),
            limit: query.limit,
            offset: query.offset,
            returning: false,
        }
    }

    pub fn from(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        self.columns.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn select_aggregate(
        mut self,
        function: AggregateFunction,
        field: Option<&str>,
        alias: &str,
    ) -> Self {
        self.aggregates.push(Aggregate {
            function,
            field: field.map(str::to_string),
            alias: alias.to_string(),
        });
        self
    }

    pub fn where_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn filter(self, field: &str, operator: Operator, value: impl Into<Value>) -> Self {
        self.where_condition(Condition::new(field, operator, value))
    }

    pub fn or_group(mut self, group: Vec<Condition>) -> Self {
        self.or_groups.push(group);
        self
    }

    pub fn join(mut self, table: &str, left_field: &str, right_field: &str) -> Self {
        self.joins.push(Join {
            table: table.to_string(),
            kind: JoinKind::Inner,
            left_field: left_field.to_string(),
            right_field: right_field.to_string(),
        });
        self
    }

    pub fn left_join(mut self, table: &str, left_field: &str, right_field: &str) -> Self {
        self.joins.push(Join {
            table: table.to_string(),
            kind: JoinKind::Left,
            left_field: left_field.to_string(),
            right_field: right_field.to_string(),
        });
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order.push(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn order_by_desc(self, field: &str) -> Self {
        self.order_by(field, Direction::Desc)
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn group_by(mut self, field: &str) -> Self {
        self.group_by.push(field.to_string());
        self
    }

    pub fn having(
        mut self,
        function: AggregateFunction,
        field: Option<&str>,
        operator: Operator,
        value: impl Into<Value>,
    ) -> Self {
        self.having.push(HavingClause {
            function,
            field: field.map(str::to_string),
            operator,
            value: value.into(),
        });
        self
    }

    /// Append `RETURNING *` to write statements when the dialect allows it
    pub fn returning(mut self) -> Self {
        self.returning = self.dialect.supports_returning();
        self
    }

    // -------------------------------------------------------------------------
    // Terminal methods
    // -------------------------------------------------------------------------

    pub fn to_select_sql(&self) -> Result<BuiltStatement> {
        let table = self.table()?;
        let mut sink = ParamSink::new(self.dialect);

        let mut projection = Vec::new();
        for column in &self.columns {
            if column != "*" {
                validate_qualified_identifier(column)?;
            }
            projection.push(self.dialect.quote(column));
        }
        for agg in &self.aggregates {
            validate_identifier(&agg.alias)?;
            projection.push(format!(
                "{} AS {}",
                self.aggregate_expr(agg.function, agg.field.as_deref())?,
                self.dialect.quote(&agg.alias)
            ));
        }
        if projection.is_empty() {
            projection.push("*".to_string());
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            projection.join(", "),
            self.dialect.quote(table)
        );
        self.push_joins(&mut sql)?;
        self.push_where(&mut sql, &mut sink)?;

        if !self.group_by.is_empty() {
            let mut fields = Vec::new();
            for field in &self.group_by {
                validate_qualified_identifier(field)?;
                fields.push(self.dialect.quote(field));
            }
            sql.push_str(&format!(" GROUP BY {}", fields.join(", ")));
        }

        if !self.having.is_empty() {
            let mut parts = Vec::new();
            for clause in &self.having {
                let expr = self.aggregate_expr(clause.function, clause.field.as_deref())?;
                parts.push(self.render_predicate(
                    expr,
                    clause.operator,
                    &clause.value,
                    &mut sink,
                )?);
            }
            sql.push_str(&format!(" HAVING {}", parts.join(" AND ")));
        }

        if !self.order.is_empty() {
            let mut parts = Vec::new();
            for order in &self.order {
                validate_qualified_identifier(&order.field)?;
                let dir = match order.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                parts.push(format!("{} {}", self.dialect.quote(&order.field), dir));
            }
            sql.push_str(&format!(" ORDER BY {}", parts.join(", ")));
        }

        self.push_paging(&mut sql);

        Ok(BuiltStatement {
            sql,
            params: sink.params,
        })
    }

    /// `SELECT COUNT(*)` over the same predicate; projection is ignored
    pub fn to_count_sql(&self) -> Result<BuiltStatement> {
        let table = self.table()?;
        let mut sink = ParamSink::new(self.dialect);
        let mut sql = format!(
            "SELECT COUNT(*) AS {} FROM {}",
            self.dialect.quote("count"),
            self.dialect.quote(table)
        );
        self.push_joins(&mut sql)?;
        self.push_where(&mut sql, &mut sink)?;
        Ok(BuiltStatement {
            sql,
            params: sink.params,
        })
    }

    pub fn to_insert_sql(&self, data: &Row) -> Result<BuiltStatement> {
        let table = self.table()?;
        if data.is_empty() {
            return Err(DataError::UnsupportedOperation(format!(
                "insert into '{}' requires at least one column",
                table
            )));
        }
        let mut sink = ParamSink::new(self.dialect);
        let mut columns = Vec::with_capacity(data.len());
        let mut placeholders = Vec::with_capacity(data.len());
        for (column, value) in data {
            validate_identifier(column)?;
            columns.push(self.dialect.quote(column));
            placeholders.push(sink.bind(value.clone()));
        }

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.dialect.quote(table),
            columns.join(", "),
            placeholders.join(", ")
        );
        if self.returning {
            sql.push_str(" RETURNING *");
        }
        Ok(BuiltStatement {
            sql,
            params: sink.params,
        })
    }

    pub fn to_update_sql(&self, data: &Row) -> Result<BuiltStatement> {
        let table = self.table()?;
        if !self.has_predicate() {
            return Err(DataError::missing_predicate(table, "update"));
        }
        if data.is_empty() {
            return Err(DataError::UnsupportedOperation(format!(
                "update of '{}' requires at least one column",
                table
            )));
        }
        let mut sink = ParamSink::new(self.dialect);
        let mut assignments = Vec::with_capacity(data.len());
        for (column, value) in data {
            validate_identifier(column)?;
            let placeholder = sink.bind(value.clone());
            assignments.push(format!("{} = {}", self.dialect.quote(column), placeholder));
        }

        let mut sql = format!(
            "UPDATE {} SET {}",
            self.dialect.quote(table),
            assignments.join(", ")
        );
        self.push_where(&mut sql, &mut sink)?;
        if self.returning {
            sql.push_str(" RETURNING *");
        }
        Ok(BuiltStatement {
            sql,
            params: sink.params,
        })
    }

    /// Fails without a `where` condition: the last guard against full-table deletes
    pub fn to_delete_sql(&self) -> Result<BuiltStatement> {
        let table = self.table()?;
        if !self.has_predicate() {
            return Err(DataError::missing_predicate(table, "delete"));
        }
        let mut sink = ParamSink::new(self.dialect);
        let mut sql = format!("DELETE FROM {}", self.dialect.quote(table));
        self.push_where(&mut sql, &mut sink)?;
        if self.returning {
            sql.push_str(" RETURNING *");
        }
        Ok(BuiltStatement {
            sql,
            params: sink.params,
        })
    }

    // -------------------------------------------------------------------------
    // Rendering helpers
    // -------------------------------------------------------------------------

    fn table(&self) -> Result<&str> {
        let table = self.table.as_deref().ok_or_else(|| {
            DataError::UnsupportedOperation("query builder has no table".to_string())
        })?;
        validate_identifier(table)?;
        Ok(table)
    }

    fn has_predicate(&self) -> bool {
        !self.conditions.is_empty() || self.or_groups.iter().any(|g| !g.is_empty())
    }

    fn aggregate_expr(&self, function: AggregateFunction, field: Option<&str>) -> Result<String> {
        let target = match field {
            Some(f) => {
                validate_qualified_identifier(f)?;
                self.dialect.quote(f)
            }
            None => "*".to_string(),
        };
        Ok(format!("{}({})", function.sql_name(), target))
    }

    fn push_joins(&self, sql: &mut String) -> Result<()> {
        for join in &self.joins {
            validate_identifier(&join.table)?;
            validate_qualified_identifier(&join.left_field)?;
            validate_qualified_identifier(&join.right_field)?;
            let keyword = match join.kind {
                JoinKind::Inner => "INNER JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            sql.push_str(&format!(
                " {} {} ON {} = {}",
                keyword,
                self.dialect.quote(&join.table),
                self.dialect.quote(&join.left_field),
                self.dialect.quote(&join.right_field)
            ));
        }
        Ok(())
    }

    fn push_where(&self, sql: &mut String, sink: &mut ParamSink) -> Result<()> {
        let base = self.render_group(&self.conditions, sink)?;
        let mut groups = Vec::new();
        for group in &self.or_groups {
            if let Some(rendered) = self.render_group(group, sink)? {
                groups.push(rendered);
            }
        }

        match (base, groups.is_empty()) {
            (None, true) => {}
            (Some(base), true) => sql.push_str(&format!(" WHERE {}", base)),
            (base, false) => {
                let mut alternatives: Vec<String> = Vec::new();
                if let Some(base) = base {
                    alternatives.push(format!("({})", base));
                }
                alternatives.extend(groups.into_iter().map(|g| format!("({})", g)));
                sql.push_str(&format!(" WHERE {}", alternatives.join(" OR ")));
            }
        }
        Ok(())
    }

    fn render_group(&self, group: &[Condition], sink: &mut ParamSink) -> Result<Option<String>> {
        if group.is_empty() {
            return Ok(None);
        }
        let mut parts = Vec::with_capacity(group.len());
        for condition in group {
            validate_qualified_identifier(&condition.field)?;
            parts.push(self.render_predicate(
                self.dialect.quote(&condition.field),
                condition.operator,
                &condition.value,
                sink,
            )?);
        }
        Ok(Some(parts.join(" AND ")))
    }

    fn render_predicate(
        &self,
        lhs: String,
        operator: Operator,
        value: &Value,
        sink: &mut ParamSink,
    ) -> Result<String> {
        let binary = |sink: &mut ParamSink, op: &str| format!("{} {} {}", lhs, op, sink.bind(value.clone()));
        let rendered = match operator {
            Operator::Eq if value.is_null() => format!("{} IS NULL", lhs),
            Operator::Neq if value.is_null() => format!("{} IS NOT NULL", lhs),
            Operator::Eq => binary(sink, "="),
            Operator::Neq => binary(sink, "<>"),
            Operator::Gt => binary(sink, ">"),
            Operator::Gte => binary(sink, ">="),
            Operator::Lt => binary(sink, "<"),
            Operator::Lte => binary(sink, "<="),
            Operator::Like => binary(sink, self.dialect.like_keyword()),
            Operator::IsNull => format!("{} IS NULL", lhs),
            Operator::IsNotNull => format!("{} IS NOT NULL", lhs),
            Operator::In | Operator::NotIn => {
                let items = value.as_array().ok_or_else(|| {
                    DataError::UnsupportedOperation(format!(
                        "{:?} on {} requires an array value",
                        operator, lhs
                    ))
                })?;
                let negate = operator == Operator::NotIn;
                if items.is_empty() {
                    // nothing is IN an empty set; everything is NOT IN it
                    return Ok(if negate { "1 = 1" } else { "1 = 0" }.to_string());
                }
                let placeholders: Vec<String> =
                    items.iter().map(|item| sink.bind(item.clone())).collect();
                format!(
                    "{} {} ({})",
                    lhs,
                    if negate { "NOT IN" } else { "IN" },
                    placeholders.join(", ")
                )
            }
        };
        Ok(rendered)
    }

    fn push_paging(&self, sql: &mut String) {
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset))
            }
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) => match self.dialect {
                Dialect::Sqlite => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
                Dialect::MySql => {
                    sql.push_str(&format!(" LIMIT 18446744073709551615 OFFSET {}", offset))
                }
                Dialect::Postgres => sql.push_str(&format!(" OFFSET {}", offset)),
            },
            (None, None) => {}
        }
    }
}
