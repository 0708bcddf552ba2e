//! Declarative, fail-closed authorization
//!
//! Rules are keyed by `(table, operation)`. A query is allowed only when at
//! least one rule matches and every matching rule's check passes; passing
//! rules may then rewrite the query (ownership scoping). Tables without a
//! rule are denied for everyone.

pub mod policies;

pub use policies::default_rules;

use crate::error::{DataError, Result};
use crate::query::{Condition, Operation, UniversalQuery};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

// =============================================================================
// Identity
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Moderator,
    Member,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Admin => "admin",
            Role::Moderator => "moderator",
            Role::Member => "member",
        };
        write!(f, "{}", name)
    }
}

/// An already-authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: Role,
}

impl User {
    pub fn new(id: impl Into<String>, email: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            role,
        }
    }

    pub fn member(id: impl Into<String>) -> Self {
        let id = id.into();
        let email = format!("{}@users.local", id);
        Self::new(id, email, Role::Member)
    }

    /// Internal identity used by trigger handlers and maintenance tasks
    pub fn system() -> Self {
        Self::new("system", "system@localhost", Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins and moderators
    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Moderator)
    }
}

// =============================================================================
// Rules
// =============================================================================

/// Operation selector of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMatcher {
    Exact(Operation),
    Any,
}

impl OperationMatcher {
    pub fn matches(&self, operation: Operation) -> bool {
        match self {
            OperationMatcher::Exact(op) => *op == operation,
            OperationMatcher::Any => true,
        }
    }
}

impl From<Operation> for OperationMatcher {
    fn from(op: Operation) -> Self {
        OperationMatcher::Exact(op)
    }
}

/// Authorization predicate of a rule
///
/// Checks are async so they can consult other data before deciding. Plain
/// closures `Fn(&User, &UniversalQuery) -> bool` implement this trait.
#[async_trait]
pub trait RuleCheck: Send + Sync {
    async fn check(&self, user: &User, query: &UniversalQuery) -> bool;
}

#[async_trait]
impl<F> RuleCheck for F
where
    F: Fn(&User, &UniversalQuery) -> bool + Send + Sync,
{
    async fn check(&self, user: &User, query: &UniversalQuery) -> bool {
        self(user, query)
    }
}

pub type QueryRewrite = dyn Fn(&User, UniversalQuery) -> UniversalQuery + Send + Sync;

/// One row of the rule table
#[derive(Clone)]
pub struct PermissionRule {
    pub table: String,
    pub operation: OperationMatcher,
    pub check: Arc<dyn RuleCheck>,
    pub modify_query: Option<Arc<QueryRewrite>>,
}

impl PermissionRule {
    pub fn new(
        table: impl Into<String>,
        operation: impl Into<OperationMatcher>,
        check: impl RuleCheck + 'static,
    ) -> Self {
        Self {
            table: table.into(),
            operation: operation.into(),
            check: Arc::new(check),
            modify_query: None,
        }
    }

    /// A rule whose check always passes
    pub fn allow(table: impl Into<String>, operation: impl Into<OperationMatcher>) -> Self {
        Self::new(table, operation, |_: &User, _: &UniversalQuery| true)
    }

    pub fn with_rewrite<F>(mut self, rewrite: F) -> Self
    where
        F: Fn(&User, UniversalQuery) -> UniversalQuery + Send + Sync + 'static,
    {
        self.modify_query = Some(Arc::new(rewrite));
        self
    }

    pub fn matches(&self, query: &UniversalQuery) -> bool {
        self.table == query.collection && self.operation.matches(query.operation)
    }
}

impl std::fmt::Debug for PermissionRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionRule")
            .field("table", &self.table)
            .field("operation", &self.operation)
            .field("rewrites", &self.modify_query.is_some())
            .finish()
    }
}

/// Prefix an unqualified condition field with `table`
fn qualify(table: &str, mut condition: Condition) -> Condition {
    if !condition.field.contains('.') {
        condition.field = format!("{}.{}", table, condition.field);
    }
    condition
}

/// Outcome of [`SecurityEngine::authorize`]
#[derive(Debug, Clone, PartialEq)]
pub struct AuthDecision {
    pub allowed: bool,
    /// The query after every passing rule's rewrite
    pub query: UniversalQuery,
    pub denial_reason: Option<String>,
}

impl AuthDecision {
    fn deny(query: &UniversalQuery, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            query: query.clone(),
            denial_reason: Some(reason.into()),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug, Default)]
pub struct SecurityEngine {
    rules: RwLock<Vec<PermissionRule>>,
}

impl SecurityEngine {
    /// An engine with no rules: everything is denied
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<PermissionRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<PermissionRule>> {
        self.rules.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<PermissionRule>> {
        self.rules.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_rule(&self, rule: PermissionRule) {
        debug!("registered permission rule for {}", rule.table);
        self.write().push(rule);
    }

    /// Drop every rule for `table`; returns how many were removed
    pub fn remove_rules(&self, table: &str) -> usize {
        let mut rules = self.write();
        let before = rules.len();
        rules.retain(|r| r.table != table);
        before - rules.len()
    }

    pub fn rule_count(&self) -> usize {
        self.read().len()
    }

    /// Whether any rule at all exists for `table`
    pub fn has_policy(&self, table: &str) -> bool {
        self.read().iter().any(|r| r.table == table)
    }

    /// Decide whether `user` may run `query`
    ///
    /// Structural problems (bad identifiers, update/delete without a
    /// predicate) are returned as errors before any rule is consulted.
    /// Every joined table must pass its own `select` rules, and the
    /// predicates those rules add are applied to the joined columns.
    pub async fn authorize(&self, query: &UniversalQuery, user: &User) -> Result<AuthDecision> {
        query.validate()?;
        let mut decision = self.authorize_table(query, user).await?;
        if !decision.allowed {
            return Ok(decision);
        }

        for join in &query.join {
            let read = UniversalQuery::select(join.table.as_str());
            let joined = self.authorize_table(&read, user).await?;
            if !joined.allowed {
                let reason = joined.denial_reason.unwrap_or_else(|| "denied".to_string());
                return Ok(AuthDecision::deny(
                    query,
                    format!("join on '{}' denied: {}", join.table, reason),
                ));
            }
            for condition in joined.query.where_ {
                decision.query = decision.query.scope(qualify(&join.table, condition));
            }
        }
        Ok(decision)
    }

    async fn authorize_table(&self, query: &UniversalQuery, user: &User) -> Result<AuthDecision> {
        // snapshot so no lock is held across the async checks
        let matching: Vec<PermissionRule> =
            self.read().iter().filter(|r| r.matches(query)).cloned().collect();

        if matching.is_empty() {
            return Ok(AuthDecision::deny(query, "no policy defined"));
        }

        for rule in &matching {
            if !rule.check.check(user, query).await {
                return Ok(AuthDecision::deny(
                    query,
                    format!("rule for {} on '{}' rejected user {}", query.operation, rule.table, user.id),
                ));
            }
        }

        let mut rewritten = query.clone();
        for rule in &matching {
            if let Some(rewrite) = &rule.modify_query {
                rewritten = rewrite(user, rewritten);
            }
        }
        // a rewrite must not strip the predicate of a write
        rewritten.validate()?;

        Ok(AuthDecision {
            allowed: true,
            query: rewritten,
            denial_reason: None,
        })
    }

    /// [`authorize`](Self::authorize), mapping a denial to [`DataError::PermissionDenied`]
    pub async fn enforce(&self, query: &UniversalQuery, user: &User) -> Result<UniversalQuery> {
        let decision = self.authorize(query, user).await?;
        if decision.allowed {
            return Ok(decision.query);
        }
        let reason = decision
            .denial_reason
            .unwrap_or_else(|| "denied".to_string());
        warn!(
            "denied {} on {} for user {} ({}): {}",
            query.operation, query.collection, user.id, user.role, reason
        );
        Err(DataError::PermissionDenied {
            collection: query.collection.clone(),
            operation: query.operation.to_string(),
            reason,
        })
    }
}
