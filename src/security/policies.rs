//! The shipped rule table
//!
//! | Table | select / count | insert | update | delete |
//! |-------|----------------|--------|--------|--------|
//! | `profiles` | everyone | own id, or admin | own row, staff any | admin |
//! | `user_roles` | own rows, staff any | admin | admin | admin |
//! | `projects` | own rows, staff any | as creator, or admin | own rows, staff any | own rows, admin any |
//! | `project_applications` | own rows, staff any | as applicant | see below | own rows, admin any |
//! | layer tables | admin | admin | admin | admin |
//!
//! Only admins may write a profile `category` that grants more than the
//! member role. Applicants may edit their own applications except for
//! `status`; status changes belong to the creator of every affected
//! project, or to staff. Nobody but staff may move an application to
//! another project or applicant.

use super::{OperationMatcher, PermissionRule, RuleCheck, User};
use crate::adapter::AdapterSlot;
use crate::database::LAYER_TABLES;
use crate::error::Result;
use crate::events::triggers::role_for_category;
use crate::query::{Condition, Operation, Operator, UniversalQuery};
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

const READS: &[Operation] = &[Operation::Select, Operation::Count];

/// Application fields reserved for the project's creator and staff
const REVIEW_FIELDS: &[&str] = &["status"];

/// Fields tying an application to its project and applicant
const BINDING_FIELDS: &[&str] = &["project_id", "applicant_id"];

/// Whether the insert payload's `field` names the caller
fn payload_owned_by(query: &UniversalQuery, field: &str, user: &User) -> bool {
    query
        .data
        .as_ref()
        .and_then(|d| d.get(field))
        .and_then(|v| v.as_str())
        .is_some_and(|owner| owner == user.id)
}

fn payload_sets(query: &UniversalQuery, fields: &[&str]) -> bool {
    query
        .data
        .as_ref()
        .is_some_and(|d| fields.iter().any(|f| d.contains_key(*f)))
}

/// Whether the payload writes a profile category above `member`
fn grants_privilege(query: &UniversalQuery) -> bool {
    query
        .data
        .as_ref()
        .is_some_and(|d| role_for_category(d.get("category")) != "member")
}

/// Allow `operations`, restricting non-staff callers to rows where `field` is their id
fn owner_scoped(table: &str, operations: &[Operation], field: &'static str) -> Vec<PermissionRule> {
    operations
        .iter()
        .map(|op| {
            PermissionRule::allow(table, *op).with_rewrite(move |user, query| {
                if user.is_staff() {
                    query
                } else {
                    query.scope(Condition::eq(field, user.id.as_str()))
                }
            })
        })
        .collect()
}

/// Delete restricted to the owner; only admins may delete anything
fn owner_delete(table: &str, field: &'static str) -> PermissionRule {
    PermissionRule::allow(table, Operation::Delete).with_rewrite(move |user, query| {
        if user.is_admin() {
            query
        } else {
            query.scope(Condition::eq(field, user.id.as_str()))
        }
    })
}

fn admin_only(table: &str, operation: impl Into<OperationMatcher>) -> PermissionRule {
    PermissionRule::new(table, operation, |user: &User, _: &UniversalQuery| user.is_admin())
}

fn insert_as(table: &str, field: &'static str) -> PermissionRule {
    PermissionRule::new(table, Operation::Insert, move |user: &User, query: &UniversalQuery| {
        user.is_admin() || payload_owned_by(query, field, user)
    })
}

/// Profile writes that raise a role are reserved for admins
fn category_guard(operation: Operation) -> PermissionRule {
    PermissionRule::new("profiles", operation, |user: &User, query: &UniversalQuery| {
        user.is_admin() || !grants_privilege(query)
    })
}

/// Update check for `project_applications`
///
/// Status changes are allowed when every application the predicate matches
/// belongs to a project created by the caller. Looks the rows up through
/// the active adapter.
pub struct ApplicationReview {
    slot: AdapterSlot,
}

impl ApplicationReview {
    pub fn new(slot: AdapterSlot) -> Self {
        Self { slot }
    }

    async fn reviews_own_projects(&self, user: &User, query: &UniversalQuery) -> Result<bool> {
        let adapter = self.slot.read().await.clone();
        let system = User::system();

        let mut targets = UniversalQuery::select("project_applications").fields(&["project_id"]);
        targets.where_ = query.where_.clone();
        targets.or = query.or.clone();

        let mut project_ids: Vec<Value> = Vec::new();
        for row in adapter.query(&targets, &system).await?.into_rows() {
            if let Some(id) = row.get("project_id") {
                if !project_ids.contains(id) {
                    project_ids.push(id.clone());
                }
            }
        }
        if project_ids.is_empty() {
            return Ok(true);
        }

        let expected = project_ids.len() as u64;
        let owned = UniversalQuery::count("projects")
            .filter("id", Operator::In, Value::Array(project_ids))
            .where_eq("creator_id", user.id.as_str());
        Ok(adapter.query(&owned, &system).await?.count() == expected)
    }
}

#[async_trait]
impl RuleCheck for ApplicationReview {
    async fn check(&self, user: &User, query: &UniversalQuery) -> bool {
        if user.is_staff() {
            return true;
        }
        if payload_sets(query, BINDING_FIELDS) {
            return false;
        }
        if !payload_sets(query, REVIEW_FIELDS) {
            return true;
        }
        match self.reviews_own_projects(user, query).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!("application review lookup for {} failed: {}", user.id, e);
                false
            }
        }
    }
}

/// Applicants edit their own rows; reviews are verified by [`ApplicationReview`]
fn application_update(slot: AdapterSlot) -> PermissionRule {
    PermissionRule::new("project_applications", Operation::Update, ApplicationReview::new(slot))
        .with_rewrite(|user, query| {
            if user.is_staff() || payload_sets(&query, REVIEW_FIELDS) {
                query
            } else {
                query.scope(Condition::eq("applicant_id", user.id.as_str()))
            }
        })
}

/// The rule table; `slot` is the active adapter used by data-dependent checks
pub fn default_rules(slot: AdapterSlot) -> Vec<PermissionRule> {
    let mut rules = Vec::new();

    // profiles
    rules.extend(READS.iter().map(|op| PermissionRule::allow("profiles", *op)));
    rules.push(insert_as("profiles", "id"));
    rules.extend(owner_scoped("profiles", &[Operation::Update], "id"));
    rules.push(category_guard(Operation::Insert));
    rules.push(category_guard(Operation::Update));
    rules.push(admin_only("profiles", Operation::Delete));

    // user_roles
    rules.extend(owner_scoped("user_roles", READS, "user_id"));
    for op in [Operation::Insert, Operation::Update, Operation::Delete] {
        rules.push(admin_only("user_roles", op));
    }

    // projects
    rules.extend(owner_scoped("projects", READS, "creator_id"));
    rules.push(insert_as("projects", "creator_id"));
    rules.extend(owner_scoped("projects", &[Operation::Update], "creator_id"));
    rules.push(owner_delete("projects", "creator_id"));

    // project_applications
    rules.extend(owner_scoped("project_applications", READS, "applicant_id"));
    rules.push(insert_as("project_applications", "applicant_id"));
    rules.push(application_update(slot));
    rules.push(owner_delete("project_applications", "applicant_id"));

    for table in LAYER_TABLES {
        rules.push(admin_only(table, OperationMatcher::Any));
    }

    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{adapter_slot, SqliteAdapter};
    use crate::database::{builtin_migrations, ConnectionManager, MigrationManager};
    use crate::error::DataError;
    use crate::security::{Role, SecurityEngine};
    use serde_json::json;
    use std::sync::Arc;

    fn slot() -> AdapterSlot {
        let conn = Arc::new(ConnectionManager::in_memory());
        let mut migrations = MigrationManager::new(conn.clone()).unwrap();
        for m in builtin_migrations() {
            migrations.register(m).unwrap();
        }
        migrations.migrate().unwrap();
        adapter_slot(Arc::new(SqliteAdapter::new(conn)))
    }

    fn engine() -> SecurityEngine {
        SecurityEngine::with_rules(default_rules(slot()))
    }

    /// p1 by u1, p2 by u2; a1 is u1's application to p2
    async fn seeded() -> (SecurityEngine, AdapterSlot) {
        let slot = slot();
        let adapter = slot.read().await.clone();
        let system = User::system();
        for (id, creator) in [("p1", "u1"), ("p2", "u2")] {
            adapter
                .query(
                    &UniversalQuery::insert(
                        "projects",
                        data(json!({"id": id, "name": "Acme Promo", "creator_id": creator})),
                    ),
                    &system,
                )
                .await
                .unwrap();
        }
        adapter
            .query(
                &UniversalQuery::insert(
                    "project_applications",
                    data(json!({"id": "a1", "project_id": "p2", "applicant_id": "u1"})),
                ),
                &system,
            )
            .await
            .unwrap();
        (SecurityEngine::with_rules(default_rules(slot.clone())), slot)
    }

    fn data(value: serde_json::Value) -> crate::query::Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_project_insert_requires_matching_creator() {
        let engine = engine();
        let own = UniversalQuery::insert("projects", data(json!({"name": "Acme Promo", "creator_id": "u1"})));
        let decision = engine.authorize(&own, &User::member("u1")).await.unwrap();
        assert!(decision.allowed);
        // no filter injected on insert
        assert!(decision.query.where_.is_empty());

        let err = engine.enforce(&own, &User::member("u2")).await.unwrap_err();
        assert!(matches!(err, DataError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_member_reads_are_scoped() {
        let engine = engine();
        let query = engine
            .enforce(&UniversalQuery::select("projects"), &User::member("u2"))
            .await
            .unwrap();
        assert_eq!(query.where_, vec![Condition::eq("creator_id", "u2")]);

        let moderator = User::new("m1", "m1@example.com", Role::Moderator);
        let query = engine
            .enforce(&UniversalQuery::select("projects"), &moderator)
            .await
            .unwrap();
        assert!(query.where_.is_empty());
    }

    #[tokio::test]
    async fn test_moderator_cannot_delete_foreign_projects() {
        let engine = engine();
        let moderator = User::new("m1", "m1@example.com", Role::Moderator);
        let query = engine
            .enforce(&UniversalQuery::delete("projects").where_eq("id", "p1"), &moderator)
            .await
            .unwrap();
        assert!(query.where_.contains(&Condition::eq("creator_id", "m1")));
    }

    #[tokio::test]
    async fn test_layer_tables_are_admin_only() {
        let engine = engine();
        let query = UniversalQuery::select("database_configs");
        assert!(!engine.authorize(&query, &User::member("u1")).await.unwrap().allowed);
        assert!(engine.authorize(&query, &User::system()).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_role_rows_written_by_admin_only() {
        let engine = engine();
        let insert = UniversalQuery::insert("user_roles", data(json!({"user_id": "u1", "role": "admin"})));
        assert!(!engine.authorize(&insert, &User::member("u1")).await.unwrap().allowed);
        assert!(engine.authorize(&insert, &User::system()).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_members_cannot_grant_themselves_a_role() {
        let engine = engine();
        let member = User::member("u1");

        let insert = UniversalQuery::insert("profiles", data(json!({"id": "u1", "category": "admin"})));
        let err = engine.enforce(&insert, &member).await.unwrap_err();
        assert!(matches!(err, DataError::PermissionDenied { .. }));

        let update = UniversalQuery::update("profiles", data(json!({"category": "moderator"}))).where_eq("id", "u1");
        assert!(!engine.authorize(&update, &member).await.unwrap().allowed);
        let moderator = User::new("m1", "m1@example.com", Role::Moderator);
        assert!(!engine.authorize(&update, &moderator).await.unwrap().allowed);
        assert!(engine.authorize(&update, &User::system()).await.unwrap().allowed);

        let plain = UniversalQuery::insert("profiles", data(json!({"id": "u1", "category": "creator"})));
        assert!(engine.authorize(&plain, &member).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_only_the_project_creator_reviews_applications() {
        let (engine, _slot) = seeded().await;
        let approve = UniversalQuery::update("project_applications", data(json!({"status": "approved"})))
            .where_eq("id", "a1");

        // the applicant cannot approve their own application
        assert!(!engine.authorize(&approve, &User::member("u1")).await.unwrap().allowed);

        // p2's creator can, and the query is not narrowed to applicant rows
        let decision = engine.authorize(&approve, &User::member("u2")).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.query.where_, vec![Condition::eq("id", "a1")]);

        let moderator = User::new("m1", "m1@example.com", Role::Moderator);
        assert!(engine.authorize(&approve, &moderator).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_applicants_edit_only_their_own_messages() {
        let (engine, _slot) = seeded().await;
        let edit = UniversalQuery::update("project_applications", data(json!({"message": "updated"})))
            .where_eq("id", "a1");
        let query = engine.enforce(&edit, &User::member("u1")).await.unwrap();
        assert!(query.where_.contains(&Condition::eq("applicant_id", "u1")));

        let moved = UniversalQuery::update("project_applications", data(json!({"project_id": "p1"})))
            .where_eq("id", "a1");
        assert!(!engine.authorize(&moved, &User::member("u1")).await.unwrap().allowed);
    }
}
