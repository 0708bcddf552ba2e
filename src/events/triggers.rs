//! Application-level replacements for database triggers
//!
//! Handlers write through the active adapter as [`User::system`], bypassing
//! the security engine and the event bus so they never re-trigger
//! themselves.

use super::{channel, DatabaseEvent, EventBus, EventHandler, HandlerId, Timing, WILDCARD};
use crate::adapter::AdapterSlot;
use crate::query::{Operation, Row, UniversalQuery};
use crate::security::User;
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, info};

/// Tables whose `updated_at` column is maintained on every update
pub const TIMESTAMPED_TABLES: &[&str] = &["profiles", "user_roles", "projects", "project_applications"];

const APPROVED: &str = "approved";
const IN_PROGRESS: &str = "in_progress";

/// Timestamp in the layout SQLite's `datetime('now')` produces
pub fn now_timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Role granted for a profile category; unknown categories map to `member`
pub fn role_for_category(category: Option<&Value>) -> &'static str {
    match category.and_then(Value::as_str) {
        Some("admin") => "admin",
        Some("moderator") => "moderator",
        _ => "member",
    }
}

async fn run(slot: &AdapterSlot, query: UniversalQuery) -> anyhow::Result<()> {
    let adapter = slot.read().await.clone();
    let description = query.describe();
    adapter
        .query(&query, &User::system())
        .await
        .with_context(|| format!("trigger write failed: {}", description))?;
    Ok(())
}

fn role_row(user_id: &Value, role: &str) -> Row {
    let mut row = Row::new();
    row.insert("user_id".to_string(), user_id.clone());
    row.insert("role".to_string(), json!(role));
    row
}

/// Stamp `updated_at` on outgoing update payloads
struct UpdatedAt {
    tables: HashSet<String>,
}

#[async_trait]
impl EventHandler for UpdatedAt {
    async fn handle(&self, event: &mut DatabaseEvent) -> anyhow::Result<()> {
        if event.timing != Timing::Before
            || event.operation != Operation::Update
            || !self.tables.contains(&event.table)
        {
            return Ok(());
        }
        if let Some(data) = event.data.as_mut() {
            data.insert("updated_at".to_string(), json!(now_timestamp()));
        }
        Ok(())
    }
}

/// A new profile gets its role row
struct ProfileCreated {
    slot: AdapterSlot,
}

#[async_trait]
impl EventHandler for ProfileCreated {
    async fn handle(&self, event: &mut DatabaseEvent) -> anyhow::Result<()> {
        for profile in event.affected_rows() {
            let Some(id) = profile.get("id") else {
                continue;
            };
            let role = role_for_category(profile.get("category"));
            run(&self.slot, UniversalQuery::insert("user_roles", role_row(id, role))).await?;
            debug!("created {} role for profile {}", role, id);
        }
        Ok(())
    }
}

/// A category change replaces the profile's role row
struct ProfileCategoryChanged {
    slot: AdapterSlot,
}

#[async_trait]
impl EventHandler for ProfileCategoryChanged {
    async fn handle(&self, event: &mut DatabaseEvent) -> anyhow::Result<()> {
        let Some(category) = event.data.as_ref().and_then(|d| d.get("category")).cloned() else {
            return Ok(());
        };
        let role = role_for_category(Some(&category));

        let mut ids: Vec<Value> = event
            .affected_rows()
            .iter()
            .filter_map(|row| row.get("id").cloned())
            .collect();
        // unchanged categories keep their role rows
        ids.retain(|id| {
            !event
                .old_data
                .iter()
                .any(|old| old.get("id") == Some(id) && old.get("category") == Some(&category))
        });

        for id in ids {
            run(
                &self.slot,
                UniversalQuery::delete("user_roles").where_eq("user_id", id.clone()),
            )
            .await?;
            run(&self.slot, UniversalQuery::insert("user_roles", role_row(&id, role))).await?;
            info!("profile {} moved to category {}, role is now {}", id, category, role);
        }
        Ok(())
    }
}

/// Approving an application starts its project
struct ApplicationApproved {
    slot: AdapterSlot,
}

#[async_trait]
impl EventHandler for ApplicationApproved {
    async fn handle(&self, event: &mut DatabaseEvent) -> anyhow::Result<()> {
        let approved = event
            .data
            .as_ref()
            .and_then(|d| d.get("status"))
            .and_then(Value::as_str)
            == Some(APPROVED);
        if !approved {
            return Ok(());
        }

        let already_approved: HashSet<String> = event
            .old_data
            .iter()
            .filter(|old| old.get("status").and_then(Value::as_str) == Some(APPROVED))
            .filter_map(|old| old.get("id").map(Value::to_string))
            .collect();

        let mut projects: Vec<Value> = Vec::new();
        for row in event.affected_rows() {
            let transitioned = row
                .get("id")
                .map_or(true, |id| !already_approved.contains(&id.to_string()));
            if let Some(project_id) = row.get("project_id") {
                if transitioned && !projects.contains(project_id) {
                    projects.push(project_id.clone());
                }
            }
        }

        for project_id in projects {
            let mut data = Row::new();
            data.insert("status".to_string(), json!(IN_PROGRESS));
            data.insert("updated_at".to_string(), json!(now_timestamp()));
            run(
                &self.slot,
                UniversalQuery::update("projects", data).where_eq("id", project_id.clone()),
            )
            .await?;
            info!("project {} moved to {} after an approval", project_id, IN_PROGRESS);
        }
        Ok(())
    }
}

/// Audit line for every completed write
struct AuditLog;

#[async_trait]
impl EventHandler for AuditLog {
    async fn handle(&self, event: &mut DatabaseEvent) -> anyhow::Result<()> {
        if event.timing == Timing::After && event.operation.is_write() {
            let affected = event.result.as_ref().map_or(0, |r| r.count());
            info!(
                table = %event.table,
                operation = %event.operation,
                user = %event.user.id,
                affected,
                "audit"
            );
        }
        Ok(())
    }
}

/// Subscribe the stock trigger handlers
///
/// `timestamped` lists the tables whose `updated_at` is maintained.
pub fn install_default_triggers(bus: &EventBus, slot: AdapterSlot, timestamped: &[&str]) -> Vec<HandlerId> {
    let tables = timestamped.iter().map(|t| t.to_string()).collect();
    vec![
        bus.on(WILDCARD, UpdatedAt { tables }),
        bus.on(
            channel("profiles", Operation::Insert, Timing::After),
            ProfileCreated { slot: slot.clone() },
        ),
        bus.on(
            channel("profiles", Operation::Update, Timing::After),
            ProfileCategoryChanged { slot: slot.clone() },
        ),
        bus.on(
            channel("project_applications", Operation::Update, Timing::After),
            ApplicationApproved { slot },
        ),
        bus.on(WILDCARD, AuditLog),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{adapter_slot, QueryResult, SqliteAdapter};
    use crate::database::{builtin_migrations, ConnectionManager, MigrationManager};
    use std::sync::Arc;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (EventBus, AdapterSlot) {
        let conn = Arc::new(ConnectionManager::in_memory());
        let mut migrations = MigrationManager::new(conn.clone()).unwrap();
        for m in builtin_migrations() {
            migrations.register(m).unwrap();
        }
        migrations.migrate().unwrap();
        let slot = adapter_slot(Arc::new(SqliteAdapter::new(conn)));
        let bus = EventBus::new();
        install_default_triggers(&bus, slot.clone(), TIMESTAMPED_TABLES);
        (bus, slot)
    }

    async fn write(bus: &EventBus, slot: &AdapterSlot, query: UniversalQuery) -> QueryResult {
        let adapter = slot.read().await.clone();
        let old = if matches!(query.operation, Operation::Update | Operation::Delete) {
            let mut select = UniversalQuery::select(query.collection.clone());
            select.where_ = query.where_.clone();
            adapter.query(&select, &User::system()).await.unwrap().into_rows()
        } else {
            Vec::new()
        };
        let mut event = DatabaseEvent::before(&query, &User::system(), old);
        bus.emit_before(&mut event).await.unwrap();
        let mut query = query;
        query.data = event.data.clone();
        let result = adapter.query(&query, &User::system()).await.unwrap();
        bus.emit_after(&event.into_after(result.clone())).await;
        result
    }

    async fn roles(slot: &AdapterSlot, user_id: &str) -> Vec<Row> {
        let adapter = slot.read().await.clone();
        adapter
            .query(
                &UniversalQuery::select("user_roles").where_eq("user_id", user_id),
                &User::system(),
            )
            .await
            .unwrap()
            .into_rows()
    }

    #[tokio::test]
    async fn test_profile_lifecycle_maintains_roles() {
        let (bus, slot) = setup();
        write(
            &bus,
            &slot,
            UniversalQuery::insert("profiles", row(json!({"id": "u1", "email": "u1@example.com"}))),
        )
        .await;
        let current = roles(&slot, "u1").await;
        assert_eq!(current.len(), 1);
        assert_eq!(current[0]["role"], json!("member"));

        let result = write(
            &bus,
            &slot,
            UniversalQuery::update("profiles", row(json!({"category": "moderator"}))).where_eq("id", "u1"),
        )
        .await;
        assert!(result.rows()[0]["updated_at"].is_string());

        let current = roles(&slot, "u1").await;
        assert_eq!(current.len(), 1);
        assert_eq!(current[0]["role"], json!("moderator"));
    }

    #[tokio::test]
    async fn test_approval_starts_project() {
        let (bus, slot) = setup();
        let adapter = slot.read().await.clone();
        let system = User::system();
        adapter
            .query(
                &UniversalQuery::insert(
                    "projects",
                    row(json!({"id": "p1", "name": "Acme Promo", "creator_id": "u1"})),
                ),
                &system,
            )
            .await
            .unwrap();
        adapter
            .query(
                &UniversalQuery::insert(
                    "project_applications",
                    row(json!({"id": "a1", "project_id": "p1", "applicant_id": "u2"})),
                ),
                &system,
            )
            .await
            .unwrap();

        write(
            &bus,
            &slot,
            UniversalQuery::update("project_applications", row(json!({"status": "approved"})))
                .where_eq("id", "a1"),
        )
        .await;

        let project = adapter
            .query(&UniversalQuery::select("projects").where_eq("id", "p1"), &system)
            .await
            .unwrap()
            .into_rows();
        assert_eq!(project[0]["status"], json!("in_progress"));
    }

    #[test]
    fn test_role_for_category() {
        assert_eq!(role_for_category(Some(&json!("admin"))), "admin");
        assert_eq!(role_for_category(Some(&json!("vip"))), "member");
        assert_eq!(role_for_category(None), "member");
    }
}
