use async_trait::async_trait;
use polystore::adapter::{BackupPayload, DataAdapter, Provider, QueryResult, RestoreReport};
use polystore::database::{builtin_migrations, ConnectionManager, Migration, MigrationManager};
use polystore::manager::MigrationStage;
use polystore::monitoring::{HealthState, MonitoringService, MonitoringSettings, PerformanceMetric};
use polystore::query::{Join, JoinKind, Operation, Row, UniversalQuery};
use polystore::security::{Role, User};
use polystore::{DataAccessManager, DataError, DatabaseEvent, MigrationPhase, PolystoreConfig};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn admin() -> User {
    User::new("root", "root@example.com", Role::Admin)
}

async fn seed(manager: &DataAccessManager) {
    let system = User::system();
    for (id, email, category) in [
        ("u1", "u1@example.com", "member"),
        ("u2", "u2@example.com", "moderator"),
    ] {
        manager
            .query(
                UniversalQuery::insert(
                    "profiles",
                    row(json!({"id": id, "email": email, "category": category})),
                ),
                &system,
            )
            .await
            .unwrap();
    }
    for (id, name, creator) in [("p1", "Acme Promo", "u1"), ("p2", "Summer Launch", "u2")] {
        manager
            .query(
                UniversalQuery::insert(
                    "projects",
                    row(json!({"id": id, "name": name, "creator_id": creator, "budget": 1250.5})),
                ),
                &system,
            )
            .await
            .unwrap();
    }
    manager
        .query(
            UniversalQuery::insert(
                "project_applications",
                row(json!({"id": "a1", "project_id": "p2", "applicant_id": "u1", "message": "hi"})),
            ),
            &system,
        )
        .await
        .unwrap();
}

async fn sorted_rows(manager: &DataAccessManager, table: &str) -> Vec<Row> {
    manager
        .query(UniversalQuery::select(table).order_by_asc("id"), &admin())
        .await
        .unwrap()
        .into_rows()
}

#[tokio::test]
async fn test_projects_are_private_to_their_creator() {
    let manager = DataAccessManager::open_in_memory().await.unwrap();
    let inserted = Arc::new(AtomicUsize::new(0));
    let counter = inserted.clone();
    manager.events().on(
        "projects.insert.after",
        move |event: &mut DatabaseEvent| -> anyhow::Result<()> {
            assert_eq!(event.user.id, "u1");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    );

    let u1 = User::member("u1");
    let u2 = User::member("u2");
    let result = manager
        .query(
            UniversalQuery::insert("projects", row(json!({"name": "Acme Promo", "creator_id": "u1"}))),
            &u1,
        )
        .await
        .unwrap();
    let project = result.rows()[0].clone();
    assert!(project["id"].is_string());
    assert_eq!(project["status"], json!("open"));
    assert_eq!(inserted.load(Ordering::SeqCst), 1);

    let seen_by_u2 = manager
        .query(UniversalQuery::select("projects"), &u2)
        .await
        .unwrap();
    assert_eq!(seen_by_u2.count(), 0);

    let seen_by_u1 = manager
        .query(UniversalQuery::select("projects"), &u1)
        .await
        .unwrap();
    assert_eq!(seen_by_u1.count(), 1);

    // u2 cannot touch it either
    let updated = manager
        .query(
            UniversalQuery::update("projects", row(json!({"name": "Hijacked"})))
                .where_eq("id", project["id"].clone()),
            &u2,
        )
        .await
        .unwrap();
    assert_eq!(updated.count(), 0);

    // inserting on someone else's behalf is refused
    let err = manager
        .query(
            UniversalQuery::insert("projects", row(json!({"name": "Spoof", "creator_id": "u1"}))),
            &u2,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::PermissionDenied { .. }));
}

#[tokio::test]
async fn test_joined_tables_follow_their_own_rules() {
    let manager = DataAccessManager::open_in_memory().await.unwrap();
    seed(&manager).await;
    manager
        .save_config(
            Provider::Supabase,
            &json!({"url": "https://x.supabase.co", "api_key": "SECRET_KEY"}),
        )
        .unwrap();
    let u1 = User::member("u1");

    let leak = UniversalQuery::select("projects").join(Join {
        table: "database_configs".to_string(),
        kind: JoinKind::Inner,
        left_field: "projects.budget".to_string(),
        right_field: "database_configs.is_active".to_string(),
    });
    let err = manager.query(leak, &u1).await.unwrap_err();
    assert!(matches!(err, DataError::PermissionDenied { .. }));

    // profiles are public
    let with_profiles = UniversalQuery::select("projects").join(Join {
        table: "profiles".to_string(),
        kind: JoinKind::Inner,
        left_field: "projects.creator_id".to_string(),
        right_field: "profiles.id".to_string(),
    });
    assert_eq!(manager.query(with_profiles, &u1).await.unwrap().count(), 1);

    // applications stay scoped to their applicant even through a join
    let with_applications = UniversalQuery::select("projects").join(Join {
        table: "project_applications".to_string(),
        kind: JoinKind::Inner,
        left_field: "projects.id".to_string(),
        right_field: "project_applications.project_id".to_string(),
    });
    assert_eq!(manager.query(with_applications.clone(), &admin()).await.unwrap().count(), 1);
    assert_eq!(
        manager
            .query(with_applications, &User::member("u2"))
            .await
            .unwrap()
            .count(),
        0
    );
}

#[tokio::test]
async fn test_members_cannot_raise_their_own_role() {
    let manager = DataAccessManager::open_in_memory().await.unwrap();
    seed(&manager).await;

    let err = manager
        .query(
            UniversalQuery::insert(
                "profiles",
                row(json!({"id": "u3", "email": "u3@example.com", "category": "admin"})),
            ),
            &User::member("u3"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::PermissionDenied { .. }));

    let err = manager
        .query(
            UniversalQuery::update("profiles", row(json!({"category": "admin"}))).where_eq("id", "u1"),
            &User::member("u1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::PermissionDenied { .. }));

    let roles = manager
        .query(UniversalQuery::select("user_roles").order_by_asc("user_id"), &admin())
        .await
        .unwrap()
        .into_rows();
    let granted: Vec<(Value, Value)> = roles
        .iter()
        .map(|r| (r["user_id"].clone(), r["role"].clone()))
        .collect();
    assert_eq!(
        granted,
        vec![
            (json!("u1"), json!("member")),
            (json!("u2"), json!("moderator")),
        ]
    );
}

#[tokio::test]
async fn test_applications_are_approved_by_the_project_creator() {
    let manager = DataAccessManager::open_in_memory().await.unwrap();
    seed(&manager).await;
    let approve = UniversalQuery::update("project_applications", row(json!({"status": "approved"})))
        .where_eq("id", "a1");

    let err = manager
        .query(approve.clone(), &User::member("u1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::PermissionDenied { .. }));
    let projects = sorted_rows(&manager, "projects").await;
    assert_eq!(projects[1]["status"], json!("open"));

    let approved = manager.query(approve, &User::member("u2")).await.unwrap();
    assert_eq!(approved.count(), 1);
    let projects = sorted_rows(&manager, "projects").await;
    assert_eq!(projects[1]["id"], json!("p2"));
    assert_eq!(projects[1]["status"], json!("in_progress"));
}

#[tokio::test]
async fn test_reads_reach_wildcard_handlers() {
    let manager = DataAccessManager::open_in_memory().await.unwrap();
    seed(&manager).await;
    let reads = Arc::new(AtomicUsize::new(0));
    let counter = reads.clone();
    manager
        .events()
        .on("*", move |event: &mut DatabaseEvent| -> anyhow::Result<()> {
            if matches!(event.operation, Operation::Select | Operation::Count) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

    let u1 = User::member("u1");
    manager.query(UniversalQuery::select("projects"), &u1).await.unwrap();
    assert_eq!(reads.load(Ordering::SeqCst), 2);
    manager.query(UniversalQuery::count("projects"), &u1).await.unwrap();
    assert_eq!(reads.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_unknown_collections_are_denied_for_everyone() {
    let manager = DataAccessManager::open_in_memory().await.unwrap();
    manager
        .execute_raw("CREATE TABLE invoices (id TEXT PRIMARY KEY, total REAL)", &[], &admin())
        .unwrap();

    for user in [admin(), User::member("u1"), User::system()] {
        let err = manager
            .query(UniversalQuery::select("invoices"), &user)
            .await
            .unwrap_err();
        assert!(
            matches!(err, DataError::PermissionDenied { ref reason, .. } if reason == "no policy defined"),
            "{} was not denied: {}",
            user.id,
            err
        );
    }
}

#[tokio::test]
async fn test_unfiltered_writes_never_reach_the_adapter() {
    let manager = DataAccessManager::open_in_memory().await.unwrap();
    seed(&manager).await;
    let touched = Arc::new(AtomicUsize::new(0));
    let counter = touched.clone();
    manager.events().on("*", move |_: &mut DatabaseEvent| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let err = manager
        .query(UniversalQuery::delete("projects"), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::MissingPredicate { .. }));
    let err = manager
        .query(
            UniversalQuery::update("projects", row(json!({"status": "closed"}))),
            &admin(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::MissingPredicate { .. }));

    assert_eq!(touched.load(Ordering::SeqCst), 0);
    assert_eq!(manager.active_adapter().await.count("projects").await.unwrap(), 2);
}

#[tokio::test]
async fn test_backup_restores_into_a_fresh_database() {
    let source = DataAccessManager::open_in_memory().await.unwrap();
    seed(&source).await;
    let payload = source.backup().await.unwrap();
    assert_eq!(payload.metadata.provider, Provider::Sqlite);
    // two profiles, their two role rows, two projects and one application
    assert_eq!(payload.metadata.total_records, 7);

    // the payload survives a trip through its JSON form
    let payload: BackupPayload = serde_json::from_str(&serde_json::to_string(&payload).unwrap()).unwrap();

    let target = DataAccessManager::open_in_memory().await.unwrap();
    let report = target.restore(&payload).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.total_restored(), 7);

    for table in ["profiles", "user_roles", "projects", "project_applications"] {
        assert_eq!(
            sorted_rows(&source, table).await,
            sorted_rows(&target, table).await,
            "{} differs after restore",
            table
        );
    }
}

#[tokio::test]
async fn test_file_snapshots_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let config = PolystoreConfig::with_data_dir(dir.path());
    let manager = DataAccessManager::open(&config).await.unwrap();
    seed(&manager).await;

    let snapshot = manager.backups().create_backup(Default::default()).unwrap();
    manager
        .execute_raw("DELETE FROM projects WHERE id = ?1", &[json!("p1")], &admin())
        .unwrap();
    assert_eq!(manager.active_adapter().await.count("projects").await.unwrap(), 1);

    manager.backups().restore_backup(&snapshot.path).unwrap();
    // the connection reopens on the restored file
    assert_eq!(manager.active_adapter().await.count("projects").await.unwrap(), 2);
    assert_eq!(manager.backups().list_backups().unwrap().len(), 1);
}

#[test]
fn test_schema_migrations_are_idempotent() {
    let conn = Arc::new(ConnectionManager::in_memory());
    let mut migrations = MigrationManager::new(conn.clone()).unwrap();
    for m in builtin_migrations() {
        migrations.register(m).unwrap();
    }

    let first = migrations.migrate().unwrap();
    assert!(!first.is_empty());
    assert!(migrations.migrate().unwrap().is_empty());
    assert!(migrations.pending_migrations().unwrap().is_empty());
    assert_eq!(migrations.current_version().unwrap(), *first.last().unwrap());
}

#[test]
fn test_widgets_migration_up_and_down() {
    let conn = Arc::new(ConnectionManager::in_memory());
    let mut migrations = MigrationManager::new(conn.clone()).unwrap();
    migrations
        .register(Migration::sql(
            1,
            "widgets",
            "CREATE TABLE widgets (id INTEGER PRIMARY KEY, label TEXT NOT NULL);",
            "DROP TABLE widgets;",
        ))
        .unwrap();

    assert_eq!(migrations.migrate().unwrap(), vec![1]);
    assert_eq!(migrations.current_version().unwrap(), 1);
    assert!(conn.table_exists("widgets").unwrap());

    assert_eq!(migrations.rollback().unwrap(), Some(1));
    assert_eq!(migrations.current_version().unwrap(), 0);
    assert!(!conn.table_exists("widgets").unwrap());
}

#[test]
fn test_health_follows_error_rate_and_latency() {
    let failing = MonitoringService::new(MonitoringSettings::default());
    for i in 0..100 {
        let elapsed = Duration::from_millis(20);
        if i % 20 < 3 {
            failing.record_metric(PerformanceMetric::failure("select", "projects", elapsed, "adapter"));
        } else {
            failing.record_metric(PerformanceMetric::success("select", "projects", elapsed));
        }
    }
    // 15 of 100 failed
    assert_eq!(failing.get_health_status().status, HealthState::Critical);

    let steady = MonitoringService::new(MonitoringSettings::default());
    for i in 0..100 {
        let elapsed = Duration::from_millis(500);
        if i < 3 {
            steady.record_metric(PerformanceMetric::failure("select", "projects", elapsed, "adapter"));
        } else {
            steady.record_metric(PerformanceMetric::success("select", "projects", elapsed));
        }
    }
    let health = steady.get_health_status();
    assert_eq!(health.status, HealthState::Healthy);
    assert!((health.avg_query_time_ms - 500.0).abs() < 1.0);
}

/// A reachable backend whose restore always fails
struct BrokenTarget {
    disconnected: Arc<AtomicBool>,
}

#[async_trait]
impl DataAdapter for BrokenTarget {
    fn provider(&self) -> Provider {
        Provider::MySql
    }

    async fn query(&self, _query: &UniversalQuery, _user: &User) -> polystore::Result<QueryResult> {
        Ok(QueryResult::Rows { rows: Vec::new() })
    }

    async fn test_connection(&self) -> bool {
        true
    }

    async fn disconnect(&self) -> polystore::Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn restore(&self, _payload: &BackupPayload) -> polystore::Result<RestoreReport> {
        Err(DataError::adapter(
            Provider::MySql,
            "bulk insert",
            anyhow::anyhow!("disk full"),
        ))
    }
}

#[tokio::test]
async fn test_failed_backend_migration_keeps_the_original() {
    let manager = DataAccessManager::open_in_memory().await.unwrap();
    seed(&manager).await;
    let disconnected = Arc::new(AtomicBool::new(false));
    let flag = disconnected.clone();
    manager.register_adapter_factory(Provider::MySql, move |_: &Value| {
        Ok(Arc::new(BrokenTarget {
            disconnected: flag.clone(),
        }) as Arc<dyn DataAdapter>)
    });

    let report = manager
        .migrate_to(Provider::MySql, json!({"user": "app", "database": "app"}))
        .await
        .unwrap();

    assert!(!report.succeeded());
    assert!(matches!(
        report.phase,
        MigrationPhase::Failed { stage: MigrationStage::Restoring, .. }
    ));
    assert_eq!(manager.migration_phase(), report.phase);
    assert!(disconnected.load(Ordering::SeqCst));
    assert_eq!(manager.active_provider().await, Provider::Sqlite);
    assert!(manager.get_active_config().unwrap().is_none());

    // still fully usable
    assert_eq!(sorted_rows(&manager, "projects").await.len(), 2);
}

#[tokio::test]
async fn test_migration_to_a_separate_sqlite_file() {
    let dir = tempfile::tempdir().unwrap();
    let target_path = dir.path().join("target.sqlite3");
    let manager = DataAccessManager::open_in_memory().await.unwrap();
    seed(&manager).await;

    let credentials = json!({"path": target_path});
    let report = manager
        .migrate_to(Provider::Sqlite, credentials.clone())
        .await
        .unwrap();

    assert!(report.succeeded(), "{}", report.phase);
    assert_eq!(report.backed_up_records, 7);
    assert!(report.verification.iter().all(|v| v.matches()));
    assert_eq!(manager.migration_phase(), MigrationPhase::Swapped);

    let active = manager.get_active_config().unwrap().unwrap();
    assert_eq!(active.provider, Provider::Sqlite);
    assert_eq!(active.config, credentials);

    // reads now come from the new file
    let target = ConnectionManager::new(&target_path, Default::default());
    assert_eq!(target.table_count("projects").unwrap(), 2);
    assert_eq!(sorted_rows(&manager, "profiles").await.len(), 2);
}

#[tokio::test]
async fn test_incomplete_backup_fails_the_backend_migration() {
    let dir = tempfile::tempdir().unwrap();
    let manager = DataAccessManager::open_in_memory().await.unwrap();
    seed(&manager).await;
    manager
        .execute_raw("DROP TABLE project_applications", &[], &admin())
        .unwrap();

    let payload = manager.backup().await.unwrap();
    assert_eq!(payload.skipped_tables, vec!["project_applications".to_string()]);

    let report = manager
        .migrate_to(Provider::Sqlite, json!({"path": dir.path().join("target.sqlite3")}))
        .await
        .unwrap();
    assert!(!report.succeeded());
    assert!(matches!(
        report.phase,
        MigrationPhase::Failed { stage: MigrationStage::BackingUp, .. }
    ));
    assert!(manager.get_active_config().unwrap().is_none());
    assert_eq!(sorted_rows(&manager, "projects").await.len(), 2);
}
