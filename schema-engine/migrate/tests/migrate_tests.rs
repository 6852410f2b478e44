//! End-to-end migration scenarios over in-memory SQLite.

use dataflow_migrate::{executor, history, plan, MigrateError, MigrationOptions};
use dataflow_model::{FieldDescriptor, FieldType, ModelConfig, ModelDescriptor};
use dataflow_sql::connector::{Queryable, Sqlite};
use dataflow_sql::Value;

fn validated(mut model: ModelDescriptor) -> ModelDescriptor {
    model.validate().unwrap();
    model
}

fn conn() -> Sqlite {
    Sqlite::new_in_memory().unwrap()
}

async fn apply(conn: &Sqlite, models: &[ModelDescriptor]) -> executor::MigrationReport {
    dataflow_migrate::migrate(conn, models, &MigrationOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn fresh_migration_creates_tables_and_history() {
    let conn = conn();
    let models = vec![validated(
        ModelDescriptor::new("User")
            .field(FieldDescriptor::new("email", FieldType::String(Some(255))).unique()),
    )];

    let report = apply(&conn, &models).await;
    assert!(!report.no_changes);
    assert!(report.applied_steps >= 1);
    assert!(report.version.is_some());

    // The table is usable.
    conn.execute_raw("INSERT INTO `User` (`email`) VALUES (?)", &[Value::text("a@x")])
        .await
        .unwrap();

    // History landed and the lock was released.
    let status = history::migration_status(&conn).await.unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].status, "applied");

    let locks = conn
        .query_raw("SELECT * FROM dataflow_migration_locks", &[])
        .await
        .unwrap();
    assert!(locks.is_empty());

    // Running again is a no-op.
    let second = apply(&conn, &models).await;
    assert!(second.no_changes);
}

#[tokio::test]
async fn config_flags_materialize_implicit_columns() {
    let conn = conn();
    let models = vec![validated(
        ModelDescriptor::new("Doc")
            .field(FieldDescriptor::new("title", FieldType::Text))
            .config(ModelConfig {
                multi_tenant: true,
                soft_delete: true,
                audit_log: true,
                versioned: true,
                ..Default::default()
            }),
    )];

    apply(&conn, &models).await;

    let schema = dataflow_describer::describe(&conn).await.unwrap();
    let table = schema.table("Doc").unwrap();
    for column in ["tenant_id", "deleted_at", "created_at", "updated_at", "version"] {
        assert!(table.column(column).is_some(), "missing {column}");
    }
}

#[tokio::test]
async fn widening_a_primary_key_keeps_rows_and_accepts_big_ids() {
    let conn = conn();

    let v1 = vec![
        validated(
            ModelDescriptor::new("Category")
                .field(FieldDescriptor::new("id", FieldType::Int32))
                .field(FieldDescriptor::new("name", FieldType::Text))
                .primary_key("id"),
        ),
        validated(
            ModelDescriptor::new("Product")
                .field(FieldDescriptor::new("id", FieldType::Int32))
                .field(FieldDescriptor::new("category_id", FieldType::Int32).references("Category", "id"))
                .primary_key("id"),
        ),
    ];
    apply(&conn, &v1).await;

    conn.raw_cmd(
        "INSERT INTO `Category` (`id`, `name`) VALUES (1, 'tools');\
         INSERT INTO `Product` (`id`, `category_id`) VALUES (1, 1);",
    )
    .await
    .unwrap();

    // Widen Product.id (and the referencing column type) to 64-bit.
    let v2 = vec![
        v1[0].clone(),
        validated(
            ModelDescriptor::new("Product")
                .field(FieldDescriptor::new("id", FieldType::Int64))
                .field(FieldDescriptor::new("category_id", FieldType::Int32).references("Category", "id"))
                .primary_key("id"),
        ),
    ];

    let report = apply(&conn, &v2).await;
    assert!(!report.no_changes);

    // Existing data survived the rebuild.
    let rows = conn.query_raw("SELECT id, category_id FROM `Product`", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);

    // And a beyond-32-bit id now fits.
    conn.execute_raw(
        "INSERT INTO `Product` (`id`, `category_id`) VALUES (?, ?)",
        &[Value::int64(1i64 << 40), Value::int64(1i64)],
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn reversible_plans_restore_the_schema_checksum() {
    let conn = conn();

    let v1 = vec![validated(
        ModelDescriptor::new("Item").field(FieldDescriptor::new("name", FieldType::Text)),
    )];
    apply(&conn, &v1).await;

    let before = dataflow_describer::describe(&conn).await.unwrap().checksum();

    // v2 adds a nullable column and an index — fully reversible.
    let v2 = vec![validated(
        ModelDescriptor::new("Item")
            .field(FieldDescriptor::new("name", FieldType::Text))
            .field(FieldDescriptor::new("note", FieldType::Text).nullable().indexed()),
    )];

    let built = plan(&conn, &v2, &MigrationOptions::default()).await.unwrap();
    assert!(!built.has_irreversible_steps());

    executor::apply(&conn, &built, &v2, &MigrationOptions::default())
        .await
        .unwrap();

    let after_forward = dataflow_describer::describe(&conn).await.unwrap().checksum();
    assert_ne!(before, after_forward);

    // Undo by running the reverse SQL newest-first.
    for step in built.steps.iter().rev() {
        match &step.reverse {
            dataflow_migrate::ReverseSql::Sql(sql) => conn.raw_cmd(sql).await.unwrap(),
            dataflow_migrate::ReverseSql::Irreversible => unreachable!("plan is reversible"),
        }
    }

    let after_reverse = dataflow_describer::describe(&conn).await.unwrap().checksum();
    assert_eq!(before, after_reverse);
}

#[tokio::test]
async fn held_lock_blocks_concurrent_migration() {
    let conn = conn();
    history::ensure_history_tables(&conn).await.unwrap();
    history::acquire_lock(&conn, history::SCHEMA_LOCK, std::time::Duration::from_secs(3600), false)
        .await
        .unwrap();

    let models = vec![validated(
        ModelDescriptor::new("User").field(FieldDescriptor::new("email", FieldType::Text)),
    )];

    let err = dataflow_migrate::migrate(&conn, &models, &MigrationOptions::default())
        .await
        .unwrap_err();

    match err {
        MigrateError::LockHeld { holder_pid, .. } => {
            assert_eq!(holder_pid, i64::from(std::process::id()));
        }
        other => panic!("expected LockHeld, got {other}"),
    }
}

#[tokio::test]
async fn critical_risk_requires_confirmation() {
    let conn = conn();

    let v1 = vec![validated(
        ModelDescriptor::new("Audit").field(FieldDescriptor::new("entry", FieldType::Text)),
    )];
    apply(&conn, &v1).await;

    // Make the table large enough to matter.
    for _ in 0..3 {
        conn.execute_raw("INSERT INTO `Audit` (`entry`) VALUES (?)", &[Value::text("x")])
            .await
            .unwrap();
    }

    // Dropping the table in production without a backup is critical.
    let options = MigrationOptions {
        production: true,
        verified_backup: false,
        ..Default::default()
    };

    let built = {
        let mut plan = plan(&conn, &[], &options).await.unwrap();
        // Raise the stakes the way a production row count would.
        plan.risk.score = 85;
        plan.risk.band = dataflow_migrate::RiskBand::Critical;
        plan
    };

    let err = executor::apply(&conn, &built, &[], &options).await.unwrap_err();
    assert!(matches!(err, MigrateError::CriticalRiskUnconfirmed { .. }));

    let confirmed = MigrationOptions {
        confirm_critical: true,
        ..options
    };
    let report = executor::apply(&conn, &built, &[], &confirmed).await.unwrap();
    assert!(!report.no_changes);

    let schema = dataflow_describer::describe(&conn).await.unwrap();
    assert!(!schema.has_table("Audit"));
}

#[tokio::test]
async fn failed_step_rolls_back_completed_work() {
    let conn = conn();

    let v1 = vec![validated(
        ModelDescriptor::new("Keep").field(FieldDescriptor::new("name", FieldType::Text)),
    )];
    apply(&conn, &v1).await;

    let v2 = vec![
        v1[0].clone(),
        validated(ModelDescriptor::new("Extra").field(FieldDescriptor::new("name", FieldType::Text))),
    ];

    let mut built = plan(&conn, &v2, &MigrationOptions::default()).await.unwrap();
    // Sabotage a later step; the earlier create must be unwound.
    built.steps.push(dataflow_migrate::MigrationStep {
        kind: dataflow_migrate::StepKind::AddIndex,
        table: "Extra".to_owned(),
        column: None,
        forward_sql: "CREATE INDEX broken ON does_not_exist (nope)".to_owned(),
        reverse: dataflow_migrate::ReverseSql::Sql("DROP INDEX broken".to_owned()),
        destructive: false,
        group: None,
        description: "sabotaged index".to_owned(),
    });

    let err = executor::apply(&conn, &built, &v2, &MigrationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::Aborted { .. }), "{err}");

    // The new table was reversed away; the pre-existing one is untouched.
    let schema = dataflow_describer::describe(&conn).await.unwrap();
    assert!(!schema.has_table("Extra"), "Extra should have been rolled back");
    assert!(schema.has_table("Keep"));

    // The failed attempt is on record.
    let status = history::migration_status(&conn).await.unwrap();
    assert!(status.iter().any(|r| r.status == "rolled_back"));

    // And the lock is free for the next attempt.
    let report = apply(&conn, &v2).await;
    assert!(!report.no_changes);
}

#[tokio::test]
async fn rename_detection_is_opt_in() {
    let conn = conn();

    let v1 = vec![validated(
        ModelDescriptor::new("customers").field(FieldDescriptor::new("name", FieldType::Text)),
    )];
    apply(&conn, &v1).await;

    conn.execute_raw("INSERT INTO `customers` (`name`) VALUES (?)", &[Value::text("n")])
        .await
        .unwrap();

    let v2 = vec![validated(
        ModelDescriptor::new("customer").field(FieldDescriptor::new("name", FieldType::Text)),
    )];

    // Opted in: the table is renamed, data survives.
    let options = MigrationOptions {
        rename_detection: true,
        ..Default::default()
    };
    dataflow_migrate::migrate(&conn, &v2, &options).await.unwrap();

    let rows = conn.query_raw("SELECT name FROM `customer`", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
}
