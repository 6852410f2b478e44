//! End-to-end engine scenarios over in-memory SQLite.

use dataflow::prelude::*;
use dataflow::{Connection, ErrorKind};
use serde_json::json;

fn quiet_config() -> EngineConfig {
    EngineConfig {
        log_config: LogConfig::quiet(),
        ..Default::default()
    }
}

async fn engine_with_users() -> DataFlow {
    let engine = DataFlow::new("sqlite:///:memory:", quiet_config()).unwrap();
    engine
        .register_model(
            ModelDescriptor::new("User")
                .field(FieldDescriptor::new("id", FieldType::Int32))
                .field(FieldDescriptor::new("email", FieldType::String(Some(255))))
                .field(FieldDescriptor::new("active", FieldType::Bool).default_literal(json!(true)))
                .primary_key("id"),
        )
        .unwrap();
    engine.initialize().await.unwrap();
    engine
}

async fn run_node(
    engine: &DataFlow,
    model: &str,
    op: &str,
    params: serde_json::Value,
) -> dataflow::Result<serde_json::Value> {
    let mut wf = engine.create_workflow("test");
    engine.add_node(&mut wf, model, op, "node", params, None)?;
    let (mut results, _run_id) = engine.execute_workflow(wf, None).await?;
    Ok(results.shift_remove("node").unwrap())
}

#[tokio::test]
async fn bulk_create_update_list_round_trip() {
    let engine = engine_with_users().await;

    // Three rows in one statement.
    let created = run_node(
        &engine,
        "User",
        "bulk_create",
        json!({"records": [
            {"id": 1, "email": "a"},
            {"id": 2, "email": "b"},
            {"id": 3, "email": "c"}
        ]}),
    )
    .await
    .unwrap();
    assert_eq!(created["rows_affected"], json!(3));
    assert_eq!(created["created"], json!(3));

    // Flip everyone to inactive.
    let updated = run_node(
        &engine,
        "User",
        "bulk_update",
        json!({"filter": {"active": true}, "fields": {"active": false}}),
    )
    .await
    .unwrap();
    assert_eq!(updated["processed"], json!(3));
    assert_eq!(updated["rows_affected"], json!(3));

    // Nobody is active anymore.
    let listed = run_node(&engine, "User", "list", json!({"filter": {"active": true}}))
        .await
        .unwrap();
    assert_eq!(listed["data"], json!([]));

    let all = run_node(&engine, "User", "list", json!({"filter": {}}))
        .await
        .unwrap();
    assert_eq!(all["rows_affected"], json!(3));
}

#[tokio::test]
async fn create_returns_the_row_with_defaults_applied() {
    let engine = engine_with_users().await;

    let output = run_node(
        &engine,
        "User",
        "create",
        json!({"fields": {"id": 10, "email": "x@example.com"}}),
    )
    .await
    .unwrap();

    assert_eq!(output["success"], json!(true));
    assert_eq!(output["data"]["email"], json!("x@example.com"));
    // The declared literal default materialized.
    assert_eq!(output["data"]["active"], json!(true));
}

#[tokio::test]
async fn read_update_delete_by_primary_key() {
    let engine = engine_with_users().await;
    run_node(&engine, "User", "create", json!({"fields": {"id": 1, "email": "a"}}))
        .await
        .unwrap();

    let read = run_node(&engine, "User", "read", json!({"id": 1})).await.unwrap();
    assert_eq!(read["data"]["email"], json!("a"));

    let updated = run_node(
        &engine,
        "User",
        "update",
        json!({"id": 1, "fields": {"email": "b"}}),
    )
    .await
    .unwrap();
    assert_eq!(updated["updated"], json!(1));

    let deleted = run_node(&engine, "User", "delete", json!({"id": 1})).await.unwrap();
    assert_eq!(deleted["deleted"], json!(1));

    let gone = run_node(&engine, "User", "read", json!({"id": 1})).await.unwrap();
    assert_eq!(gone["data"], serde_json::Value::Null);
    assert_eq!(gone["rows_affected"], json!(0));
}

#[tokio::test]
async fn upsert_inserts_then_updates() {
    let engine = engine_with_users().await;

    let first = run_node(
        &engine,
        "User",
        "upsert",
        json!({"fields": {"id": 1, "email": "first"}}),
    )
    .await
    .unwrap();
    assert_eq!(first["upserted"], json!(1));
    assert_eq!(first["data"]["email"], json!("first"));

    let second = run_node(
        &engine,
        "User",
        "upsert",
        json!({"fields": {"id": 1, "email": "second"}}),
    )
    .await
    .unwrap();
    assert_eq!(second["data"]["email"], json!("second"));

    let count = run_node(&engine, "User", "count", json!({})).await.unwrap();
    assert_eq!(count["data"], json!(1));
}

#[tokio::test]
async fn bulk_upsert_mixes_inserts_and_updates() {
    let engine = engine_with_users().await;
    run_node(&engine, "User", "create", json!({"fields": {"id": 1, "email": "old"}}))
        .await
        .unwrap();

    let output = run_node(
        &engine,
        "User",
        "bulk_upsert",
        json!({"records": [
            {"id": 1, "email": "new"},
            {"id": 2, "email": "fresh"}
        ]}),
    )
    .await
    .unwrap();
    assert_eq!(output["processed"], json!(2));

    let row = run_node(&engine, "User", "read", json!({"id": 1})).await.unwrap();
    assert_eq!(row["data"]["email"], json!("new"));
    let count = run_node(&engine, "User", "count", json!({})).await.unwrap();
    assert_eq!(count["data"], json!(2));
}

#[tokio::test]
async fn empty_filter_delete_needs_both_flags() {
    let engine = engine_with_users().await;
    run_node(&engine, "User", "create", json!({"fields": {"id": 1, "email": "a"}}))
        .await
        .unwrap();

    // safe_mode defaults to true: refused even when confirmed.
    let err = run_node(
        &engine,
        "User",
        "bulk_delete",
        json!({"filter": {}, "confirmed": true}),
    )
    .await
    .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::UnsafeBulkOperation));
    assert_eq!(err.code(), "DF1003");

    // safe_mode off but unconfirmed: still refused.
    let err = run_node(
        &engine,
        "User",
        "bulk_delete",
        json!({"filter": {}, "safe_mode": false}),
    )
    .await
    .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::UnsafeBulkOperation));

    // Both flags: the whole table goes.
    let output = run_node(
        &engine,
        "User",
        "bulk_delete",
        json!({"filter": {}, "safe_mode": false, "confirmed": true}),
    )
    .await
    .unwrap();
    assert_eq!(output["deleted"], json!(1));
}

#[tokio::test]
async fn empty_filter_is_match_all_for_list_count_and_bulk_update() {
    let engine = engine_with_users().await;
    run_node(
        &engine,
        "User",
        "bulk_create",
        json!({"records": [{"id": 1, "email": "a"}, {"id": 2, "email": "b"}]}),
    )
    .await
    .unwrap();

    let listed = run_node(&engine, "User", "list", json!({"filter": {}})).await.unwrap();
    assert_eq!(listed["rows_affected"], json!(2));

    let counted = run_node(&engine, "User", "count", json!({"filter": {}})).await.unwrap();
    assert_eq!(counted["data"], json!(2));

    // No confirmation dance for bulk_update.
    let updated = run_node(
        &engine,
        "User",
        "bulk_update",
        json!({"filter": {}, "fields": {"active": false}}),
    )
    .await
    .unwrap();
    assert_eq!(updated["rows_affected"], json!(2));
}

#[tokio::test]
async fn unique_violations_surface_as_constraint_errors() {
    let engine = DataFlow::new("sqlite:///:memory:", quiet_config()).unwrap();
    engine
        .register_model(
            ModelDescriptor::new("User")
                .field(FieldDescriptor::new("email", FieldType::String(Some(255))).unique()),
        )
        .unwrap();
    engine.initialize().await.unwrap();

    run_node(&engine, "User", "create", json!({"fields": {"email": "a@x"}}))
        .await
        .unwrap();

    let err = run_node(&engine, "User", "create", json!({"fields": {"email": "a@x"}}))
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ConstraintViolation { .. }), "{err}");
    assert_eq!(err.code(), "DF3002");
    assert!(err.to_string().contains("email"), "{err}");
}

#[tokio::test]
async fn unknown_model_and_operation_enumerate_alternatives() {
    let engine = engine_with_users().await;
    let mut wf = engine.create_workflow("bad");

    let err = engine
        .add_node(&mut wf, "Ghost", "create", "n", json!({}), None)
        .unwrap_err();
    assert!(err.to_string().contains("User"), "{err}");

    let err = engine
        .add_node(&mut wf, "User", "obliterate", "n", json!({}), None)
        .unwrap_err();
    assert!(err.to_string().contains("bulk_delete"), "{err}");
}

#[tokio::test]
async fn workflow_edges_project_dot_paths() {
    let engine = engine_with_users().await;

    let mut wf = engine.create_workflow("chained");
    engine
        .add_node(
            &mut wf,
            "User",
            "create",
            "create_user",
            json!({"fields": {"id": 7, "email": "chain@x"}}),
            None,
        )
        .unwrap();
    engine
        .add_node(
            &mut wf,
            "User",
            "read",
            "read_back",
            json!({}),
            Some(vec![Connection::new("create_user.data.id", "id")]),
        )
        .unwrap();

    let (results, run_id) = engine.execute_workflow(wf, None).await.unwrap();
    assert!(!run_id.is_empty());
    assert_eq!(results["read_back"]["data"]["email"], json!("chain@x"));
}

#[tokio::test]
async fn workflow_execution_is_deterministic() {
    let engine = engine_with_users().await;
    run_node(
        &engine,
        "User",
        "bulk_create",
        json!({"records": [{"id": 1, "email": "a"}, {"id": 2, "email": "b"}]}),
    )
    .await
    .unwrap();

    let build = || {
        let mut wf = engine.create_workflow("deterministic");
        engine
            .add_node(&mut wf, "User", "list", "all", json!({"order_by": ["id"]}), None)
            .unwrap();
        engine
            .add_node(&mut wf, "User", "count", "total", json!({}), None)
            .unwrap();
        wf
    };

    let (first, _) = engine.execute_workflow(build(), None).await.unwrap();
    let (second, _) = engine.execute_workflow(build(), None).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn runtime_inputs_bind_per_node() {
    let engine = engine_with_users().await;
    run_node(&engine, "User", "create", json!({"fields": {"id": 5, "email": "rt@x"}}))
        .await
        .unwrap();

    let mut wf = engine.create_workflow("runtime");
    engine
        .add_node(&mut wf, "User", "read", "reader", json!({}), None)
        .unwrap();

    let inputs = json!({"reader": {"id": 5}}).as_object().cloned().unwrap();
    let (results, _) = engine.execute_workflow(wf, Some(inputs)).await.unwrap();
    assert_eq!(results["reader"]["data"]["email"], json!("rt@x"));
}

#[tokio::test]
async fn cache_reflects_writes_immediately() {
    let engine = engine_with_users().await;
    run_node(&engine, "User", "create", json!({"fields": {"id": 1, "email": "a"}}))
        .await
        .unwrap();

    // Prime the cache.
    let first = run_node(&engine, "User", "count", json!({})).await.unwrap();
    assert_eq!(first["data"], json!(1));
    let again = run_node(&engine, "User", "count", json!({})).await.unwrap();
    assert_eq!(again["data"], json!(1));

    // A write invalidates; the next read sees the new row.
    run_node(&engine, "User", "create", json!({"fields": {"id": 2, "email": "b"}}))
        .await
        .unwrap();
    let after_write = run_node(&engine, "User", "count", json!({})).await.unwrap();
    assert_eq!(after_write["data"], json!(2));
}

#[tokio::test]
async fn soft_delete_models_hide_rows_until_asked() {
    let engine = DataFlow::new("sqlite:///:memory:", quiet_config()).unwrap();
    engine
        .register_model(
            ModelDescriptor::new("Doc")
                .field(FieldDescriptor::new("title", FieldType::Text))
                .config(ModelConfig {
                    soft_delete: true,
                    ..Default::default()
                }),
        )
        .unwrap();
    engine.initialize().await.unwrap();

    let created = run_node(&engine, "Doc", "create", json!({"fields": {"title": "t"}}))
        .await
        .unwrap();
    let id = created["data"]["id"].clone();

    let deleted = run_node(&engine, "Doc", "delete", json!({"id": id})).await.unwrap();
    assert_eq!(deleted["deleted"], json!(1));

    // Hidden by default, visible on request, and the row still exists.
    let hidden = run_node(&engine, "Doc", "list", json!({})).await.unwrap();
    assert_eq!(hidden["data"], json!([]));

    let visible = run_node(&engine, "Doc", "list", json!({"include_deleted": true}))
        .await
        .unwrap();
    assert_eq!(visible["rows_affected"], json!(1));
    assert!(visible["data"][0]["deleted_at"].is_string());
}

#[tokio::test]
async fn audit_columns_fill_automatically() {
    let engine = DataFlow::new("sqlite:///:memory:", quiet_config()).unwrap();
    engine
        .register_model(
            ModelDescriptor::new("Doc")
                .field(FieldDescriptor::new("title", FieldType::Text))
                .config(ModelConfig {
                    audit_log: true,
                    ..Default::default()
                }),
        )
        .unwrap();
    engine.initialize().await.unwrap();

    let mut wf = engine.create_workflow("audited").act_as("ops@example.com");
    engine
        .add_node(&mut wf, "Doc", "create", "doc", json!({"fields": {"title": "t"}}), None)
        .unwrap();
    let (results, _) = engine.execute_workflow(wf, None).await.unwrap();

    let created = &results["doc"];
    assert!(created["data"]["created_at"].is_string());
    assert!(created["data"]["updated_at"].is_string());
    assert_eq!(created["data"]["created_by"], json!("ops@example.com"));
    assert_eq!(created["data"]["updated_by"], json!("ops@example.com"));
}

#[tokio::test]
async fn versioned_models_enforce_expected_version() {
    let engine = DataFlow::new("sqlite:///:memory:", quiet_config()).unwrap();
    engine
        .register_model(
            ModelDescriptor::new("Doc")
                .field(FieldDescriptor::new("title", FieldType::Text))
                .config(ModelConfig {
                    versioned: true,
                    ..Default::default()
                }),
        )
        .unwrap();
    engine.initialize().await.unwrap();

    let created = run_node(&engine, "Doc", "create", json!({"fields": {"title": "v1"}}))
        .await
        .unwrap();
    let id = created["data"]["id"].clone();
    assert_eq!(created["data"]["version"], json!(1));

    // A correct expected_version succeeds and bumps.
    run_node(
        &engine,
        "Doc",
        "update",
        json!({"id": id, "fields": {"title": "v2"}, "expected_version": 1}),
    )
    .await
    .unwrap();

    let row = run_node(&engine, "Doc", "read", json!({"id": id})).await.unwrap();
    assert_eq!(row["data"]["version"], json!(2));

    // A stale expected_version conflicts.
    let err = run_node(
        &engine,
        "Doc",
        "update",
        json!({"id": id, "fields": {"title": "v3"}, "expected_version": 1}),
    )
    .await
    .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ConstraintViolation { .. }));
}

#[tokio::test]
async fn tenant_scoping_isolates_rows() {
    let engine = DataFlow::new("sqlite:///:memory:", quiet_config()).unwrap();
    engine
        .register_model(
            ModelDescriptor::new("User")
                .field(FieldDescriptor::new("email", FieldType::String(Some(255))))
                .config(ModelConfig {
                    multi_tenant: true,
                    ..Default::default()
                }),
        )
        .unwrap();
    engine.initialize().await.unwrap();

    engine.tenants().register("acme", "Acme Inc", None).unwrap();
    engine.tenants().register("globex", "Globex", None).unwrap();

    // Without a tenant the operation refuses to run.
    let err = run_node(&engine, "User", "list", json!({})).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TenantRequired));
    assert_eq!(err.code(), "DF2001");

    let tenants = engine.tenants().clone();

    tenants
        .scope("acme", async {
            run_node(&engine, "User", "create", json!({"fields": {"email": "a@acme"}}))
                .await
                .unwrap();
        })
        .await
        .unwrap();

    // Globex sees nothing; a nested acme scope sees the row; after the
    // nested scope exits, globex is empty again.
    tenants
        .scope("globex", async {
            let listed = run_node(&engine, "User", "list", json!({})).await.unwrap();
            assert_eq!(listed["data"], json!([]));

            tenants
                .scope("acme", async {
                    let listed = run_node(&engine, "User", "list", json!({})).await.unwrap();
                    assert_eq!(listed["data"][0]["email"], json!("a@acme"));
                })
                .await
                .unwrap();

            let listed = run_node(&engine, "User", "list", json!({})).await.unwrap();
            assert_eq!(listed["data"], json!([]));
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn sync_entry_points_refuse_to_run_inside_the_runtime() {
    let engine = engine_with_users().await;

    let err = engine.discover_schema().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WrongContext(_)));
    assert_eq!(err.code(), "DF6001");
    assert!(err.to_string().contains("discover_schema_async"), "{err}");

    // The async variant works from the same spot.
    let schema = engine.discover_schema_async().await.unwrap();
    assert!(schema.has_table("User"));
}

#[test]
fn sync_entry_points_work_outside_any_runtime() {
    let engine = DataFlow::new("sqlite:///:memory:", quiet_config()).unwrap();
    engine
        .register_model(ModelDescriptor::new("User").field(FieldDescriptor::new("email", FieldType::Text)))
        .unwrap();

    // No ambient runtime here; the sync entry spins up its own. Nothing has
    // been migrated, so the in-memory database is empty.
    let schema = engine.discover_schema().unwrap();
    assert!(schema.tables.is_empty());
}

#[tokio::test]
async fn filter_round_trip_matches_in_memory_semantics() {
    let engine = engine_with_users().await;
    run_node(
        &engine,
        "User",
        "bulk_create",
        json!({"records": [
            {"id": 1, "email": "alice@x", "active": true},
            {"id": 2, "email": "bob@y", "active": false},
            {"id": 3, "email": "carol@x", "active": true}
        ]}),
    )
    .await
    .unwrap();

    let all_rows = vec![
        json!({"id": 1, "email": "alice@x", "active": true}),
        json!({"id": 2, "email": "bob@y", "active": false}),
        json!({"id": 3, "email": "carol@x", "active": true}),
    ];

    let filters = vec![
        json!({}),
        json!({"active": true}),
        json!({"email": {"$like": "%@x"}}),
        json!({"id": {"$gte": 2}}),
        json!({"$or": [{"id": 1}, {"email": {"$like": "bob%"}}]}),
        json!({"id": {"$in": [1, 3]}}),
        json!({"id": {"$between": [2, 3]}}),
        json!({"$nor": [{"active": true}]}),
        json!({"email": {"$regex": "^a"}}),
    ];

    for doc in filters {
        let via_sql = run_node(&engine, "User", "list", json!({"filter": doc, "order_by": ["id"]}))
            .await
            .unwrap();
        let sql_ids: Vec<i64> = via_sql["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["id"].as_i64().unwrap())
            .collect();

        let filter = dataflow::Filter::parse(&doc).unwrap();
        let memory_ids: Vec<i64> = all_rows
            .iter()
            .filter(|row| filter.matches(row.as_object().unwrap()))
            .map(|row| row["id"].as_i64().unwrap())
            .collect();

        assert_eq!(sql_ids, memory_ids, "filter {doc} diverged");
    }
}

#[tokio::test]
async fn get_available_nodes_lists_the_full_catalog() {
    let engine = engine_with_users().await;

    let catalog = engine.get_available_nodes(None).unwrap();
    assert_eq!(catalog["User"].len(), 11);

    let names: Vec<&str> = catalog["User"].iter().map(|d| d.operation.name()).collect();
    assert!(names.contains(&"create"));
    assert!(names.contains(&"bulk_upsert"));

    assert!(engine.get_available_nodes(Some("Ghost")).is_err());
}

#[tokio::test]
async fn transactional_workflows_roll_back_wholesale() {
    let engine = engine_with_users().await;

    let mut wf = engine.create_workflow("doomed");
    engine
        .add_node(
            &mut wf,
            "User",
            "create",
            "ok_node",
            json!({"fields": {"id": 1, "email": "kept?"}}),
            None,
        )
        .unwrap();
    // Same pk again: constraint violation fails the workflow.
    engine
        .add_node(
            &mut wf,
            "User",
            "create",
            "zz_dup",
            json!({"fields": {"id": 1, "email": "dup"}}),
            None,
        )
        .unwrap();

    let err = engine
        .execute_workflow_transactional(wf, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ConstraintViolation { .. }), "{err}");

    // The first node's insert rolled back with the rest.
    let count = run_node(&engine, "User", "count", json!({})).await.unwrap();
    assert_eq!(count["data"], json!(0));
}

#[tokio::test]
async fn shutdown_purges_pools_and_reports() {
    let engine = engine_with_users().await;
    let report = engine.purge_pools().await;
    assert_eq!(report.purged, 1);
    assert!(report.errors.is_empty());

    engine.shutdown().await;
    // The engine stays usable: pools are recreated on demand.
    engine.health().await.unwrap();
}
