use super::*;
use crate::calculator;
use crate::differ::{self, DiffOptions};
use dataflow_model::{FieldDescriptor, FieldType, ModelDescriptor};
use dataflow_sql::connector::SqlFamily;

fn validated(mut model: ModelDescriptor) -> ModelDescriptor {
    model.validate().unwrap();
    model
}

fn category_and_product() -> Vec<ModelDescriptor> {
    vec![
        validated(
            ModelDescriptor::new("Category")
                .field(FieldDescriptor::new("name", FieldType::String(Some(100)))),
        ),
        validated(
            ModelDescriptor::new("Product")
                .field(FieldDescriptor::new("category_id", FieldType::Int64).references("Category", "id")),
        ),
    ]
}

fn plan_for(
    family: SqlFamily,
    declared: &SqlSchema,
    live: &SqlSchema,
    row_counts: HashMap<String, u64>,
) -> MigrationPlan {
    let diffs = differ::diff(live, declared, &DiffOptions::default());
    build_plan(
        family,
        declared,
        live,
        diffs,
        &row_counts,
        &MigrationOptions::default(),
    )
    .unwrap()
}

#[test]
fn fresh_schema_creates_referenced_tables_first() {
    let declared = calculator::calculate(&category_and_product(), SqlFamily::Sqlite).unwrap();
    let live = SqlSchema::default();

    let plan = plan_for(SqlFamily::Sqlite, &declared, &live, HashMap::new());

    let creates: Vec<&str> = plan
        .steps
        .iter()
        .filter(|s| s.kind == StepKind::CreateTable)
        .map(|s| s.table.as_str())
        .collect();

    assert_eq!(creates, vec!["Category", "Product"]);
    assert!(!plan.has_irreversible_steps());
    assert_eq!(plan.risk.band, RiskBand::Low);
}

#[test]
fn postgres_fresh_schema_adds_fks_as_separate_steps() {
    let declared = calculator::calculate(&category_and_product(), SqlFamily::Postgres).unwrap();
    let plan = plan_for(SqlFamily::Postgres, &declared, &SqlSchema::default(), HashMap::new());

    assert!(plan.steps.iter().any(|s| s.kind == StepKind::AddForeignKey));
    let create_position = plan
        .steps
        .iter()
        .position(|s| s.kind == StepKind::CreateTable && s.table == "Category")
        .unwrap();
    let fk_position = plan
        .steps
        .iter()
        .position(|s| s.kind == StepKind::AddForeignKey)
        .unwrap();
    assert!(fk_position > create_position);
}

#[test]
fn pk_type_change_coordinates_referencing_fks_in_one_group() {
    // Live: Product.id is 32-bit, Order.product_id references it.
    let old_models = vec![
        validated(
            ModelDescriptor::new("Product")
                .field(FieldDescriptor::new("id", FieldType::Int32))
                .field(FieldDescriptor::new("name", FieldType::Text)),
        ),
        validated(
            ModelDescriptor::new("Order")
                .field(FieldDescriptor::new("product_id", FieldType::Int32).references("Product", "id")),
        ),
    ];
    let new_models = vec![
        validated(
            ModelDescriptor::new("Product")
                .field(FieldDescriptor::new("id", FieldType::Int64))
                .field(FieldDescriptor::new("name", FieldType::Text)),
        ),
        validated(
            ModelDescriptor::new("Order")
                .field(FieldDescriptor::new("product_id", FieldType::Int64).references("Product", "id")),
        ),
    ];

    let live = calculator::calculate(&old_models, SqlFamily::Postgres).unwrap();
    let declared = calculator::calculate(&new_models, SqlFamily::Postgres).unwrap();

    let plan = plan_for(SqlFamily::Postgres, &declared, &live, HashMap::new());

    // One coordinated group: drop FK, alter both columns, recreate FK.
    let grouped: Vec<&MigrationStep> = plan.steps.iter().filter(|s| s.group.is_some()).collect();
    assert!(
        grouped.iter().any(|s| s.kind == StepKind::DropForeignKey),
        "steps: {:#?}",
        plan.steps
    );
    assert!(grouped.iter().any(|s| s.kind == StepKind::AddForeignKey));
    assert!(
        grouped
            .iter()
            .filter(|s| s.kind == StepKind::AlterColumn)
            .count()
            >= 1
    );

    let group_ids: BTreeSet<usize> = grouped.iter().filter_map(|s| s.group).collect();
    assert_eq!(group_ids.len(), 1, "all coordinated steps share one group");

    let drop_position = plan
        .steps
        .iter()
        .position(|s| s.kind == StepKind::DropForeignKey)
        .unwrap();
    let alter_position = plan
        .steps
        .iter()
        .position(|s| s.kind == StepKind::AlterColumn)
        .unwrap();
    let add_position = plan
        .steps
        .iter()
        .position(|s| s.kind == StepKind::AddForeignKey)
        .unwrap();
    assert!(drop_position < alter_position && alter_position < add_position);
}

#[test]
fn sqlite_type_change_becomes_a_rebuild_script() {
    let old_models = vec![validated(
        ModelDescriptor::new("Product").field(FieldDescriptor::new("code", FieldType::Int32)),
    )];
    let new_models = vec![validated(
        ModelDescriptor::new("Product").field(FieldDescriptor::new("code", FieldType::Int64)),
    )];

    let live = calculator::calculate(&old_models, SqlFamily::Sqlite).unwrap();
    let declared = calculator::calculate(&new_models, SqlFamily::Sqlite).unwrap();

    let plan = plan_for(SqlFamily::Sqlite, &declared, &live, HashMap::new());

    let rebuild = plan
        .steps
        .iter()
        .find(|s| s.kind == StepKind::AlterColumn)
        .expect("a rebuild step");
    assert!(rebuild.forward_sql.contains("_dataflow_new_Product"));
    assert!(matches!(rebuild.reverse, ReverseSql::Sql(_)));
}

#[test]
fn not_null_addition_without_default_fails_on_populated_table() {
    let old_models = vec![validated(
        ModelDescriptor::new("User").field(FieldDescriptor::new("email", FieldType::Text)),
    )];
    let new_models = vec![validated(
        ModelDescriptor::new("User")
            .field(FieldDescriptor::new("email", FieldType::Text))
            .field(FieldDescriptor::new("status", FieldType::Text)),
    )];

    let live = calculator::calculate(&old_models, SqlFamily::Sqlite).unwrap();
    let declared = calculator::calculate(&new_models, SqlFamily::Sqlite).unwrap();
    let diffs = differ::diff(&live, &declared, &DiffOptions::default());

    let mut row_counts = HashMap::new();
    row_counts.insert("User".to_owned(), 10u64);

    let err = build_plan(
        SqlFamily::Sqlite,
        &declared,
        &live,
        diffs,
        &row_counts,
        &MigrationOptions::default(),
    )
    .unwrap_err();

    assert!(matches!(err, MigrateError::MissingNotNullDefault { .. }));
}

#[test]
fn destructive_plans_in_production_score_high() {
    let old_models = vec![validated(
        ModelDescriptor::new("Audit").field(FieldDescriptor::new("entry", FieldType::Text)),
    )];

    let live = calculator::calculate(&old_models, SqlFamily::Sqlite).unwrap();
    let declared = SqlSchema::default();
    let diffs = differ::diff(&live, &declared, &DiffOptions::default());

    let mut row_counts = HashMap::new();
    row_counts.insert("Audit".to_owned(), 1_000_000u64);

    let options = MigrationOptions {
        production: true,
        verified_backup: false,
        ..Default::default()
    };

    let plan = build_plan(SqlFamily::Sqlite, &declared, &live, diffs, &row_counts, &options).unwrap();

    assert!(plan.risk.factors.contains(RiskFactor::Production));
    assert!(plan.risk.factors.contains(RiskFactor::DataLoss));
    assert!(plan.risk.factors.contains(RiskFactor::LargeTable));
    assert!(plan.risk.score > 60, "score: {}", plan.risk.score);
}

#[test]
fn empty_diff_is_an_empty_low_risk_plan() {
    let models = category_and_product();
    let schema = calculator::calculate(&models, SqlFamily::Sqlite).unwrap();

    let plan = plan_for(SqlFamily::Sqlite, &schema, &schema, HashMap::new());
    assert!(plan.is_empty());
    assert_eq!(plan.risk.score, 0);
}

#[test]
fn risk_bands() {
    assert_eq!(RiskBand::from_score(0), RiskBand::Low);
    assert_eq!(RiskBand::from_score(30), RiskBand::Low);
    assert_eq!(RiskBand::from_score(31), RiskBand::Medium);
    assert_eq!(RiskBand::from_score(61), RiskBand::High);
    assert_eq!(RiskBand::from_score(81), RiskBand::Critical);
    assert_eq!(RiskBand::from_score(100), RiskBand::Critical);
}
