//! The query interceptor.
//!
//! Every SQL path runs through these hooks before an AST reaches a visitor:
//! tenant predicates on multi-tenant models, soft-delete filters, audit
//! column population. There are exactly eight interception points, one per
//! statement kind.

use crate::context::ExecutionContext;
use crate::{Error, ErrorKind, Result};
use chrono::Utc;
use dataflow_model::ModelDescriptor;
use dataflow_sql::ast::{Comparable, ConditionTree};
use dataflow_value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    SingleSelect,
    ListSelect,
    Count,
    Insert,
    Update,
    Delete,
    Upsert,
    BulkDml,
}

/// The active tenant for a model, or the reason there is none.
fn tenant_for(model: &ModelDescriptor, ctx: &ExecutionContext) -> Result<Option<String>> {
    if !model.config.multi_tenant {
        return Ok(None);
    }

    match &ctx.tenant {
        Some(tenant) => Ok(Some(tenant.clone())),
        None => Err(Error::new(ErrorKind::TenantRequired)),
    }
}

/// Rewrites a read's conditions: tenant scoping and the soft-delete filter.
pub fn read_conditions(
    model: &ModelDescriptor,
    ctx: &ExecutionContext,
    kind: StatementKind,
    base: ConditionTree,
    include_deleted: bool,
) -> Result<ConditionTree> {
    debug_assert!(matches!(
        kind,
        StatementKind::SingleSelect | StatementKind::ListSelect | StatementKind::Count
    ));

    let mut conditions = base;

    if let Some(tenant) = tenant_for(model, ctx)? {
        conditions = conditions.and_also("tenant_id".equals(Value::text(tenant)));
    }

    if model.config.soft_delete && !include_deleted {
        conditions = conditions.and_also("deleted_at".equals(Value::null_datetime()));
    }

    Ok(conditions)
}

/// Rewrites a write's conditions (update/delete): same scoping as reads —
/// a write must never escape its tenant or resurrect soft-deleted rows.
pub fn write_conditions(
    model: &ModelDescriptor,
    ctx: &ExecutionContext,
    kind: StatementKind,
    base: ConditionTree,
) -> Result<ConditionTree> {
    debug_assert!(matches!(
        kind,
        StatementKind::Update | StatementKind::Delete | StatementKind::BulkDml
    ));

    let mut conditions = base;

    if let Some(tenant) = tenant_for(model, ctx)? {
        conditions = conditions.and_also("tenant_id".equals(Value::text(tenant)));
    }

    if model.config.soft_delete {
        conditions = conditions.and_also("deleted_at".equals(Value::null_datetime()));
    }

    Ok(conditions)
}

/// Populates the implicit columns of an insert-shaped statement: tenant id,
/// audit columns, the version counter.
pub fn insert_values(
    model: &ModelDescriptor,
    ctx: &ExecutionContext,
    kind: StatementKind,
    values: &mut Vec<(String, Value)>,
) -> Result<()> {
    debug_assert!(matches!(
        kind,
        StatementKind::Insert | StatementKind::Upsert | StatementKind::BulkDml
    ));

    if let Some(tenant) = tenant_for(model, ctx)? {
        values.push(("tenant_id".to_owned(), Value::text(tenant)));
    }

    if model.config.audit_log {
        let now = Value::datetime(Utc::now());
        let user = ctx
            .user
            .clone()
            .map(Value::text)
            .unwrap_or(Value::null_text());

        values.push(("created_at".to_owned(), now.clone()));
        values.push(("updated_at".to_owned(), now));
        values.push(("created_by".to_owned(), user.clone()));
        values.push(("updated_by".to_owned(), user));
    }

    if model.config.versioned {
        values.push(("version".to_owned(), Value::int64(1i64)));
    }

    Ok(())
}

/// Populates the implicit assignments of an update-shaped statement.
pub fn update_values(
    model: &ModelDescriptor,
    ctx: &ExecutionContext,
    values: &mut Vec<(String, Value)>,
) {
    if model.config.audit_log {
        values.push(("updated_at".to_owned(), Value::datetime(Utc::now())));
        values.push((
            "updated_by".to_owned(),
            ctx.user.clone().map(Value::text).unwrap_or(Value::null_text()),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_model::{FieldDescriptor, FieldType, ModelConfig};
    use dataflow_sql::ast::Select;
    use dataflow_sql::visitor::{Postgres, Visitor};

    fn tenant_model() -> ModelDescriptor {
        let mut model = ModelDescriptor::new("Doc")
            .field(FieldDescriptor::new("title", FieldType::Text))
            .config(ModelConfig {
                multi_tenant: true,
                soft_delete: true,
                ..Default::default()
            });
        model.validate().unwrap();
        model
    }

    fn ctx_for(tenant: Option<&str>) -> ExecutionContext {
        ExecutionContext::new(tenant.map(ToOwned::to_owned), Some("tester".to_owned()))
    }

    #[test]
    fn tenant_predicate_is_injected_into_reads() {
        let model = tenant_model();
        let conditions = read_conditions(
            &model,
            &ctx_for(Some("acme")),
            StatementKind::ListSelect,
            ConditionTree::NoCondition,
            false,
        )
        .unwrap();

        let (sql, params) = Postgres::build(Select::from_table("Doc").so_that(conditions)).unwrap();
        assert_eq!(
            sql,
            r#"SELECT * FROM "Doc" WHERE "tenant_id" = $1 AND "deleted_at" IS NULL"#
        );
        assert_eq!(params, vec![Value::text("acme")]);
    }

    #[test]
    fn missing_tenant_is_an_error_not_a_full_scan() {
        let model = tenant_model();
        let err = read_conditions(
            &model,
            &ctx_for(None),
            StatementKind::ListSelect,
            ConditionTree::NoCondition,
            false,
        )
        .unwrap_err();

        assert!(matches!(err.kind(), ErrorKind::TenantRequired));
    }

    #[test]
    fn include_deleted_lifts_the_soft_delete_filter() {
        let model = tenant_model();
        let conditions = read_conditions(
            &model,
            &ctx_for(Some("acme")),
            StatementKind::ListSelect,
            ConditionTree::NoCondition,
            true,
        )
        .unwrap();

        let (sql, _) = Postgres::build(Select::from_table("Doc").so_that(conditions)).unwrap();
        assert!(!sql.contains("deleted_at"));
    }

    #[test]
    fn audit_columns_are_populated_on_insert() {
        let mut model = ModelDescriptor::new("Doc")
            .field(FieldDescriptor::new("title", FieldType::Text))
            .config(ModelConfig {
                audit_log: true,
                versioned: true,
                ..Default::default()
            });
        model.validate().unwrap();

        let mut values = vec![("title".to_owned(), Value::text("x"))];
        insert_values(&model, &ctx_for(None), StatementKind::Insert, &mut values).unwrap();

        let names: Vec<&str> = values.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["title", "created_at", "updated_at", "created_by", "updated_by", "version"]
        );
        assert_eq!(
            values.iter().find(|(n, _)| n == "created_by").unwrap().1,
            Value::text("tester")
        );
    }

    #[test]
    fn plain_models_pass_through_untouched() {
        let mut model = ModelDescriptor::new("Plain").field(FieldDescriptor::new("x", FieldType::Text));
        model.validate().unwrap();

        let conditions = read_conditions(
            &model,
            &ctx_for(None),
            StatementKind::Count,
            ConditionTree::NoCondition,
            false,
        )
        .unwrap();
        assert_eq!(conditions, ConditionTree::NoCondition);

        let mut values = vec![];
        insert_values(&model, &ctx_for(None), StatementKind::Insert, &mut values).unwrap();
        assert!(values.is_empty());
    }
}
