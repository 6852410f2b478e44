//! Lowers declared models into the expected [`SqlSchema`] for a dialect.
//!
//! The output uses the same vocabulary the describer produces from a live
//! database, so the differ compares like with like.

use crate::Result;
use dataflow_describer::{
    Column, ColumnArity, ColumnType, DefaultValue, ForeignKey, ForeignKeyAction, Index, PrimaryKey,
    SqlSchema, Table,
};
use dataflow_model::{DefaultSpec, FieldDescriptor, FieldType, FunctionToken, ModelDescriptor};
use dataflow_sql::connector::SqlFamily;
use std::collections::HashMap;

pub fn calculate(models: &[ModelDescriptor], family: SqlFamily) -> Result<SqlSchema> {
    // Resolve model name → table name up front for FK targets.
    let table_names: HashMap<&str, &str> = models
        .iter()
        .map(|m| (m.name.as_str(), m.table_name()))
        .collect();

    let mut tables = Vec::with_capacity(models.len());

    for model in models {
        tables.push(calculate_table(model, &table_names, family));
    }

    tables.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(SqlSchema {
        tables,
        views: Vec::new(),
    })
}

fn calculate_table(
    model: &ModelDescriptor,
    table_names: &HashMap<&str, &str>,
    family: SqlFamily,
) -> Table {
    let all_fields = model.all_fields();
    let mut columns = Vec::with_capacity(all_fields.len());
    let mut indexes = Vec::new();
    let mut foreign_keys = Vec::new();

    for field in &all_fields {
        columns.push(calculate_column(field, family));

        if field.unique && field.name != model.primary_key {
            indexes.push(Index {
                name: format!("{}_{}_key", model.table_name(), field.name),
                columns: vec![field.name.clone()],
                unique: true,
            });
        } else if field.indexed {
            indexes.push(Index {
                name: format!("{}_{}_idx", model.table_name(), field.name),
                columns: vec![field.name.clone()],
                unique: false,
            });
        }

        if let Some(reference) = &field.references {
            let referenced_table = table_names
                .get(reference.model.as_str())
                .copied()
                .unwrap_or(reference.model.as_str())
                .to_owned();

            foreign_keys.push(ForeignKey {
                constraint_name: Some(format!(
                    "{}_{}_fkey",
                    model.table_name(),
                    field.name
                )),
                columns: vec![field.name.clone()],
                referenced_table,
                referenced_columns: vec![reference.field.clone()],
                on_delete_action: if reference.on_delete_cascade {
                    ForeignKeyAction::Cascade
                } else {
                    ForeignKeyAction::NoAction
                },
            });
        }
    }

    for index in &model.config.indexes {
        indexes.push(Index {
            name: format!("{}_{}_idx", model.table_name(), index.columns.join("_")),
            columns: index.columns.clone(),
            unique: index.unique,
        });
    }

    for constraint in &model.config.unique_constraints {
        indexes.push(Index {
            name: format!("{}_{}_key", model.table_name(), constraint.join("_")),
            columns: constraint.clone(),
            unique: true,
        });
    }

    Table {
        name: model.table_name().to_owned(),
        columns,
        indexes,
        foreign_keys,
        primary_key: Some(PrimaryKey {
            columns: vec![model.primary_key.clone()],
        }),
    }
}

fn calculate_column(field: &FieldDescriptor, family: SqlFamily) -> Column {
    // On SQLite only an INTEGER primary key aliases the rowid, which is what
    // gives it auto-increment behavior. The live schema reads back as
    // INTEGER either way, so the expected schema has to say the same.
    let full_data_type = if field.auto_increment && family == SqlFamily::Sqlite {
        "INTEGER".to_owned()
    } else {
        column_type(&field.tpe, family)
    };

    Column {
        name: field.name.clone(),
        tpe: ColumnType {
            family: dataflow_describer::family_from_sql_type(&full_data_type),
            arity: if field.nullable {
                ColumnArity::Nullable
            } else {
                ColumnArity::Required
            },
            full_data_type,
        },
        default: field.default.as_ref().and_then(|d| calculate_default(d, family)),
        auto_increment: field.auto_increment,
    }
}

/// The dialect spelling of a declared field type.
pub fn column_type(tpe: &FieldType, family: SqlFamily) -> String {
    match (tpe, family) {
        (FieldType::Int32, _) => "INTEGER".to_owned(),
        (FieldType::Int64, _) => "BIGINT".to_owned(),

        (FieldType::Float64, SqlFamily::Postgres) => "DOUBLE PRECISION".to_owned(),
        (FieldType::Float64, SqlFamily::Mysql) => "DOUBLE".to_owned(),
        (FieldType::Float64, SqlFamily::Sqlite) => "REAL".to_owned(),

        (FieldType::String(Some(n)), _) => format!("VARCHAR({n})"),
        (FieldType::String(None), _) | (FieldType::Text, _) => "TEXT".to_owned(),

        (FieldType::Bool, _) => "BOOLEAN".to_owned(),

        (FieldType::Bytes, SqlFamily::Postgres) => "BYTEA".to_owned(),
        (FieldType::Bytes, SqlFamily::Mysql) => "LONGBLOB".to_owned(),
        (FieldType::Bytes, SqlFamily::Sqlite) => "BLOB".to_owned(),

        (FieldType::Timestamp, SqlFamily::Postgres) => "TIMESTAMPTZ".to_owned(),
        (FieldType::Timestamp, _) => "DATETIME".to_owned(),

        (FieldType::Date, _) => "DATE".to_owned(),

        (FieldType::Uuid, SqlFamily::Postgres) => "UUID".to_owned(),
        (FieldType::Uuid, SqlFamily::Mysql) => "CHAR(36)".to_owned(),
        (FieldType::Uuid, SqlFamily::Sqlite) => "UUID".to_owned(),

        (FieldType::Json, SqlFamily::Postgres) => "JSONB".to_owned(),
        (FieldType::Json, _) => "JSON".to_owned(),

        (FieldType::Decimal(p, s), _) => format!("DECIMAL({p},{s})"),

        // Vectors travel as their JSON encoding; a pgvector column type is
        // a drop-in replacement here if the extension is in play.
        (FieldType::Vector(_), SqlFamily::Postgres) => "JSONB".to_owned(),
        (FieldType::Vector(_), _) => "JSON".to_owned(),
    }
}

fn calculate_default(spec: &DefaultSpec, family: SqlFamily) -> Option<DefaultValue> {
    match spec {
        DefaultSpec::Literal(value) => {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some(DefaultValue::Literal(rendered))
        }
        DefaultSpec::Function(FunctionToken::Now | FunctionToken::CurrentTimestamp) => {
            Some(DefaultValue::Now)
        }
        DefaultSpec::Function(FunctionToken::Uuid) => match family {
            SqlFamily::Postgres => Some(DefaultValue::Uuid),
            // No uuid function in the other dialects; the engine fills the
            // value at insert time instead.
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_model::{FieldDescriptor, ModelConfig};

    fn models() -> Vec<ModelDescriptor> {
        let mut category = ModelDescriptor::new("Category")
            .field(FieldDescriptor::new("name", FieldType::String(Some(100))).unique());
        category.validate().unwrap();

        let mut product = ModelDescriptor::new("Product")
            .field(FieldDescriptor::new("category_id", FieldType::Int64).references("Category", "id"))
            .field(FieldDescriptor::new("price", FieldType::Decimal(10, 2)).nullable())
            .config(ModelConfig {
                soft_delete: true,
                ..Default::default()
            });
        product.validate().unwrap();

        vec![category, product]
    }

    #[test]
    fn calculates_tables_columns_and_fks() {
        let schema = calculate(&models(), SqlFamily::Sqlite).unwrap();

        let product = schema.table("Product").unwrap();
        assert!(product.column("id").unwrap().auto_increment);
        assert_eq!(
            product.column("price").unwrap().tpe.full_data_type,
            "DECIMAL(10,2)"
        );
        // soft_delete implies a nullable deleted_at column.
        assert_eq!(
            product.column("deleted_at").unwrap().tpe.arity,
            ColumnArity::Nullable
        );

        let fk = &product.foreign_keys[0];
        assert_eq!(fk.referenced_table, "Category");
        assert_eq!(fk.columns, vec!["category_id".to_owned()]);
    }

    #[test]
    fn unique_fields_become_unique_indexes() {
        let schema = calculate(&models(), SqlFamily::Postgres).unwrap();
        let category = schema.table("Category").unwrap();

        let index = category.index("Category_name_key").unwrap();
        assert!(index.unique);
    }

    #[test]
    fn families_agree_between_calculator_and_describer() {
        // Whatever the calculator spells, the describer must classify into
        // the family the declaration meant.
        use dataflow_describer::ColumnTypeFamily as F;

        for (tpe, family, expected) in [
            (FieldType::Int32, SqlFamily::Sqlite, F::Int),
            (FieldType::Int64, SqlFamily::Postgres, F::BigInt),
            (FieldType::Timestamp, SqlFamily::Sqlite, F::DateTime),
            (FieldType::Timestamp, SqlFamily::Postgres, F::DateTime),
            (FieldType::Decimal(10, 2), SqlFamily::Mysql, F::Decimal),
            (FieldType::Vector(3), SqlFamily::Postgres, F::Json),
        ] {
            let spelled = column_type(&tpe, family);
            assert_eq!(dataflow_describer::family_from_sql_type(&spelled), expected);
        }
    }
}
