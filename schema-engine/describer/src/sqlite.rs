//! SQLite introspection through the `pragma_*` table-valued functions.

use crate::{
    family_from_sql_type, Column, ColumnArity, ColumnType, DefaultValue, ForeignKey,
    ForeignKeyAction, Index, PrimaryKey, Result, SqlSchema, Table, View,
};
use dataflow_sql::connector::Queryable;
use dataflow_sql::Value;
use std::collections::BTreeMap;

pub(crate) async fn describe(conn: &dyn Queryable) -> Result<SqlSchema> {
    let mut tables = Vec::new();

    let table_rows = conn
        .query_raw(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            &[],
        )
        .await?;

    for row in table_rows.iter() {
        let name = row["name"].as_str().unwrap_or_default().to_owned();
        tables.push(describe_table(conn, &name).await?);
    }

    let view_rows = conn
        .query_raw(
            "SELECT name, sql FROM sqlite_master WHERE type = 'view' ORDER BY name",
            &[],
        )
        .await?;

    let views = view_rows
        .iter()
        .map(|row| View {
            name: row["name"].as_str().unwrap_or_default().to_owned(),
            definition: row["sql"].as_str().map(ToOwned::to_owned),
        })
        .collect();

    Ok(SqlSchema { tables, views })
}

async fn describe_table(conn: &dyn Queryable, name: &str) -> Result<Table> {
    let column_rows = conn
        .query_raw(
            "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?) ORDER BY cid",
            &[Value::text(name)],
        )
        .await?;

    let mut columns = Vec::new();
    let mut pk_columns: Vec<(i64, String)> = Vec::new();

    for row in column_rows.iter() {
        let column_name = row["name"].as_str().unwrap_or_default().to_owned();
        let raw_type = row["type"].as_str().unwrap_or_default().to_owned();
        let required = row["notnull"].as_i64().unwrap_or(0) != 0;
        let pk_position = row["pk"].as_i64().unwrap_or(0);

        if pk_position > 0 {
            pk_columns.push((pk_position, column_name.clone()));
        }

        let family = family_from_sql_type(&raw_type);
        // A lone INTEGER primary key aliases the rowid and auto-increments.
        let auto_increment =
            pk_position == 1 && raw_type.eq_ignore_ascii_case("INTEGER") && {
                column_rows
                    .iter()
                    .filter(|r| r["pk"].as_i64().unwrap_or(0) > 0)
                    .count()
                    == 1
            };

        columns.push(Column {
            name: column_name,
            tpe: ColumnType {
                family,
                arity: if required || pk_position > 0 {
                    ColumnArity::Required
                } else {
                    ColumnArity::Nullable
                },
                full_data_type: raw_type,
            },
            default: row["dflt_value"].as_str().map(parse_default),
            auto_increment,
        });
    }

    pk_columns.sort();
    let primary_key = if pk_columns.is_empty() {
        None
    } else {
        Some(PrimaryKey {
            columns: pk_columns.into_iter().map(|(_, c)| c).collect(),
        })
    };

    let indexes = describe_indexes(conn, name).await?;
    let foreign_keys = describe_foreign_keys(conn, name).await?;

    Ok(Table {
        name: name.to_owned(),
        columns,
        indexes,
        foreign_keys,
        primary_key,
    })
}

async fn describe_indexes(conn: &dyn Queryable, table: &str) -> Result<Vec<Index>> {
    let index_rows = conn
        .query_raw(
            "SELECT name, \"unique\", origin FROM pragma_index_list(?) ORDER BY name",
            &[Value::text(table)],
        )
        .await?;

    let mut indexes = Vec::new();

    for row in index_rows.iter() {
        // The implicit primary-key index is modeled separately.
        if row["origin"].as_str() == Some("pk") {
            continue;
        }

        let name = row["name"].as_str().unwrap_or_default().to_owned();

        let column_rows = conn
            .query_raw(
                "SELECT name FROM pragma_index_info(?) ORDER BY seqno",
                &[Value::text(&name)],
            )
            .await?;

        let columns = column_rows
            .iter()
            .filter_map(|r| r["name"].as_str().map(ToOwned::to_owned))
            .collect();

        indexes.push(Index {
            name,
            columns,
            unique: row["unique"].as_i64().unwrap_or(0) != 0,
        });
    }

    Ok(indexes)
}

async fn describe_foreign_keys(conn: &dyn Queryable, table: &str) -> Result<Vec<ForeignKey>> {
    let rows = conn
        .query_raw(
            "SELECT id, seq, \"table\", \"from\", \"to\", on_delete FROM pragma_foreign_key_list(?) ORDER BY id, seq",
            &[Value::text(table)],
        )
        .await?;

    let mut grouped: BTreeMap<i64, ForeignKey> = BTreeMap::new();

    for row in rows.iter() {
        let id = row["id"].as_i64().unwrap_or(0);
        let referenced_table = row["table"].as_str().unwrap_or_default().to_owned();
        let column = row["from"].as_str().unwrap_or_default().to_owned();
        // A missing `to` column means "the referenced table's primary key".
        let referenced_column = row["to"].as_str().unwrap_or("id").to_owned();

        let entry = grouped.entry(id).or_insert_with(|| ForeignKey {
            constraint_name: None,
            columns: Vec::new(),
            referenced_table,
            referenced_columns: Vec::new(),
            on_delete_action: parse_fk_action(row["on_delete"].as_str().unwrap_or("NO ACTION")),
        });

        entry.columns.push(column);
        entry.referenced_columns.push(referenced_column);
    }

    Ok(grouped.into_values().collect())
}

fn parse_fk_action(raw: &str) -> ForeignKeyAction {
    match raw.to_ascii_uppercase().as_str() {
        "CASCADE" => ForeignKeyAction::Cascade,
        "RESTRICT" => ForeignKeyAction::Restrict,
        "SET NULL" => ForeignKeyAction::SetNull,
        "SET DEFAULT" => ForeignKeyAction::SetDefault,
        _ => ForeignKeyAction::NoAction,
    }
}

fn parse_default(raw: &str) -> DefaultValue {
    let trimmed = raw.trim();
    let upper = trimmed.to_ascii_uppercase();

    if upper == "CURRENT_TIMESTAMP" || upper == "CURRENT_TIMESTAMP()" || upper == "NOW()" {
        return DefaultValue::Now;
    }

    if trimmed.starts_with('\'') && trimmed.ends_with('\'') && trimmed.len() >= 2 {
        return DefaultValue::Literal(trimmed[1..trimmed.len() - 1].replace("''", "'"));
    }

    if trimmed.starts_with('(') || trimmed.contains('(') {
        return DefaultValue::DbGenerated(trimmed.to_owned());
    }

    DefaultValue::Literal(trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_sql::connector::Sqlite;

    async fn schema_of(ddl: &str) -> SqlSchema {
        let conn = Sqlite::new_in_memory().unwrap();
        conn.raw_cmd(ddl).await.unwrap();
        describe(&conn).await.unwrap()
    }

    #[tokio::test]
    async fn describes_columns_types_and_pk() {
        let schema = schema_of(
            "CREATE TABLE users (\
                id INTEGER PRIMARY KEY,\
                email VARCHAR(255) NOT NULL,\
                active BOOLEAN NOT NULL DEFAULT true,\
                bio TEXT,\
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP\
            )",
        )
        .await;

        let table = schema.table("users").unwrap();
        assert_eq!(table.columns.len(), 5);

        let id = table.column("id").unwrap();
        assert_eq!(id.tpe.family, crate::ColumnTypeFamily::Int);
        assert!(id.auto_increment);

        let email = table.column("email").unwrap();
        assert_eq!(email.tpe.family, crate::ColumnTypeFamily::String);
        assert_eq!(email.tpe.arity, ColumnArity::Required);

        let bio = table.column("bio").unwrap();
        assert_eq!(bio.tpe.arity, ColumnArity::Nullable);

        let created = table.column("created_at").unwrap();
        assert_eq!(created.default, Some(DefaultValue::Now));

        assert_eq!(
            table.primary_key.as_ref().unwrap().columns,
            vec!["id".to_owned()]
        );
    }

    #[tokio::test]
    async fn describes_indexes_and_uniques() {
        let schema = schema_of(
            "CREATE TABLE t (a TEXT, b TEXT);\
             CREATE UNIQUE INDEX t_a_unique ON t (a);\
             CREATE INDEX t_b_idx ON t (b);",
        )
        .await;

        let table = schema.table("t").unwrap();
        let unique = table.index("t_a_unique").unwrap();
        assert!(unique.unique);
        assert_eq!(unique.columns, vec!["a".to_owned()]);

        let plain = table.index("t_b_idx").unwrap();
        assert!(!plain.unique);
    }

    #[tokio::test]
    async fn describes_foreign_keys() {
        let schema = schema_of(
            "CREATE TABLE categories (id INTEGER PRIMARY KEY, name TEXT);\
             CREATE TABLE products (\
                id INTEGER PRIMARY KEY,\
                category_id BIGINT REFERENCES categories (id) ON DELETE CASCADE\
             );",
        )
        .await;

        let table = schema.table("products").unwrap();
        assert_eq!(table.foreign_keys.len(), 1);

        let fk = &table.foreign_keys[0];
        assert_eq!(fk.columns, vec!["category_id".to_owned()]);
        assert_eq!(fk.referenced_table, "categories");
        assert_eq!(fk.referenced_columns, vec!["id".to_owned()]);
        assert_eq!(fk.on_delete_action, ForeignKeyAction::Cascade);
    }

    #[tokio::test]
    async fn default_parsing() {
        assert_eq!(parse_default("'hello'"), DefaultValue::Literal("hello".to_owned()));
        assert_eq!(parse_default("42"), DefaultValue::Literal("42".to_owned()));
        assert_eq!(parse_default("CURRENT_TIMESTAMP"), DefaultValue::Now);
        assert!(matches!(parse_default("(abs(-1))"), DefaultValue::DbGenerated(_)));
    }
}
