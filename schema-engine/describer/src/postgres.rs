//! PostgreSQL introspection over `information_schema` and `pg_catalog`.
//!
//! Scoped to the `public` schema.

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
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
            &[],
        )
        .await?;

    for row in table_rows.iter() {
        let name = row["table_name"].as_str().unwrap_or_default().to_owned();
        tables.push(describe_table(conn, &name).await?);
    }

    let view_rows = conn
        .query_raw(
            "SELECT table_name, view_definition FROM information_schema.views \
             WHERE table_schema = 'public' ORDER BY table_name",
            &[],
        )
        .await?;

    let views = view_rows
        .iter()
        .map(|row| View {
            name: row["table_name"].as_str().unwrap_or_default().to_owned(),
            definition: row["view_definition"].as_str().map(ToOwned::to_owned),
        })
        .collect();

    Ok(SqlSchema { tables, views })
}

async fn describe_table(conn: &dyn Queryable, name: &str) -> Result<Table> {
    let column_rows = conn
        .query_raw(
            "SELECT column_name, data_type, is_nullable, column_default, is_identity \
             FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 \
             ORDER BY ordinal_position",
            &[Value::text(name)],
        )
        .await?;

    let columns = column_rows
        .iter()
        .map(|row| {
            let raw_type = row["data_type"].as_str().unwrap_or_default().to_owned();
            let default_raw = row["column_default"].as_str();
            let auto_increment = row["is_identity"].as_str() == Some("YES")
                || default_raw.map(|d| d.starts_with("nextval(")).unwrap_or(false);

            Column {
                name: row["column_name"].as_str().unwrap_or_default().to_owned(),
                tpe: ColumnType {
                    family: family_from_sql_type(&raw_type),
                    arity: if row["is_nullable"].as_str() == Some("YES") {
                        ColumnArity::Nullable
                    } else {
                        ColumnArity::Required
                    },
                    full_data_type: raw_type,
                },
                default: if auto_increment {
                    None
                } else {
                    default_raw.map(parse_default)
                },
                auto_increment,
            }
        })
        .collect();

    let (indexes, primary_key) = describe_indexes(conn, name).await?;
    let foreign_keys = describe_foreign_keys(conn, name).await?;

    Ok(Table {
        name: name.to_owned(),
        columns,
        indexes,
        foreign_keys,
        primary_key,
    })
}

async fn describe_indexes(
    conn: &dyn Queryable,
    table: &str,
) -> Result<(Vec<Index>, Option<PrimaryKey>)> {
    let rows = conn
        .query_raw(
            "SELECT i.relname AS index_name, \
                    ix.indisunique AS is_unique, \
                    ix.indisprimary AS is_primary, \
                    a.attname AS column_name, \
                    array_position(ix.indkey::int2[], a.attnum) AS position \
             FROM pg_class t \
             JOIN pg_index ix ON t.oid = ix.indrelid \
             JOIN pg_class i ON i.oid = ix.indexrelid \
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY (ix.indkey) \
             JOIN pg_namespace n ON n.oid = t.relnamespace \
             WHERE n.nspname = 'public' AND t.relname = $1 \
             ORDER BY i.relname, position",
            &[Value::text(table)],
        )
        .await?;

    let mut grouped: BTreeMap<String, (bool, bool, Vec<String>)> = BTreeMap::new();

    for row in rows.iter() {
        let index_name = row["index_name"].as_str().unwrap_or_default().to_owned();
        let entry = grouped.entry(index_name).or_insert_with(|| {
            (
                row["is_unique"].as_bool().unwrap_or(false),
                row["is_primary"].as_bool().unwrap_or(false),
                Vec::new(),
            )
        });
        if let Some(column) = row["column_name"].as_str() {
            entry.2.push(column.to_owned());
        }
    }

    let mut indexes = Vec::new();
    let mut primary_key = None;

    for (name, (unique, primary, columns)) in grouped {
        if primary {
            primary_key = Some(PrimaryKey { columns });
        } else {
            indexes.push(Index { name, columns, unique });
        }
    }

    Ok((indexes, primary_key))
}

async fn describe_foreign_keys(conn: &dyn Queryable, table: &str) -> Result<Vec<ForeignKey>> {
    let rows = conn
        .query_raw(
            "SELECT con.conname AS constraint_name, \
                    src.attname AS column_name, \
                    ref_table.relname AS referenced_table, \
                    ref.attname AS referenced_column, \
                    con.confdeltype::text AS on_delete, \
                    k.ord AS ord \
             FROM pg_constraint con \
             JOIN pg_class src_table ON src_table.oid = con.conrelid \
             JOIN pg_namespace n ON n.oid = src_table.relnamespace \
             JOIN pg_class ref_table ON ref_table.oid = con.confrelid \
             JOIN LATERAL unnest(con.conkey, con.confkey) \
                  WITH ORDINALITY AS k(src_attnum, ref_attnum, ord) ON true \
             JOIN pg_attribute src ON src.attrelid = con.conrelid AND src.attnum = k.src_attnum \
             JOIN pg_attribute ref ON ref.attrelid = con.confrelid AND ref.attnum = k.ref_attnum \
             WHERE con.contype = 'f' AND n.nspname = 'public' AND src_table.relname = $1 \
             ORDER BY con.conname, k.ord",
            &[Value::text(table)],
        )
        .await?;

    let mut grouped: BTreeMap<String, ForeignKey> = BTreeMap::new();

    for row in rows.iter() {
        let constraint = row["constraint_name"].as_str().unwrap_or_default().to_owned();
        let referenced_table = row["referenced_table"].as_str().unwrap_or_default().to_owned();
        let on_delete = parse_fk_action(row["on_delete"].as_str().unwrap_or("a"));

        let entry = grouped.entry(constraint.clone()).or_insert_with(|| ForeignKey {
            constraint_name: Some(constraint),
            columns: Vec::new(),
            referenced_table,
            referenced_columns: Vec::new(),
            on_delete_action: on_delete,
        });

        if let Some(column) = row["column_name"].as_str() {
            entry.columns.push(column.to_owned());
        }
        if let Some(column) = row["referenced_column"].as_str() {
            entry.referenced_columns.push(column.to_owned());
        }
    }

    Ok(grouped.into_values().collect())
}

fn parse_fk_action(code: &str) -> ForeignKeyAction {
    match code {
        "c" => ForeignKeyAction::Cascade,
        "r" => ForeignKeyAction::Restrict,
        "n" => ForeignKeyAction::SetNull,
        "d" => ForeignKeyAction::SetDefault,
        _ => ForeignKeyAction::NoAction,
    }
}

fn parse_default(raw: &str) -> DefaultValue {
    let trimmed = raw.trim();
    let lowered = trimmed.to_ascii_lowercase();

    if lowered.starts_with("now()") || lowered.starts_with("current_timestamp") {
        return DefaultValue::Now;
    }

    if lowered.starts_with("gen_random_uuid()") || lowered.starts_with("uuid_generate_v4()") {
        return DefaultValue::Uuid;
    }

    // Literals come back as `'text'::character varying` or bare numbers.
    if let Some(rest) = trimmed.strip_prefix('\'') {
        if let Some(end) = rest.find('\'') {
            return DefaultValue::Literal(rest[..end].replace("''", "'"));
        }
    }

    let bare = trimmed.split("::").next().unwrap_or(trimmed);
    if bare.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-')
        || bare == "true"
        || bare == "false"
    {
        return DefaultValue::Literal(bare.to_owned());
    }

    DefaultValue::DbGenerated(trimmed.to_owned())
}
