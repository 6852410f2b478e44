//! Engine-managed state in the target database: the migration history
//! table, the model-registry view over it, and the advisory lock table.

use crate::{MigrateError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dataflow_model::ModelDescriptor;
use dataflow_sql::connector::{Queryable, SqlFamily};
use dataflow_sql::Value;
use std::time::Duration;

pub const MIGRATIONS_TABLE: &str = "dataflow_migrations";
pub const MODEL_REGISTRY_VIEW: &str = "dataflow_model_registry";
pub const LOCKS_TABLE: &str = "dataflow_migration_locks";

/// The advisory-lock scope for whole-schema migrations.
pub const SCHEMA_LOCK: &str = "dataflow_schema";

/// Tables the engine owns; the differ never touches them.
pub fn is_engine_table(name: &str) -> bool {
    name == MIGRATIONS_TABLE
        || name == LOCKS_TABLE
        || name.starts_with("dataflow_staging_")
        || name.starts_with("_dataflow_new_")
}

pub async fn ensure_history_tables(conn: &dyn Queryable) -> Result<()> {
    let (id_column, timestamp_type) = match conn.sql_family() {
        SqlFamily::Postgres => ("id BIGSERIAL PRIMARY KEY", "TIMESTAMPTZ"),
        SqlFamily::Mysql => ("id BIGINT PRIMARY KEY AUTO_INCREMENT", "DATETIME"),
        SqlFamily::Sqlite => ("id INTEGER PRIMARY KEY AUTOINCREMENT", "DATETIME"),
    };

    conn.raw_cmd(&format!(
        "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (\
            {id_column},\
            version VARCHAR(63) NOT NULL,\
            checksum VARCHAR(64) NOT NULL,\
            applied_at {timestamp_type} NOT NULL,\
            status VARCHAR(32) NOT NULL,\
            forward_sql TEXT NOT NULL,\
            reverse_sql TEXT NOT NULL,\
            application_id VARCHAR(63) NOT NULL,\
            model_definitions TEXT NOT NULL,\
            model_registry_sync BOOLEAN NOT NULL DEFAULT true\
        )"
    ))
    .await?;

    conn.raw_cmd(&format!(
        "CREATE TABLE IF NOT EXISTS {LOCKS_TABLE} (\
            lock_name VARCHAR(63) PRIMARY KEY,\
            holder_process_id BIGINT NOT NULL,\
            acquired_at {timestamp_type} NOT NULL,\
            expires_at {timestamp_type} NOT NULL\
        )"
    ))
    .await?;

    let view_body = format!(
        "SELECT application_id, model_definitions, checksum AS model_checksum, \
         applied_at AS registered_at, version AS schema_version \
         FROM {MIGRATIONS_TABLE} WHERE model_registry_sync"
    );

    let view_ddl = match conn.sql_family() {
        SqlFamily::Postgres | SqlFamily::Mysql => {
            format!("CREATE OR REPLACE VIEW {MODEL_REGISTRY_VIEW} AS {view_body}")
        }
        SqlFamily::Sqlite => {
            format!("CREATE VIEW IF NOT EXISTS {MODEL_REGISTRY_VIEW} AS {view_body}")
        }
    };

    conn.raw_cmd(&view_ddl).await?;
    Ok(())
}

/// A migration history row.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub version: String,
    pub checksum: String,
    pub applied_at: Option<DateTime<Utc>>,
    pub status: String,
    pub application_id: String,
}

pub async fn migration_status(conn: &dyn Queryable) -> Result<Vec<MigrationRecord>> {
    let rows = conn
        .query_raw(
            &format!(
                "SELECT version, checksum, applied_at, status, application_id \
                 FROM {MIGRATIONS_TABLE} ORDER BY id"
            ),
            &[],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| MigrationRecord {
            version: row["version"].as_str().unwrap_or_default().to_owned(),
            checksum: row["checksum"].as_str().unwrap_or_default().to_owned(),
            applied_at: row["applied_at"].as_datetime(),
            status: row["status"].as_str().unwrap_or_default().to_owned(),
            application_id: row["application_id"].as_str().unwrap_or_default().to_owned(),
        })
        .collect())
}

pub struct NewMigration<'a> {
    pub version: String,
    pub checksum: String,
    pub status: &'a str,
    pub forward_sql: String,
    pub reverse_sql: String,
    pub application_id: String,
    pub models: &'a [ModelDescriptor],
}

pub async fn record_migration(conn: &dyn Queryable, entry: NewMigration<'_>) -> Result<()> {
    let model_definitions = serde_json::to_string(entry.models)
        .map_err(|e| dataflow_sql::Error::new(dataflow_sql::ErrorKind::QueryError(e.to_string())))?;

    let placeholders = match conn.sql_family() {
        SqlFamily::Postgres => "($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        _ => "(?, ?, ?, ?, ?, ?, ?, ?, ?)",
    };

    conn.execute_raw(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} \
             (version, checksum, applied_at, status, forward_sql, reverse_sql, \
              application_id, model_definitions, model_registry_sync) \
             VALUES {placeholders}"
        ),
        &[
            Value::text(entry.version),
            Value::text(entry.checksum),
            Value::datetime(Utc::now()),
            Value::text(entry.status),
            Value::text(entry.forward_sql),
            Value::text(entry.reverse_sql),
            Value::text(entry.application_id),
            Value::text(model_definitions),
            Value::boolean(true),
        ],
    )
    .await?;

    Ok(())
}

/// Acquires the named advisory lock or reports who holds it. Locks expire
/// after `timeout`; an expired lock may be taken over, and `force` takes
/// over regardless.
pub async fn acquire_lock(
    conn: &dyn Queryable,
    lock_name: &str,
    timeout: Duration,
    force: bool,
) -> Result<()> {
    let select = match conn.sql_family() {
        SqlFamily::Postgres => format!(
            "SELECT holder_process_id, acquired_at, expires_at FROM {LOCKS_TABLE} WHERE lock_name = $1"
        ),
        _ => format!(
            "SELECT holder_process_id, acquired_at, expires_at FROM {LOCKS_TABLE} WHERE lock_name = ?"
        ),
    };

    let rows = conn.query_raw(&select, &[Value::text(lock_name)]).await?;

    if let Some(row) = rows.first() {
        let holder_pid = row["holder_process_id"].as_i64().unwrap_or(-1);
        let acquired_at = row["acquired_at"].as_datetime();
        let expires_at = row["expires_at"].as_datetime();
        let expired = expires_at.map(|at| at <= Utc::now()).unwrap_or(true);

        if !expired && !force {
            return Err(MigrateError::LockHeld {
                holder_pid,
                acquired_at: acquired_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_owned()),
            });
        }

        release_lock(conn, lock_name).await?;
    }

    let now = Utc::now();
    let expires = now + ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::hours(1));

    let insert = match conn.sql_family() {
        SqlFamily::Postgres => {
            format!("INSERT INTO {LOCKS_TABLE} (lock_name, holder_process_id, acquired_at, expires_at) VALUES ($1, $2, $3, $4)")
        }
        _ => {
            format!("INSERT INTO {LOCKS_TABLE} (lock_name, holder_process_id, acquired_at, expires_at) VALUES (?, ?, ?, ?)")
        }
    };

    let result = conn
        .execute_raw(
            &insert,
            &[
                Value::text(lock_name),
                Value::int64(i64::from(std::process::id())),
                Value::datetime(now),
                Value::datetime(expires),
            ],
        )
        .await;

    match result {
        Ok(_) => Ok(()),
        // Losing the insert race means someone else just took the lock.
        Err(e) if e.is_constraint_violation() => Err(MigrateError::LockHeld {
            holder_pid: -1,
            acquired_at: "just now".to_owned(),
        }),
        Err(e) => Err(e.into()),
    }
}

pub async fn release_lock(conn: &dyn Queryable, lock_name: &str) -> Result<()> {
    let delete = match conn.sql_family() {
        SqlFamily::Postgres => format!("DELETE FROM {LOCKS_TABLE} WHERE lock_name = $1"),
        _ => format!("DELETE FROM {LOCKS_TABLE} WHERE lock_name = ?"),
    };

    conn.execute_raw(&delete, &[Value::text(lock_name)]).await?;
    Ok(())
}
