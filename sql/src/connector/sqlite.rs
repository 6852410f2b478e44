//! The native SQLite connector.

mod conversion;

use super::{ExecuteResult, Queryable, ResultSet, SqliteParams, TransactionCapable};
use crate::connector::SqlFamily;
use crate::{Result, Value};
use async_trait::async_trait;
use rusqlite::functions::FunctionFlags;
use tokio::sync::Mutex;

/// A single SQLite connection. Operations serialize on an async mutex, which
/// is also what pins a transaction to its task for the duration of a borrow.
pub struct Sqlite {
    client: Mutex<rusqlite::Connection>,
}

impl Sqlite {
    pub fn new(params: &SqliteParams) -> Result<Self> {
        let conn = if params.in_memory {
            rusqlite::Connection::open_in_memory()?
        } else {
            rusqlite::Connection::open(&params.file_path)?
        };

        Self::configure(&conn)?;

        Ok(Self {
            client: Mutex::new(conn),
        })
    }

    pub fn new_in_memory() -> Result<Self> {
        Self::new(&SqliteParams {
            file_path: ":memory:".to_owned(),
            in_memory: true,
        })
    }

    fn configure(conn: &rusqlite::Connection) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        // `X REGEXP Y` desugars to regexp(Y, X).
        conn.create_scalar_function(
            "regexp",
            2,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let pattern: String = ctx.get(0)?;
                let text: Option<String> = ctx.get(1)?;

                let re = regex::Regex::new(&pattern)
                    .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;

                Ok(text.map(|t| re.is_match(&t)).unwrap_or(false))
            },
        )?;

        Ok(())
    }
}

#[async_trait]
impl Queryable for Sqlite {
    async fn query_raw(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        let client = self.client.lock().await;
        let mut stmt = client.prepare_cached(sql)?;

        let columns: Vec<String> = stmt.column_names().into_iter().map(ToOwned::to_owned).collect();
        let decltypes: Vec<Option<String>> = stmt
            .columns()
            .iter()
            .map(|c| c.decl_type().map(ToOwned::to_owned))
            .collect();

        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(conversion::value_to_sqlite),
        ))?;

        let mut converted: Vec<Vec<Value>> = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for (i, decltype) in decltypes.iter().enumerate() {
                values.push(conversion::sqlite_to_value(
                    row,
                    i,
                    &columns[i],
                    decltype.as_deref(),
                )?);
            }
            converted.push(values);
        }

        Ok(ResultSet::new(columns, converted))
    }

    async fn execute_raw(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        let client = self.client.lock().await;
        let mut stmt = client.prepare_cached(sql)?;

        let rows_affected = stmt.execute(rusqlite::params_from_iter(
            params.iter().map(conversion::value_to_sqlite),
        ))? as u64;

        Ok(ExecuteResult {
            rows_affected,
            last_insert_id: Some(client.last_insert_rowid()),
        })
    }

    async fn raw_cmd(&self, cmd: &str) -> Result<()> {
        let client = self.client.lock().await;
        client.execute_batch(cmd)?;
        Ok(())
    }

    fn sql_family(&self) -> SqlFamily {
        SqlFamily::Sqlite
    }

    async fn version(&self) -> Result<Option<String>> {
        let rows = self.query_raw("SELECT sqlite_version()", &[]).await?;
        Ok(rows
            .first()
            .and_then(|row| row.at(0))
            .and_then(|v| v.as_str().map(ToOwned::to_owned)))
    }
}

impl TransactionCapable for Sqlite {
    fn as_queryable(&self) -> &dyn Queryable {
        self
    }
}

impl std::fmt::Debug for Sqlite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sqlite").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn round_trips_basic_types() {
        let conn = Sqlite::new_in_memory().unwrap();
        conn.raw_cmd(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL, active BOOLEAN, at DATETIME)",
        )
        .await
        .unwrap();

        let insert: Insert = Insert::single_into("t")
            .value("name", "alice")
            .value("score", 9.5)
            .value("active", Value::boolean(true))
            .into();

        let result = conn.execute(insert.into()).await.unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.last_insert_id, Some(1));

        let rows = conn.query(Select::from_table("t").into()).await.unwrap();
        let row = rows.first().unwrap();
        assert_eq!(row["name"], Value::text("alice"));
        assert_eq!(row["score"], Value::float(9.5));
        assert_eq!(row["active"], Value::boolean(true));
    }

    #[tokio::test]
    async fn regexp_operator_works() {
        let conn = Sqlite::new_in_memory().unwrap();
        conn.raw_cmd("CREATE TABLE t (name TEXT)").await.unwrap();
        conn.execute_raw("INSERT INTO t (name) VALUES (?), (?)", &[
            Value::text("alpha"),
            Value::text("beta"),
        ])
        .await
        .unwrap();

        let select = Select::from_table("t").so_that("name".matches_regex("^a"));
        let rows = conn.query(select.into()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.first().unwrap()["name"], Value::text("alpha"));
    }

    #[tokio::test]
    async fn unique_violation_reports_column() {
        let conn = Sqlite::new_in_memory().unwrap();
        conn.raw_cmd("CREATE TABLE t (email TEXT UNIQUE)").await.unwrap();
        conn.execute_raw("INSERT INTO t (email) VALUES (?)", &[Value::text("a@x")])
            .await
            .unwrap();

        let err = conn
            .execute_raw("INSERT INTO t (email) VALUES (?)", &[Value::text("a@x")])
            .await
            .unwrap_err();

        assert!(err.is_constraint_violation(), "got: {err}");
    }

    #[tokio::test]
    async fn transaction_poisoning_and_savepoints() {
        let conn = Sqlite::new_in_memory().unwrap();
        conn.raw_cmd("CREATE TABLE t (id INTEGER PRIMARY KEY)").await.unwrap();

        let tx = conn.start_transaction(None).await.unwrap();
        tx.execute_raw("INSERT INTO t (id) VALUES (?)", &[Value::int64(1i64)])
            .await
            .unwrap();
        tx.savepoint("step_1").await.unwrap();

        // A failing statement poisons the transaction.
        assert!(tx.execute_raw("INSERT INTO nope (id) VALUES (1)", &[]).await.is_err());
        assert!(tx.is_poisoned());

        let err = tx.query_raw("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::TransactionPoisoned));

        // Rolling back to the savepoint clears it.
        tx.rollback_to("step_1").await.unwrap();
        assert!(!tx.is_poisoned());
        tx.commit().await.unwrap();

        let rows = conn.query_raw("SELECT * FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
