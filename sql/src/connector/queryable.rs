use super::{ResultSet, SqlFamily, Transaction};
use crate::ast::Query;
use crate::{Result, Value};
use async_trait::async_trait;
use std::fmt;

/// The outcome of a DML statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecuteResult {
    pub rows_affected: u64,
    /// The driver-reported id of the last inserted row, when the driver has
    /// one (SQLite rowid, MySQL auto-increment). PostgreSQL callers use
    /// `RETURNING` instead.
    pub last_insert_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadUncommitted => f.write_str("READ UNCOMMITTED"),
            Self::ReadCommitted => f.write_str("READ COMMITTED"),
            Self::RepeatableRead => f.write_str("REPEATABLE READ"),
            Self::Serializable => f.write_str("SERIALIZABLE"),
        }
    }
}

/// Anything that can execute SQL. Implemented by the native connectors,
/// transactions and pooled checkouts.
///
/// Every method may suspend. One connection serializes its own operations;
/// concurrency comes from the pool handing each task its own connection.
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Executes a read returning rows.
    async fn query_raw(&self, sql: &str, params: &[Value]) -> Result<ResultSet>;

    /// Executes a write returning the affected-row count.
    async fn execute_raw(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult>;

    /// Runs a statement with no parameters and no interesting result.
    async fn raw_cmd(&self, cmd: &str) -> Result<()>;

    fn sql_family(&self) -> SqlFamily;

    /// Renders and executes an AST read.
    async fn query(&self, q: Query) -> Result<ResultSet> {
        let (sql, params) = self.sql_family().render(q)?;
        self.query_raw(&sql, &params).await
    }

    /// Renders and executes an AST write.
    async fn execute(&self, q: Query) -> Result<ExecuteResult> {
        let (sql, params) = self.sql_family().render(q)?;
        self.execute_raw(&sql, &params).await
    }

    async fn version(&self) -> Result<Option<String>> {
        Ok(None)
    }

    /// A cheap liveness probe.
    async fn health(&self) -> Result<()> {
        self.query_raw("SELECT 1", &[]).await.map(|_| ())
    }
}

/// Connections that can open transactions.
#[async_trait]
pub trait TransactionCapable: Queryable {
    async fn start_transaction(&self, isolation: Option<IsolationLevel>) -> Result<Transaction<'_>> {
        Transaction::begin(self.as_queryable(), self.sql_family(), isolation).await
    }

    fn as_queryable(&self) -> &dyn Queryable;
}

/// A full SQL connection: queryable and transaction-capable. This is the
/// object the pool stores.
pub trait SqlConnection: TransactionCapable {}

impl<T: TransactionCapable + ?Sized> SqlConnection for T {}
