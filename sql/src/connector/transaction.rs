use super::{ExecuteResult, IsolationLevel, Queryable, ResultSet, SqlFamily};
use crate::validate::check_savepoint_name;
use crate::{Error, ErrorKind, Result, Value};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// An open transaction on a borrowed connection.
///
/// Any failed statement poisons the transaction: further statements fail
/// fast until a rollback (full or to a savepoint) clears the flag.
/// `commit` and `rollback` consume the transaction.
pub struct Transaction<'a> {
    inner: &'a dyn Queryable,
    family: SqlFamily,
    poisoned: AtomicBool,
    done: AtomicBool,
}

impl<'a> Transaction<'a> {
    pub(crate) async fn begin(
        inner: &'a dyn Queryable,
        family: SqlFamily,
        isolation: Option<IsolationLevel>,
    ) -> Result<Self> {
        match (family, isolation) {
            (SqlFamily::Sqlite, Some(level)) if level != IsolationLevel::Serializable => {
                return Err(Error::new(ErrorKind::UnsupportedByDialect(
                    "sqlite",
                    format!("isolation level {level} (SQLite is always SERIALIZABLE)"),
                )));
            }
            (SqlFamily::Sqlite, _) => {
                inner.raw_cmd("BEGIN").await?;
            }
            (SqlFamily::Mysql, isolation) => {
                // MySQL applies SET TRANSACTION to the *next* transaction.
                if let Some(level) = isolation {
                    inner
                        .raw_cmd(&format!("SET TRANSACTION ISOLATION LEVEL {level}"))
                        .await?;
                }
                inner.raw_cmd("BEGIN").await?;
            }
            (SqlFamily::Postgres, isolation) => {
                inner.raw_cmd("BEGIN").await?;
                if let Some(level) = isolation {
                    inner
                        .raw_cmd(&format!("SET TRANSACTION ISOLATION LEVEL {level}"))
                        .await?;
                }
            }
        }

        Ok(Self {
            inner,
            family,
            poisoned: AtomicBool::new(false),
            done: AtomicBool::new(false),
        })
    }

    fn guard(&self) -> Result<()> {
        if self.done.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::TransactionClosed));
        }
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::TransactionPoisoned));
        }
        Ok(())
    }

    fn note_result<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.poisoned.store(true, Ordering::SeqCst);
        }
        result
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub async fn savepoint(&self, name: &str) -> Result<()> {
        self.guard()?;
        check_savepoint_name(name)?;
        let result = self.inner.raw_cmd(&format!("SAVEPOINT {name}")).await;
        self.note_result(result)
    }

    /// Rolls back to a savepoint. This also clears the poisoned flag, the
    /// failed work is undone.
    pub async fn rollback_to(&self, name: &str) -> Result<()> {
        if self.done.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::TransactionClosed));
        }
        check_savepoint_name(name)?;
        self.inner
            .raw_cmd(&format!("ROLLBACK TO SAVEPOINT {name}"))
            .await?;
        self.poisoned.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        self.guard()?;
        self.done.store(true, Ordering::SeqCst);
        self.inner.raw_cmd("COMMIT").await
    }

    pub async fn rollback(self) -> Result<()> {
        if self.done.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::TransactionClosed));
        }
        self.done.store(true, Ordering::SeqCst);
        self.inner.raw_cmd("ROLLBACK").await
    }
}

#[async_trait]
impl Queryable for Transaction<'_> {
    async fn query_raw(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        self.guard()?;
        let result = self.inner.query_raw(sql, params).await;
        self.note_result(result)
    }

    async fn execute_raw(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        self.guard()?;
        let result = self.inner.execute_raw(sql, params).await;
        self.note_result(result)
    }

    async fn raw_cmd(&self, cmd: &str) -> Result<()> {
        self.guard()?;
        let result = self.inner.raw_cmd(cmd).await;
        self.note_result(result)
    }

    fn sql_family(&self) -> SqlFamily {
        self.family
    }
}
