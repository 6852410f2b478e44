//! The native PostgreSQL connector over tokio-postgres.

mod conversion;

use super::{ExecuteResult, PostgresUrl, Queryable, ResultSet, TransactionCapable};
use crate::connector::SqlFamily;
use crate::{Error, ErrorKind, Result, Value};
use async_trait::async_trait;

pub struct PostgreSql {
    client: tokio_postgres::Client,
}

impl PostgreSql {
    pub async fn new(url: &PostgresUrl) -> Result<Self> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(url.host())
            .port(url.port())
            .user(&url.username())
            .dbname(&url.dbname());

        if let Some(password) = url.password() {
            config.password(&password);
        }

        let (client, connection) = config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::new(ErrorKind::ConnectionError(e.to_string())))?;

        // The connection object drives the socket; it lives on the runtime
        // that opened the pool and dies with it.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(target: "dataflow::sql", error = %e, "postgres connection task exited");
            }
        });

        Ok(Self { client })
    }
}

#[async_trait]
impl Queryable for PostgreSql {
    async fn query_raw(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        let statement = self.client.prepare(sql).await?;

        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_owned())
            .collect();

        let wrapped = conversion::params(params);
        let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
            wrapped.iter().map(|p| p as &(dyn tokio_postgres::types::ToSql + Sync)).collect();

        let rows = self.client.query(&statement, &refs).await?;

        let mut converted = Vec::with_capacity(rows.len());
        for row in rows {
            converted.push(conversion::row_to_values(&row)?);
        }

        Ok(ResultSet::new(columns, converted))
    }

    async fn execute_raw(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        let statement = self.client.prepare(sql).await?;

        let wrapped = conversion::params(params);
        let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
            wrapped.iter().map(|p| p as &(dyn tokio_postgres::types::ToSql + Sync)).collect();

        let rows_affected = self.client.execute(&statement, &refs).await?;

        Ok(ExecuteResult {
            rows_affected,
            // PostgreSQL has no session-level insert id; callers use RETURNING.
            last_insert_id: None,
        })
    }

    async fn raw_cmd(&self, cmd: &str) -> Result<()> {
        self.client.batch_execute(cmd).await?;
        Ok(())
    }

    fn sql_family(&self) -> SqlFamily {
        SqlFamily::Postgres
    }

    async fn version(&self) -> Result<Option<String>> {
        let rows = self.query_raw("SHOW server_version", &[]).await?;
        Ok(rows
            .first()
            .and_then(|row| row.at(0))
            .and_then(|v| v.as_str().map(ToOwned::to_owned)))
    }
}

impl TransactionCapable for PostgreSql {
    fn as_queryable(&self) -> &dyn Queryable {
        self
    }
}

impl std::fmt::Debug for PostgreSql {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgreSql").finish_non_exhaustive()
    }
}
