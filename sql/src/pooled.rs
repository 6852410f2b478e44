//! Connection pooling.
//!
//! Pools are owned by the engine instance, never process-global. Each pool
//! remembers the scheduler context it was created on through a sentinel
//! task; a pool whose context has shut down is stale and gets purged rather
//! than reused.

use crate::connector::{
    ConnectionInfo, ExecuteResult, ExternalConnectorFactory, PostgreSql, Queryable, ResultSet,
    SqlConnection, SqlFamily, Sqlite, TransactionCapable,
};
use crate::{Error, ErrorKind, Result, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Pool sizing and acquisition limits.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_connections: u64,
    pub max_connections: u64,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ConnectionManager {
    info: ConnectionInfo,
    external: Option<Arc<dyn ExternalConnectorFactory>>,
}

#[mobc::async_trait]
impl mobc::Manager for ConnectionManager {
    type Connection = Box<dyn SqlConnection + Send + Sync>;
    type Error = Error;

    async fn connect(&self) -> Result<Self::Connection> {
        match &self.info {
            ConnectionInfo::Sqlite(params) => Ok(Box::new(Sqlite::new(params)?)),
            ConnectionInfo::Postgres(url) => Ok(Box::new(PostgreSql::new(url).await?)),
            other => match &self.external {
                Some(factory) => factory.connect(other).await,
                None => Err(Error::new(ErrorKind::UnsupportedConnector(
                    other.description(),
                ))),
            },
        }
    }

    async fn check(&self, conn: Self::Connection) -> Result<Self::Connection> {
        conn.health().await?;
        Ok(conn)
    }
}

/// A pooled database handle bound to one scheduler context.
pub struct Pool {
    inner: mobc::Pool<ConnectionManager>,
    family: SqlFamily,
    sentinel: ContextSentinel,
}

impl Pool {
    pub fn new(
        info: ConnectionInfo,
        config: PoolConfig,
        external: Option<Arc<dyn ExternalConnectorFactory>>,
    ) -> Result<Self> {
        let family = match (&info, &external) {
            (ConnectionInfo::Document { .. }, _) => {
                return Err(Error::new(ErrorKind::UnsupportedConnector(
                    "document stores connect through a DocumentAdapter, not the SQL pool".to_owned(),
                )))
            }
            (info, _) => info.sql_family().or_else(|| external.as_ref().map(|f| f.sql_family())),
        }
        .expect("non-document connection info always has a SQL family");

        // Every pooled connection to an in-memory SQLite database would be
        // its own private database; cap the pool at one.
        let max_open = match &info {
            ConnectionInfo::Sqlite(params) if params.in_memory => 1,
            _ => config.max_connections,
        };

        let manager = ConnectionManager { info, external };
        let inner = mobc::Pool::builder()
            .max_open(max_open)
            .max_idle(config.min_connections.max(1).min(max_open))
            .get_timeout(Some(config.acquire_timeout))
            .build(manager);

        Ok(Self {
            inner,
            family,
            sentinel: ContextSentinel::install(),
        })
    }

    pub fn sql_family(&self) -> SqlFamily {
        self.family
    }

    /// Borrows a connection. The checkout is pinned to the calling task for
    /// its lifetime; it goes back to the pool on drop.
    pub async fn check_out(&self) -> Result<PooledConnection> {
        if self.is_context_closed() {
            return Err(Error::new(ErrorKind::ContextClosed));
        }

        let inner = self.inner.get().await.map_err(|e| match e {
            mobc::Error::Timeout => Error::new(ErrorKind::PoolTimeout),
            mobc::Error::Inner(e) => e,
            mobc::Error::BadConn => {
                Error::new(ErrorKind::ConnectionError("bad connection in pool".to_owned()))
            }
            mobc::Error::PoolClosed => {
                Error::new(ErrorKind::ConnectionError("pool closed".to_owned()))
            }
        })?;

        Ok(PooledConnection {
            inner,
            family: self.family,
        })
    }

    /// Whether the scheduler context this pool was created on has shut down.
    pub fn is_context_closed(&self) -> bool {
        self.sentinel.is_closed()
    }

    pub async fn health(&self) -> Result<()> {
        self.check_out().await?.health().await
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("family", &self.family).finish_non_exhaustive()
    }
}

/// A checked-out connection. Dereferences to the full SQL surface.
pub struct PooledConnection {
    inner: mobc::Connection<ConnectionManager>,
    family: SqlFamily,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Queryable for PooledConnection {
    async fn query_raw(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        (**self.inner).query_raw(sql, params).await
    }

    async fn execute_raw(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        (**self.inner).execute_raw(sql, params).await
    }

    async fn raw_cmd(&self, cmd: &str) -> Result<()> {
        (**self.inner).raw_cmd(cmd).await
    }

    fn sql_family(&self) -> SqlFamily {
        self.family
    }

    async fn version(&self) -> Result<Option<String>> {
        (**self.inner).version().await
    }
}

impl TransactionCapable for PooledConnection {
    fn as_queryable(&self) -> &dyn Queryable {
        self
    }
}

/// Watches the tokio runtime a pool was created on. The held task drops its
/// sender when the runtime shuts down, flipping the marker.
struct ContextSentinel {
    rx: Option<parking_lot::Mutex<oneshot::Receiver<()>>>,
}

impl ContextSentinel {
    fn install() -> Self {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (tx, rx) = oneshot::channel::<()>();
                handle.spawn(async move {
                    let _tx = tx;
                    std::future::pending::<()>().await;
                });

                Self {
                    rx: Some(parking_lot::Mutex::new(rx)),
                }
            }
            // Created outside a runtime; there is no context to go stale.
            Err(_) => Self { rx: None },
        }
    }

    fn is_closed(&self) -> bool {
        match &self.rx {
            None => false,
            Some(rx) => matches!(
                rx.lock().try_recv(),
                Err(oneshot::error::TryRecvError::Closed)
            ),
        }
    }
}

/// The report handed back by a pool purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Pools created over the registry's lifetime.
    pub created: usize,
    /// Pools dropped by this purge.
    pub purged: usize,
    pub errors: Vec<String>,
}

/// All pools owned by one engine instance, keyed by a caller-chosen name.
pub struct PoolRegistry {
    pools: parking_lot::Mutex<HashMap<String, Arc<Pool>>>,
    created: AtomicUsize,
    aggressive: AtomicBool,
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            pools: parking_lot::Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            aggressive: AtomicBool::new(false),
        }
    }

    pub fn get_or_create(
        &self,
        key: &str,
        make: impl FnOnce() -> Result<Pool>,
    ) -> Result<Arc<Pool>> {
        let mut pools = self.pools.lock();

        if let Some(pool) = pools.get(key) {
            if !pool.is_context_closed() {
                return Ok(Arc::clone(pool));
            }
            // Stale pools are replaced, never reused.
            pools.remove(key);
        }

        let pool = Arc::new(make()?);
        self.created.fetch_add(1, Ordering::SeqCst);
        pools.insert(key.to_owned(), Arc::clone(&pool));
        Ok(pool)
    }

    pub fn get(&self, key: &str) -> Option<Arc<Pool>> {
        self.pools.lock().get(key).cloned()
    }

    /// In test mode, cleanup runs aggressively after each engine operation.
    pub fn set_aggressive_cleanup(&self, enabled: bool) {
        self.aggressive.store(enabled, Ordering::SeqCst);
    }

    pub fn aggressive_cleanup(&self) -> bool {
        self.aggressive.load(Ordering::SeqCst)
    }

    /// Drops stale pools; with `all`, drops everything.
    pub fn purge(&self, all: bool) -> PurgeReport {
        let mut pools = self.pools.lock();
        let before = pools.len();

        if all {
            pools.clear();
        } else {
            pools.retain(|_, pool| !pool.is_context_closed());
        }

        PurgeReport {
            created: self.created.load(Ordering::SeqCst),
            purged: before - pools.len(),
            errors: Vec::new(),
        }
    }

    /// Spawns the background task that sweeps stale pools.
    pub fn spawn_cleanup_task(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let report = registry.purge(false);
                if report.purged > 0 {
                    tracing::debug!(
                        target: "dataflow::sql",
                        purged = report.purged,
                        "dropped pools bound to closed scheduler contexts"
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_pool() -> Pool {
        let info = ConnectionInfo::from_url("sqlite:///:memory:").unwrap();
        Pool::new(info, PoolConfig::default(), None).unwrap()
    }

    #[tokio::test]
    async fn checkout_and_query() {
        let pool = memory_pool();
        let conn = pool.check_out().await.unwrap();

        conn.raw_cmd("CREATE TABLE t (id INTEGER)").await.unwrap();
        conn.execute_raw("INSERT INTO t (id) VALUES (?)", &[Value::int64(7i64)])
            .await
            .unwrap();

        let rows = conn.query_raw("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn in_memory_sqlite_pool_shares_one_connection() {
        let pool = memory_pool();

        {
            let conn = pool.check_out().await.unwrap();
            conn.raw_cmd("CREATE TABLE t (id INTEGER)").await.unwrap();
        }

        // A second checkout must see the same database.
        let conn = pool.check_out().await.unwrap();
        conn.query_raw("SELECT * FROM t", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn mysql_without_external_factory_is_refused() {
        let info = ConnectionInfo::from_url("mysql://root@localhost/db").unwrap();
        let pool = Pool::new(info, PoolConfig::default(), None).unwrap();
        let err = pool.check_out().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnsupportedConnector(_)));
    }

    #[test]
    fn sentinel_detects_closed_context() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pool = rt.block_on(async { memory_pool() });

        assert!(!pool.is_context_closed());
        drop(rt);
        assert!(pool.is_context_closed());
    }

    #[tokio::test]
    async fn registry_purges_and_reports() {
        let registry = Arc::new(PoolRegistry::new());
        registry
            .get_or_create("default", || {
                let info = ConnectionInfo::from_url("sqlite:///:memory:")?;
                Pool::new(info, PoolConfig::default(), None)
            })
            .unwrap();

        let report = registry.purge(true);
        assert_eq!(report.created, 1);
        assert_eq!(report.purged, 1);
        assert!(report.errors.is_empty());
        assert!(registry.get("default").is_none());
    }
}
