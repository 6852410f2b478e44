//! The engine facade.
//!
//! A [`DataFlow`] instance owns the model registry, the connection pools,
//! the query cache, the tenant registry and the migration surface. Nothing
//! here is process-global: two engines in one process are fully isolated.

use crate::cache::{DisabledCache, InMemoryCache, QueryCache};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::filter::Filter;
use crate::nodes::{self, Operation};
use crate::registry::ModelRegistry;
use crate::tenant::TenantContext;
use crate::workflow::{
    self, Connection, RuntimeInputs, Workflow, WorkflowBuilder, WorkflowCancellation,
};
use crate::{Error, ErrorKind, Result};
use dataflow_migrate::{MigrationOptions, MigrationPlan, MigrationReport};
use dataflow_model::ModelDescriptor;
use dataflow_sql::connector::{ConnectionInfo, TransactionCapable};
use dataflow_sql::pooled::{Pool, PoolRegistry, PurgeReport};
use indexmap::IndexMap;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEFAULT_POOL: &str = "default";

struct EngineInner {
    config: EngineConfig,
    connection_info: ConnectionInfo,
    models: ModelRegistry,
    pools: Arc<PoolRegistry>,
    cache: Arc<dyn QueryCache>,
    tenants: TenantContext,
    initialized: AtomicBool,
    cleanup_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// The engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DataFlow {
    inner: Arc<EngineInner>,
}

impl DataFlow {
    /// Binds the adapter and loads the logging configuration. Connections
    /// come online in [`Self::initialize`].
    pub fn new(database_url: &str, config: EngineConfig) -> Result<Self> {
        config.log_config.init();

        let connection_info = ConnectionInfo::from_url(database_url)?;

        let cache: Arc<dyn QueryCache> = if config.cache.enabled {
            Arc::new(InMemoryCache::new(config.cache.max_size, config.cache.ttl))
        } else {
            Arc::new(DisabledCache)
        };

        let engine = Self {
            inner: Arc::new(EngineInner {
                config,
                connection_info,
                models: ModelRegistry::new(),
                pools: Arc::new(PoolRegistry::new()),
                cache,
                tenants: TenantContext::new(),
                initialized: AtomicBool::new(false),
                cleanup_task: parking_lot::Mutex::new(None),
            }),
        };

        if engine.inner.config.test_mode {
            engine.inner.pools.set_aggressive_cleanup(true);
        }

        Ok(engine)
    }

    /// Like [`Self::new`], falling back to `DATAFLOW_DATABASE_URL` when no
    /// URL is given.
    pub fn from_env(config: EngineConfig) -> Result<Self> {
        let url = std::env::var("DATAFLOW_DATABASE_URL").map_err(|_| {
            Error::validation("no database URL given and DATAFLOW_DATABASE_URL is not set")
        })?;
        Self::new(&url, config)
    }

    /// Brings connections online, verifies cross-model references, and runs
    /// `auto_migrate` when configured. Safe to call from inside or outside
    /// an async context that is already running — it is itself async.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.initialize_inner().await;
        if result.is_err() {
            // A failed initialization may be retried.
            self.inner.initialized.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn initialize_inner(&self) -> Result<()> {
        self.inner.models.check_references()?;

        let pool = self.pool()?;
        pool.health().await?;

        // Stale-context sweeping runs in the background for the life of the
        // engine.
        let handle = self
            .inner
            .pools
            .spawn_cleanup_task(std::time::Duration::from_secs(60));
        *self.inner.cleanup_task.lock() = Some(handle);

        if self.inner.config.auto_migrate && !self.inner.config.existing_schema_mode {
            self.migrate().await?;
        }

        tracing::info!(
            target: "dataflow::core",
            database = %self.inner.connection_info.description(),
            models = self.inner.models.len(),
            "engine initialized"
        );

        Ok(())
    }

    /// Tears down pools, stops background tasks and flushes the cache.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.cleanup_task.lock().take() {
            handle.abort();
        }

        let report = self.inner.pools.purge(true);
        if let Err(e) = self.inner.cache.clear().await {
            tracing::warn!(target: "dataflow::core", error = %e, "cache flush failed during shutdown");
        }

        self.inner.initialized.store(false, Ordering::SeqCst);
        tracing::info!(
            target: "dataflow::core",
            purged = report.purged,
            "engine shut down"
        );
    }

    // --- models ------------------------------------------------------------

    pub fn register_model(&self, model: ModelDescriptor) -> Result<()> {
        self.inner.models.register(model)
    }

    pub fn model(&self, name: &str) -> Result<ModelDescriptor> {
        self.inner.models.get(name)
    }

    pub fn model_names(&self) -> Vec<String> {
        self.inner.models.names()
    }

    /// The full catalog: every registered model with its eleven operations
    /// and their parameter schemas.
    pub fn get_available_nodes(
        &self,
        model: Option<&str>,
    ) -> Result<BTreeMap<String, Vec<nodes::NodeDescriptor>>> {
        let models = match model {
            Some(name) => vec![self.inner.models.get(name)?],
            None => self.inner.models.all(),
        };

        Ok(models
            .into_iter()
            .map(|m| {
                let descriptors = Operation::ALL
                    .into_iter()
                    .map(|op| nodes::describe(&m, op))
                    .collect();
                (m.name, descriptors)
            })
            .collect())
    }

    // --- tenants & cache ---------------------------------------------------

    pub fn tenants(&self) -> &TenantContext {
        &self.inner.tenants
    }

    pub async fn invalidate_cache(&self, model: &str) -> Result<()> {
        self.inner
            .cache
            .invalidate_model(model)
            .await
            .map_err(|e| Error::new(ErrorKind::CacheBackendFault(e.to_string())))
    }

    // --- workflows ---------------------------------------------------------

    pub fn create_workflow(&self, label: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(label)
    }

    /// Adds an operation node. The filter parameter, when present, is parsed
    /// here — malformed filters never reach execution.
    pub fn add_node(
        &self,
        builder: &mut WorkflowBuilder,
        model_name: &str,
        operation_name: &str,
        node_id: &str,
        params: Json,
        connections: Option<Vec<Connection>>,
    ) -> Result<()> {
        let model = self.inner.models.get(model_name)?;
        let operation = Operation::parse(model_name, operation_name)?;

        let static_params = match params {
            Json::Object(map) => map,
            Json::Null => serde_json::Map::new(),
            _ => return Err(Error::validation("node parameters must be a JSON object")),
        };

        let filter = match static_params.get("filter") {
            Some(document) => Some(Filter::parse(document)?),
            None => None,
        };

        // Static parameters are checked against the schema now; runtime and
        // edge-bound parameters are checked again at execution.
        let descriptor = nodes::describe(&model, operation);
        nodes::validate_params(&descriptor, &static_params)?;

        builder.insert_node(
            node_id,
            workflow::NodeSpec {
                model: model.name,
                operation,
                static_params,
                filter,
                connections: connections.unwrap_or_default(),
            },
        )
    }

    /// Executes a workflow, returning per-node results and the run id.
    pub async fn execute_workflow(
        &self,
        builder: WorkflowBuilder,
        runtime_inputs: Option<RuntimeInputs>,
    ) -> Result<(IndexMap<String, Json>, String)> {
        self.execute_workflow_with(builder, runtime_inputs, None, false).await
    }

    /// Executes a workflow inside one transaction; any failure (including
    /// cancellation) rolls the whole run back.
    pub async fn execute_workflow_transactional(
        &self,
        builder: WorkflowBuilder,
        runtime_inputs: Option<RuntimeInputs>,
        cancellation: Option<WorkflowCancellation>,
    ) -> Result<(IndexMap<String, Json>, String)> {
        self.execute_workflow_with(builder, runtime_inputs, cancellation, true).await
    }

    /// Executes a workflow with an optional cancellation signal.
    pub async fn execute_workflow_cancellable(
        &self,
        builder: WorkflowBuilder,
        runtime_inputs: Option<RuntimeInputs>,
        cancellation: WorkflowCancellation,
    ) -> Result<(IndexMap<String, Json>, String)> {
        self.execute_workflow_with(builder, runtime_inputs, Some(cancellation), false)
            .await
    }

    async fn execute_workflow_with(
        &self,
        builder: WorkflowBuilder,
        runtime_inputs: Option<RuntimeInputs>,
        cancellation: Option<WorkflowCancellation>,
        transactional: bool,
    ) -> Result<(IndexMap<String, Json>, String)> {
        let frozen = Workflow::freeze(builder, &self.inner.models)?;

        let ctx = ExecutionContext::new(TenantContext::current(), frozen.acting_user.clone());
        let run_id = ctx.run_id.clone();

        tracing::debug!(
            target: "dataflow::core",
            workflow = %frozen.label,
            run_id = %run_id,
            nodes = frozen.order.len(),
            "executing workflow"
        );

        let pool = self.pool()?;
        let conn = pool.check_out().await?;

        let results = if transactional {
            let tx = conn.start_transaction(None).await?;
            let outcome = workflow::run(
                &frozen,
                &self.inner.models,
                &tx,
                self.inner.cache.as_ref(),
                &ctx,
                runtime_inputs.as_ref(),
                cancellation.as_ref(),
                self.inner.config.bulk_batch_size,
            )
            .await;

            match outcome {
                Ok(results) => {
                    tx.commit().await?;
                    results
                }
                Err(e) => {
                    if let Err(rollback_error) = tx.rollback().await {
                        tracing::error!(
                            target: "dataflow::core",
                            error = %rollback_error,
                            "rollback after workflow failure also failed"
                        );
                    }
                    return Err(e);
                }
            }
        } else {
            workflow::run(
                &frozen,
                &self.inner.models,
                &conn,
                self.inner.cache.as_ref(),
                &ctx,
                runtime_inputs.as_ref(),
                cancellation.as_ref(),
                self.inner.config.bulk_batch_size,
            )
            .await?
        };

        self.after_operation();
        Ok((results, run_id))
    }

    /// The synchronous entry point. Refuses to run inside an async context —
    /// blocking there would starve the runtime that the pool lives on.
    pub fn execute_workflow_sync(
        &self,
        builder: WorkflowBuilder,
        runtime_inputs: Option<RuntimeInputs>,
    ) -> Result<(IndexMap<String, Json>, String)> {
        self.block_on("execute_workflow", self.execute_workflow(builder, runtime_inputs))
    }

    // --- schema ------------------------------------------------------------

    /// Introspects the live database schema. Async-safe in any context.
    pub async fn discover_schema_async(&self) -> Result<dataflow_describer::SqlSchema> {
        let pool = self.pool()?;
        let conn = pool.check_out().await?;
        let schema = dataflow_describer::describe(&conn).await?;
        self.after_operation();
        Ok(schema)
    }

    /// The synchronous variant. Calling it from inside a running async
    /// context fails with a wrong-context error pointing at
    /// [`Self::discover_schema_async`].
    pub fn discover_schema(&self) -> Result<dataflow_describer::SqlSchema> {
        self.block_on("discover_schema", self.discover_schema_async())
    }

    // --- migrations --------------------------------------------------------

    fn migration_options(&self) -> MigrationOptions {
        let m = &self.inner.config.migration;
        MigrationOptions {
            application_id: "dataflow".to_owned(),
            production: m.production,
            verified_backup: m.verified_backup,
            rename_detection: m.rename_detection,
            rename_similarity_threshold: m.rename_similarity_threshold,
            lock_timeout: m.lock_timeout,
            force_release_stale_lock: false,
            confirm_critical: m.confirm_critical,
            performance_baseline: None,
        }
    }

    /// Computes the migration plan without executing it.
    pub async fn migration_plan(&self) -> Result<MigrationPlan> {
        self.inner.models.check_references()?;
        let pool = self.pool()?;
        let conn = pool.check_out().await?;
        let models = self.inner.models.all();

        let plan = dataflow_migrate::plan(&conn, &models, &self.migration_options()).await?;
        Ok(plan)
    }

    /// Diffs declared models against the live schema and applies the plan.
    pub async fn migrate(&self) -> Result<MigrationReport> {
        if self.inner.config.existing_schema_mode {
            return Err(Error::validation(
                "existing_schema_mode engines verify schemas, they do not migrate them",
            ));
        }

        self.inner.models.check_references()?;
        let pool = self.pool()?;
        let conn = pool.check_out().await?;
        let models = self.inner.models.all();

        let report =
            dataflow_migrate::migrate(&conn, &models, &self.migration_options()).await?;
        self.after_operation();
        Ok(report)
    }

    /// Applied-migration history from the target database.
    pub async fn migration_status(&self) -> Result<Vec<dataflow_migrate::history::MigrationRecord>> {
        let pool = self.pool()?;
        let conn = pool.check_out().await?;
        let records = dataflow_migrate::history::migration_status(&conn).await?;
        Ok(records)
    }

    // --- lifecycle helpers -------------------------------------------------

    /// Aggressive cleanup after every operation; normally set by detecting a
    /// test configuration, callable explicitly for harnesses.
    pub fn enable_test_mode(&self) {
        self.inner.pools.set_aggressive_cleanup(true);
    }

    pub async fn purge_pools(&self) -> PurgeReport {
        self.inner.pools.purge(true)
    }

    pub async fn health(&self) -> Result<()> {
        let pool = self.pool()?;
        pool.health().await?;
        Ok(())
    }

    fn after_operation(&self) {
        if self.inner.pools.aggressive_cleanup() {
            let report = self.inner.pools.purge(false);
            if report.purged > 0 {
                tracing::debug!(
                    target: "dataflow::core",
                    purged = report.purged,
                    "test-mode pool cleanup"
                );
            }
        }
    }

    fn pool(&self) -> Result<Arc<Pool>> {
        let info = self.inner.connection_info.clone();
        let config = self.inner.config.pool.to_pool_config();

        self.inner
            .pools
            .get_or_create(DEFAULT_POOL, || Pool::new(info, config, None))
            .map_err(Error::from)
    }

    /// Runs a future to completion on a private runtime, rejecting the call
    /// when already inside one.
    fn block_on<T>(
        &self,
        entry_point: &str,
        future: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::new(ErrorKind::WrongContext(format!(
                "`{entry_point}` was called from inside a running async context; \
                 use `{entry_point}_async` (or await the async variant) instead"
            ))));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::internal(format!("could not start a runtime: {e}")))?;

        runtime.block_on(future)
    }
}

impl std::fmt::Debug for DataFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFlow")
            .field("database", &self.inner.connection_info.description())
            .field("models", &self.inner.models.len())
            .finish_non_exhaustive()
    }
}
