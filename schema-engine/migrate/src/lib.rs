//! The schema migration engine.
//!
//! Declared models are lowered to an expected [`SqlSchema`]
//! ([`calculator`]), diffed against the introspected live schema
//! ([`differ`]), turned into a risk-assessed, dependency-ordered plan
//! ([`planner`]) and executed atomically under an advisory lock
//! ([`executor`]). Applied migrations are recorded in the
//! `dataflow_migrations` history table ([`history`]).

pub mod baseline;
pub mod calculator;
pub mod ddl;
pub mod differ;
pub mod executor;
pub mod history;
pub mod planner;

pub use differ::SchemaDiff;
pub use executor::MigrationReport;
pub use planner::{
    ImpactReport, MigrationPlan, MigrationStep, ReverseSql, RiskAssessment, RiskBand, RiskFactor,
    StepKind,
};

use dataflow_describer::SqlSchema;
use dataflow_model::ModelDescriptor;
use dataflow_sql::connector::{Queryable, SqlConnection};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, MigrateError>;

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("another migration holds the lock (process {holder_pid}, acquired {acquired_at})")]
    LockHeld { holder_pid: i64, acquired_at: String },

    #[error("migration aborted at step {step_index} ({step}): {reason}")]
    Aborted {
        step_index: usize,
        step: String,
        reason: String,
    },

    #[error(
        "manual recovery required: rollback stopped at an irreversible step; affected tables: {}",
        affected_tables.join(", ")
    )]
    ManualRecoveryRequired {
        affected_tables: Vec<String>,
        /// The reverse statements that were *not* applied, in the order they
        /// would have run.
        remaining_reverse: Vec<String>,
    },

    #[error("plan risk is {score} ({band:?}); pass confirm_critical to run it")]
    CriticalRiskUnconfirmed { score: u8, band: RiskBand },

    #[error("adding NOT NULL column `{table}.{column}` needs a default strategy: {reason}")]
    MissingNotNullDefault {
        table: String,
        column: String,
        reason: String,
    },

    #[error("cyclic foreign-key dependency involving: {}", tables.join(", "))]
    CyclicDependency { tables: Vec<String> },

    #[error("performance baseline degraded beyond {threshold}x: {details}")]
    PerformanceDegradation { threshold: f64, details: String },

    #[error(transparent)]
    Sql(#[from] dataflow_sql::Error),
}

/// Everything the planner and executor need to know beyond the schemas.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Identifies the application writing history rows.
    pub application_id: String,
    pub production: bool,
    pub verified_backup: bool,
    /// Rename detection is opt-in; off means drop-and-add.
    pub rename_detection: bool,
    /// Normalized name similarity a rename candidate must reach.
    pub rename_similarity_threshold: f64,
    pub lock_timeout: Duration,
    /// Force-release a lock whose timeout has passed.
    pub force_release_stale_lock: bool,
    /// Required when the plan's risk band is critical.
    pub confirm_critical: bool,
    pub performance_baseline: Option<baseline::BaselineConfig>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            application_id: "dataflow".to_owned(),
            production: false,
            verified_backup: false,
            rename_detection: false,
            rename_similarity_threshold: 0.6,
            lock_timeout: Duration::from_secs(3600),
            force_release_stale_lock: false,
            confirm_critical: false,
            performance_baseline: None,
        }
    }
}

/// Computes the migration plan for a set of declared models against the
/// connected database. Read-only; nothing is executed.
pub async fn plan(
    conn: &dyn Queryable,
    models: &[ModelDescriptor],
    options: &MigrationOptions,
) -> Result<MigrationPlan> {
    let live = dataflow_describer::describe(conn).await?;
    let declared = calculator::calculate(models, conn.sql_family())?;
    plan_from_schemas(conn, &declared, &live, options).await
}

/// Like [`plan`], but with both schemas already in hand.
pub async fn plan_from_schemas(
    conn: &dyn Queryable,
    declared: &SqlSchema,
    live: &SqlSchema,
    options: &MigrationOptions,
) -> Result<MigrationPlan> {
    // Engine-managed state is never part of the model diff.
    let mut live = live.clone();
    live.tables.retain(|t| !history::is_engine_table(&t.name));
    live.views.retain(|v| v.name != history::MODEL_REGISTRY_VIEW);

    let live = &live;
    let diffs = differ::diff(
        live,
        declared,
        &differ::DiffOptions {
            rename_detection: options.rename_detection,
            rename_similarity_threshold: options.rename_similarity_threshold,
        },
    );

    let row_counts = planner::fetch_row_counts(conn, live).await?;
    planner::build_plan(conn.sql_family(), declared, live, diffs, &row_counts, options)
}

/// Plans and applies in one call. This is what `auto_migrate` uses.
pub async fn migrate(
    conn: &(dyn SqlConnection + Send + Sync),
    models: &[ModelDescriptor],
    options: &MigrationOptions,
) -> Result<MigrationReport> {
    let built = plan(conn.as_queryable(), models, options).await?;
    executor::apply(conn, &built, models, options).await
}
