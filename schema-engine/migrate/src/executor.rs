//! Atomic plan execution.
//!
//! One advisory lock, one transaction, one savepoint per step (one per
//! *group* for coordinated FK work). A failed step rolls back to its
//! savepoint and then unwinds the completed steps with their pre-computed
//! reverse SQL, newest first. An irreversible reverse stops the unwind and
//! surfaces a manual-recovery fault naming what is left.

use crate::baseline::{self, BaselineComparison};
use crate::history::{self, NewMigration, SCHEMA_LOCK};
use crate::planner::{MigrationPlan, MigrationStep, ReverseSql, RiskAssessment, RiskBand};
use crate::{MigrateError, MigrationOptions, Result};
use dataflow_model::ModelDescriptor;
use dataflow_sql::connector::{Queryable, SqlConnection, Transaction};
use std::collections::BTreeSet;

#[derive(Debug)]
pub struct MigrationReport {
    pub no_changes: bool,
    pub applied_steps: usize,
    pub version: Option<String>,
    pub risk: RiskAssessment,
    pub warnings: Vec<String>,
    pub baseline: Option<BaselineComparison>,
}

pub async fn apply(
    conn: &(dyn SqlConnection + Send + Sync),
    plan: &MigrationPlan,
    models: &[ModelDescriptor],
    options: &MigrationOptions,
) -> Result<MigrationReport> {
    if plan.is_empty() {
        return Ok(MigrationReport {
            no_changes: true,
            applied_steps: 0,
            version: None,
            risk: plan.risk.clone(),
            warnings: plan.warnings.clone(),
            baseline: None,
        });
    }

    if plan.risk.band == RiskBand::Critical && !options.confirm_critical {
        return Err(MigrateError::CriticalRiskUnconfirmed {
            score: plan.risk.score,
            band: plan.risk.band,
        });
    }

    history::ensure_history_tables(conn.as_queryable()).await?;
    history::acquire_lock(
        conn.as_queryable(),
        SCHEMA_LOCK,
        options.lock_timeout,
        options.force_release_stale_lock,
    )
    .await?;

    let result = run_locked(conn, plan, models, options).await;

    // The lock comes off whatever happened; a failed release on top of a
    // failed migration must not shadow the original error.
    let release = history::release_lock(conn.as_queryable(), SCHEMA_LOCK).await;
    if let (Ok(_), Err(release_error)) = (&result, release) {
        return Err(release_error);
    }

    result
}

async fn run_locked(
    conn: &(dyn SqlConnection + Send + Sync),
    plan: &MigrationPlan,
    models: &[ModelDescriptor],
    options: &MigrationOptions,
) -> Result<MigrationReport> {
    let mut warnings = plan.warnings.clone();

    let baseline_before = match &options.performance_baseline {
        Some(config) if !config.queries.is_empty() => {
            Some(baseline::capture(conn.as_queryable(), config).await?)
        }
        _ => None,
    };

    let tx = conn.start_transaction(None).await?;

    if let Err(failure) = run_steps(&tx, &plan.steps).await {
        // `run_steps` already unwound the applied steps (or bailed out with
        // a manual-recovery fault). Committing persists the unwound state;
        // it equals the pre-migration schema unless recovery is manual.
        let manual = matches!(failure, MigrateError::ManualRecoveryRequired { .. });
        let status = if manual { "manual_recovery" } else { "rolled_back" };

        let record = history::record_migration(
            &tx,
            NewMigration {
                version: version_stamp(),
                checksum: String::new(),
                status,
                forward_sql: join_forward(&plan.steps),
                reverse_sql: join_reverse(&plan.steps),
                application_id: options.application_id.clone(),
                models,
            },
        )
        .await;

        match record {
            Ok(()) => tx.commit().await?,
            // A poisoned transaction cannot even record history; drop it.
            Err(_) => tx.rollback().await?,
        }

        return Err(failure);
    }

    let baseline_report = match (&options.performance_baseline, baseline_before) {
        (Some(config), Some(before)) => {
            let after = baseline::capture(&tx, config).await?;
            let comparison = baseline::compare(before, after, config.degradation_threshold);

            if !comparison.degraded.is_empty() {
                if config.abort_on_degradation {
                    tx.rollback().await?;
                    return Err(MigrateError::PerformanceDegradation {
                        threshold: config.degradation_threshold,
                        details: comparison.degraded.join(", "),
                    });
                }

                warnings.push(format!(
                    "performance baseline degraded {:.1}x on: {}",
                    comparison.worst_ratio,
                    comparison.degraded.join(", ")
                ));
            }

            Some(comparison)
        }
        _ => None,
    };

    let version = version_stamp();
    history::record_migration(
        &tx,
        NewMigration {
            version: version.clone(),
            checksum: plan_checksum(plan),
            status: "applied",
            forward_sql: join_forward(&plan.steps),
            reverse_sql: join_reverse(&plan.steps),
            application_id: options.application_id.clone(),
            models,
        },
    )
    .await?;

    tx.commit().await?;

    tracing::info!(
        target: "dataflow::migration",
        steps = plan.steps.len(),
        version = %version,
        risk = plan.risk.score,
        "migration applied"
    );

    Ok(MigrationReport {
        no_changes: false,
        applied_steps: plan.steps.len(),
        version: Some(version),
        risk: plan.risk.clone(),
        warnings,
        baseline: baseline_report,
    })
}

/// Runs the steps under per-step savepoints. On failure the transaction is
/// left holding the unwound state; the caller commits or rolls back.
async fn run_steps(tx: &Transaction<'_>, steps: &[MigrationStep]) -> Result<()> {
    let mut open_group: Option<(usize, String)> = None;

    for (index, step) in steps.iter().enumerate() {
        // Grouped steps share one savepoint so the whole group unwinds as a
        // unit.
        let savepoint = match (step.group, &open_group) {
            (Some(group), Some((open, name))) if *open == group => name.clone(),
            (Some(group), _) => {
                let name = format!("group_{group}");
                tx.savepoint(&name).await?;
                open_group = Some((group, name.clone()));
                name
            }
            (None, _) => {
                let name = format!("step_{index}");
                tx.savepoint(&name).await?;
                open_group = None;
                name
            }
        };

        tracing::debug!(
            target: "dataflow::migration",
            step = index,
            kind = ?step.kind,
            table = %step.table,
            "executing migration step"
        );

        if let Err(e) = tx.raw_cmd(&step.forward_sql).await {
            tx.rollback_to(&savepoint).await?;

            let failed_group = step.group;
            let unwound: Vec<usize> = (0..index)
                .filter(|i| failed_group.is_none() || steps[*i].group != failed_group)
                .collect();

            unwind(tx, steps, &unwound, index).await?;

            return Err(MigrateError::Aborted {
                step_index: index,
                step: step.description.clone(),
                reason: e.to_string(),
            });
        }
    }

    Ok(())
}

/// Applies reverse SQL for the given completed steps, newest first.
async fn unwind(
    tx: &Transaction<'_>,
    steps: &[MigrationStep],
    completed: &[usize],
    failed_index: usize,
) -> Result<()> {
    let mut remaining: Vec<usize> = completed.to_vec();

    while let Some(index) = remaining.pop() {
        let step = &steps[index];

        match &step.reverse {
            ReverseSql::Sql(sql) => {
                if let Err(e) = tx.raw_cmd(sql).await {
                    // A failed reversal leaves the remaining work untouched.
                    return Err(manual_recovery(steps, &remaining, failed_index, Some(e)));
                }
            }
            ReverseSql::Irreversible => {
                return Err(manual_recovery(steps, &remaining, failed_index, None));
            }
        }
    }

    Ok(())
}

fn manual_recovery(
    steps: &[MigrationStep],
    remaining: &[usize],
    failed_index: usize,
    reverse_error: Option<dataflow_sql::Error>,
) -> MigrateError {
    let mut affected: BTreeSet<String> = remaining.iter().map(|i| steps[*i].table.clone()).collect();
    affected.insert(steps[failed_index].table.clone());

    if let Some(e) = reverse_error {
        tracing::error!(
            target: "dataflow::migration",
            error = %e,
            "reverse statement failed during rollback"
        );
    }

    let remaining_reverse = remaining
        .iter()
        .rev()
        .map(|i| match &steps[*i].reverse {
            ReverseSql::Sql(sql) => sql.clone(),
            ReverseSql::Irreversible => format!("-- irreversible: {}", steps[*i].description),
        })
        .collect();

    MigrateError::ManualRecoveryRequired {
        affected_tables: affected.into_iter().collect(),
        remaining_reverse,
    }
}

fn join_forward(steps: &[MigrationStep]) -> String {
    steps
        .iter()
        .map(|s| s.forward_sql.as_str())
        .collect::<Vec<_>>()
        .join(";\n")
}

fn join_reverse(steps: &[MigrationStep]) -> String {
    steps
        .iter()
        .rev()
        .map(|s| match &s.reverse {
            ReverseSql::Sql(sql) => sql.clone(),
            ReverseSql::Irreversible => format!("-- irreversible: {}", s.description),
        })
        .collect::<Vec<_>>()
        .join(";\n")
}

fn plan_checksum(plan: &MigrationPlan) -> String {
    use sha2::{Digest, Sha256};
    let joined = join_forward(&plan.steps);
    hex::encode(Sha256::digest(joined.as_bytes()))
}

fn version_stamp() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S%3f").to_string()
}
