//! Turning schema diffs into an ordered, risk-assessed migration plan.
//!
//! The planner owns three concerns on top of DDL rendering:
//!
//! - **Ordering**: FK-dependent steps run after their referents; created
//!   tables come up in dependency order, dropped tables go down in reverse.
//! - **FK coordination**: a type change under a foreign key becomes a
//!   *drop FK → alter → recreate FK* triplet sharing one atomic group, and a
//!   primary-key type change pulls every referencing table into the group.
//! - **Risk**: each plan carries a 0–100 score with the factors that drove
//!   it; the critical band refuses to run without explicit confirmation.

use crate::ddl::DdlRenderer;
use crate::differ::SchemaDiff;
use crate::{MigrateError, MigrationOptions, Result};
use dataflow_describer::{Column, ColumnArity, ColumnTypeFamily, SqlSchema, Table};
use dataflow_sql::ast::{count_star, Select};
use dataflow_sql::connector::{Queryable, SqlFamily};
use enumflags2::{bitflags, BitFlags};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskFactor {
    Production,
    NoVerifiedBackup,
    LargeTable,
    ManyDependents,
    Irreversible,
    DataLoss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskBand {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskBand {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=30 => Self::Low,
            31..=60 => Self::Medium,
            61..=80 => Self::High,
            _ => Self::Critical,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub score: u8,
    pub band: RiskBand,
    pub factors: BitFlags<RiskFactor>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReverseSql {
    Sql(String),
    Irreversible,
}

impl ReverseSql {
    pub fn is_irreversible(&self) -> bool {
        matches!(self, Self::Irreversible)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    CreateTable,
    DropTable,
    RenameTable,
    AddColumn,
    DropColumn,
    AlterColumn,
    AddIndex,
    DropIndex,
    AddForeignKey,
    DropForeignKey,
    RenameColumn,
    AddNotNullDefault,
}

#[derive(Debug, Clone)]
pub struct MigrationStep {
    pub kind: StepKind,
    pub table: String,
    pub column: Option<String>,
    pub forward_sql: String,
    pub reverse: ReverseSql,
    pub destructive: bool,
    /// Steps sharing a group roll back together.
    pub group: Option<usize>,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ImpactReport {
    pub diff: String,
    pub affected_objects: Vec<String>,
    pub required_rewrites: Vec<String>,
    /// 1 (additive) to 5 (table drop).
    pub severity: u8,
}

#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub family: SqlFamily,
    pub steps: Vec<MigrationStep>,
    pub diffs: Vec<SchemaDiff>,
    pub impact: Vec<ImpactReport>,
    pub risk: RiskAssessment,
    pub warnings: Vec<String>,
    /// Every table the plan touches; this is the lock scope.
    pub affected_tables: Vec<String>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn has_irreversible_steps(&self) -> bool {
        self.steps.iter().any(|s| s.reverse.is_irreversible())
    }
}

/// Counts rows per live table for risk scoring and NOT NULL validation.
/// Tables whose names cannot be safely quoted are skipped.
pub async fn fetch_row_counts(
    conn: &dyn Queryable,
    live: &SqlSchema,
) -> Result<HashMap<String, u64>> {
    let mut counts = HashMap::new();

    for table in &live.tables {
        let select = Select::from_table(table.name.as_str()).value(count_star());
        if let Ok(rows) = conn.query(select.into()).await {
            if let Some(count) = rows.first().and_then(|r| r.at(0)).and_then(|v| v.as_i64()) {
                counts.insert(table.name.clone(), count.max(0) as u64);
            }
        }
    }

    Ok(counts)
}

pub fn build_plan(
    family: SqlFamily,
    declared: &SqlSchema,
    live: &SqlSchema,
    diffs: Vec<SchemaDiff>,
    row_counts: &HashMap<String, u64>,
    options: &MigrationOptions,
) -> Result<MigrationPlan> {
    let mut planner = Planner {
        family,
        ddl: DdlRenderer::new(family),
        declared,
        live,
        row_counts,
        steps: Vec::new(),
        warnings: Vec::new(),
        next_group: 0,
        dropped_fks: BTreeSet::new(),
    };

    planner.validate_not_null_additions(&diffs)?;
    planner.plan_steps(&diffs)?;

    let impact = planner.impact_reports(&diffs);
    let affected_tables: Vec<String> = {
        let mut tables: BTreeSet<String> = planner.steps.iter().map(|s| s.table.clone()).collect();
        for step in &planner.steps {
            if step.kind == StepKind::RenameTable {
                if let Some(column) = &step.column {
                    tables.insert(column.clone());
                }
            }
        }
        tables.into_iter().collect()
    };

    let risk = assess_risk(&planner.steps, &impact, &affected_tables, row_counts, options);

    Ok(MigrationPlan {
        family,
        steps: planner.steps,
        diffs,
        impact,
        risk,
        warnings: planner.warnings,
        affected_tables,
    })
}

struct Planner<'a> {
    family: SqlFamily,
    ddl: DdlRenderer,
    declared: &'a SqlSchema,
    live: &'a SqlSchema,
    row_counts: &'a HashMap<String, u64>,
    steps: Vec<MigrationStep>,
    warnings: Vec<String>,
    next_group: usize,
    /// FKs already dropped by an emitted step, keyed by (table, columns).
    dropped_fks: BTreeSet<(String, Vec<String>)>,
}

impl Planner<'_> {
    fn new_group(&mut self) -> usize {
        self.next_group += 1;
        self.next_group - 1
    }

    /// NOT NULL additions on non-empty tables need a concrete default
    /// strategy that does not fight the table's existing constraints.
    fn validate_not_null_additions(&self, diffs: &[SchemaDiff]) -> Result<()> {
        for diff in diffs {
            let (table, column_name, tightening) = match diff {
                SchemaDiff::ColumnAdded { table, column } => (table, column, false),
                SchemaDiff::ColumnNullabilityChanged {
                    table,
                    column,
                    now_required: true,
                } => (table, column, true),
                _ => continue,
            };

            let rows = self.row_counts.get(table).copied().unwrap_or(0);
            if rows == 0 {
                continue;
            }

            let Some(declared_column) = self.declared.table(table).and_then(|t| t.column(column_name))
            else {
                continue;
            };

            if declared_column.tpe.arity != ColumnArity::Required || declared_column.auto_increment {
                continue;
            }

            if declared_column.default.is_none() {
                return Err(MigrateError::MissingNotNullDefault {
                    table: table.clone(),
                    column: column_name.clone(),
                    reason: if tightening {
                        format!("{rows} existing rows may hold NULL")
                    } else {
                        format!("the table already holds {rows} rows")
                    },
                });
            }

            // A constant default on a unique column cannot satisfy more than
            // one pre-existing row.
            let unique = self
                .declared
                .table(table)
                .map(|t| {
                    t.indexes
                        .iter()
                        .any(|i| i.unique && i.columns == vec![column_name.clone()])
                })
                .unwrap_or(false);

            if unique && rows > 1 && !tightening {
                return Err(MigrateError::MissingNotNullDefault {
                    table: table.clone(),
                    column: column_name.clone(),
                    reason: format!(
                        "a constant default would duplicate across {rows} rows under the unique constraint"
                    ),
                });
            }
        }

        Ok(())
    }

    fn plan_steps(&mut self, diffs: &[SchemaDiff]) -> Result<()> {
        let rebuilds = self.sqlite_rebuild_tables(diffs);

        // 1. Renames first: later steps address objects by their new names.
        for diff in diffs {
            if let SchemaDiff::TableRenamed { from, to } = diff {
                self.steps.push(MigrationStep {
                    kind: StepKind::RenameTable,
                    table: to.clone(),
                    column: Some(from.clone()),
                    forward_sql: self.ddl.rename_table(from, to),
                    reverse: ReverseSql::Sql(self.ddl.rename_table(to, from)),
                    destructive: false,
                    group: None,
                    description: format!("rename table {from} to {to}"),
                });
            }
        }

        for diff in diffs {
            if let SchemaDiff::ColumnRenamed { table, from, to } = diff {
                self.steps.push(MigrationStep {
                    kind: StepKind::RenameColumn,
                    table: table.clone(),
                    column: Some(to.clone()),
                    forward_sql: self.ddl.rename_column(table, from, to),
                    reverse: ReverseSql::Sql(self.ddl.rename_column(table, to, from)),
                    destructive: false,
                    group: None,
                    description: format!("rename column {table}.{from} to {to}"),
                });
            }
        }

        // 2. Explicit FK drops (the referenced side may be about to go).
        for diff in diffs {
            if let SchemaDiff::ForeignKeyDropped {
                table,
                columns,
                referenced_table,
            } = diff
            {
                if rebuilds.contains(table) {
                    continue;
                }
                self.plan_drop_foreign_key(table, columns, referenced_table, None);
            }
        }

        // 3. New tables in FK dependency order, with their indexes.
        self.plan_created_tables(diffs)?;

        // 4. Column additions.
        for diff in diffs {
            if let SchemaDiff::ColumnAdded { table, column } = diff {
                if rebuilds.contains(table) {
                    continue;
                }
                self.plan_add_column(table, column);
            }
        }

        // 5. Column changes (with FK coordination on PostgreSQL/MySQL,
        //    table rebuilds on SQLite).
        if self.family == SqlFamily::Sqlite {
            for table in &rebuilds {
                self.plan_sqlite_rebuild(table, diffs);
            }
        } else {
            self.plan_native_alters(diffs);
        }

        // 6. Column drops.
        for diff in diffs {
            if let SchemaDiff::ColumnDropped { table, column } = diff {
                if rebuilds.contains(table) {
                    continue;
                }
                self.plan_drop_column(table, column);
            }
        }

        // 7. New FKs on surviving tables.
        for diff in diffs {
            if let SchemaDiff::ForeignKeyAdded { table, columns, .. } = diff {
                if rebuilds.contains(table) {
                    continue;
                }
                self.plan_add_foreign_key(table, columns, None);
            }
        }

        // 8. Index changes.
        for diff in diffs {
            match diff {
                SchemaDiff::IndexAdded { table, index } if !rebuilds.contains(table) => {
                    if let Some(spec) = self.declared.table(table).and_then(|t| t.index(index)) {
                        self.steps.push(MigrationStep {
                            kind: StepKind::AddIndex,
                            table: table.clone(),
                            column: None,
                            forward_sql: self.ddl.create_index(table, spec),
                            reverse: ReverseSql::Sql(self.ddl.drop_index(table, index)),
                            destructive: false,
                            group: None,
                            description: format!("create index {index} on {table}"),
                        });
                    }
                }
                SchemaDiff::IndexDropped { table, index } if !rebuilds.contains(table) => {
                    let reverse = self
                        .live
                        .table(table)
                        .and_then(|t| t.index(index))
                        .map(|spec| ReverseSql::Sql(self.ddl.create_index(table, spec)))
                        .unwrap_or(ReverseSql::Irreversible);

                    self.steps.push(MigrationStep {
                        kind: StepKind::DropIndex,
                        table: table.clone(),
                        column: None,
                        forward_sql: self.ddl.drop_index(table, index),
                        reverse,
                        destructive: false,
                        group: None,
                        description: format!("drop index {index} on {table}"),
                    });
                }
                _ => {}
            }
        }

        // 9. Dropped tables last, dependents before referents.
        self.plan_dropped_tables(diffs);

        Ok(())
    }

    /// Tables that need the SQLite rebuild treatment. The rebuild subsumes
    /// every other diff on the same table.
    fn sqlite_rebuild_tables(&self, diffs: &[SchemaDiff]) -> BTreeSet<String> {
        if self.family != SqlFamily::Sqlite {
            return BTreeSet::new();
        }

        diffs
            .iter()
            .filter_map(|diff| match diff {
                SchemaDiff::ColumnTypeChanged { table, .. }
                | SchemaDiff::ColumnNullabilityChanged { table, .. }
                | SchemaDiff::ColumnDefaultChanged { table, .. }
                | SchemaDiff::ForeignKeyAdded { table, .. }
                | SchemaDiff::ForeignKeyDropped { table, .. } => Some(table.clone()),
                _ => None,
            })
            .collect()
    }

    fn plan_created_tables(&mut self, diffs: &[SchemaDiff]) -> Result<()> {
        let added: BTreeSet<&str> = diffs
            .iter()
            .filter_map(|d| match d {
                SchemaDiff::TableAdded { table } => Some(table.as_str()),
                _ => None,
            })
            .collect();

        if added.is_empty() {
            return Ok(());
        }

        let ordered = self.order_by_fk_dependencies(&added, false);

        for name in ordered {
            let Some(table) = self.declared.table(&name) else { continue };

            self.steps.push(MigrationStep {
                kind: StepKind::CreateTable,
                table: name.clone(),
                column: None,
                forward_sql: self.ddl.create_table(table),
                reverse: ReverseSql::Sql(self.ddl.drop_table(&name)),
                destructive: false,
                group: None,
                description: format!("create table {name}"),
            });

            // Non-SQLite dialects attach foreign keys as separate steps.
            if self.family != SqlFamily::Sqlite {
                for fk in &table.foreign_keys {
                    self.plan_add_foreign_key(&name, &fk.columns, None);
                }
            }

            for index in &table.indexes {
                self.steps.push(MigrationStep {
                    kind: StepKind::AddIndex,
                    table: name.clone(),
                    column: None,
                    forward_sql: self.ddl.create_index(&name, index),
                    reverse: ReverseSql::Sql(self.ddl.drop_index(&name, &index.name)),
                    destructive: false,
                    group: None,
                    description: format!("create index {} on {name}", index.name),
                });
            }
        }

        Ok(())
    }

    fn plan_dropped_tables(&mut self, diffs: &[SchemaDiff]) {
        let dropped: BTreeSet<&str> = diffs
            .iter()
            .filter_map(|d| match d {
                SchemaDiff::TableDropped { table } => Some(table.as_str()),
                _ => None,
            })
            .collect();

        if dropped.is_empty() {
            return;
        }

        // Referencing tables drop before the tables they point at.
        let ordered = self.order_by_fk_dependencies(&dropped, true);

        for name in ordered {
            let reverse = self
                .live
                .table(&name)
                .and_then(|table| self.reversible_table_ddl(table))
                .map(ReverseSql::Sql)
                .unwrap_or(ReverseSql::Irreversible);

            self.steps.push(MigrationStep {
                kind: StepKind::DropTable,
                table: name.clone(),
                column: None,
                forward_sql: self.ddl.drop_table(&name),
                reverse,
                destructive: true,
                group: None,
                description: format!("drop table {name}"),
            });
        }
    }

    /// Kahn's ordering over FK edges (referenced table first), alphabetical
    /// tie-break. Cycles get a warning and fall back to name order.
    fn order_by_fk_dependencies(&mut self, names: &BTreeSet<&str>, reverse: bool) -> Vec<String> {
        let schema = if reverse { self.live } else { self.declared };

        let mut incoming: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for &name in names {
            incoming.entry(name).or_default();
            outgoing.entry(name).or_default();
        }

        for &name in names {
            if let Some(table) = schema.table(name) {
                for fk in &table.foreign_keys {
                    let referenced = fk.referenced_table.as_str();
                    if names.contains(referenced) && referenced != name {
                        // referenced → referencing
                        if let Some(dependents) = outgoing.get_mut(referenced) {
                            dependents.insert(name);
                        }
                        if let Some(dependencies) = incoming.get_mut(name) {
                            dependencies.insert(referenced);
                        }
                    }
                }
            }
        }

        let mut ready: BTreeSet<&str> = incoming
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();
        let mut ordered: Vec<String> = Vec::new();

        while !ready.is_empty() {
            let next = *ready.iter().next().expect("checked non-empty");
            ready.remove(next);
            ordered.push(next.to_owned());

            let dependents = outgoing.get(next).cloned().unwrap_or_default();
            for dependent in dependents {
                let deps = incoming.get_mut(dependent).expect("node registered");
                deps.remove(next);
                if deps.is_empty() && !ordered.iter().any(|o| o == dependent) {
                    ready.insert(dependent);
                }
            }
        }

        if ordered.len() < names.len() {
            let stuck: Vec<String> = names
                .iter()
                .filter(|n| !ordered.iter().any(|o| o.as_str() == **n))
                .map(|n| (*n).to_owned())
                .collect();
            self.warnings.push(format!(
                "cyclic foreign-key dependency among: {}",
                stuck.join(", ")
            ));
            ordered.extend(stuck);
        }

        if reverse {
            ordered.reverse();
        }

        ordered
    }

    fn plan_add_column(&mut self, table_name: &str, column_name: &str) {
        let Some(table) = self.declared.table(table_name) else { return };
        let Some(column) = table.column(column_name) else { return };

        let rows = self.row_counts.get(table_name).copied().unwrap_or(0);
        let kind = if column.is_required() && rows > 0 {
            StepKind::AddNotNullDefault
        } else {
            StepKind::AddColumn
        };

        self.steps.push(MigrationStep {
            kind,
            table: table_name.to_owned(),
            column: Some(column_name.to_owned()),
            forward_sql: self.ddl.add_column(table, column),
            reverse: ReverseSql::Sql(self.ddl.drop_column(table_name, column_name)),
            destructive: false,
            group: None,
            description: format!("add column {table_name}.{column_name}"),
        });
    }

    fn plan_drop_column(&mut self, table_name: &str, column_name: &str) {
        let reverse = self
            .live
            .table(table_name)
            .and_then(|t| t.column(column_name))
            .filter(|c| !matches!(c.tpe.family, ColumnTypeFamily::Unsupported(_)))
            .map(|c| {
                ReverseSql::Sql(
                    self.ddl
                        .add_column(self.live.table(table_name).expect("checked above"), c),
                )
            })
            .unwrap_or(ReverseSql::Irreversible);

        self.steps.push(MigrationStep {
            kind: StepKind::DropColumn,
            table: table_name.to_owned(),
            column: Some(column_name.to_owned()),
            forward_sql: self.ddl.drop_column(table_name, column_name),
            reverse,
            destructive: true,
            group: None,
            description: format!("drop column {table_name}.{column_name}"),
        });
    }

    fn plan_drop_foreign_key(
        &mut self,
        table: &str,
        columns: &[String],
        referenced_table: &str,
        group: Option<usize>,
    ) {
        if !self
            .dropped_fks
            .insert((table.to_owned(), columns.to_vec()))
        {
            return;
        }

        let live_fk = self.live.table(table).and_then(|t| {
            t.foreign_keys
                .iter()
                .find(|fk| fk.columns == columns && fk.referenced_table == referenced_table)
        });

        let Some(fk) = live_fk else { return };
        let constraint = fk
            .constraint_name
            .clone()
            .unwrap_or_else(|| format!("{table}_{}_fkey", columns.join("_")));

        self.steps.push(MigrationStep {
            kind: StepKind::DropForeignKey,
            table: table.to_owned(),
            column: columns.first().cloned(),
            forward_sql: self.ddl.drop_foreign_key(table, &constraint),
            reverse: ReverseSql::Sql(self.ddl.add_foreign_key(table, fk)),
            destructive: false,
            group,
            description: format!("drop foreign key {constraint} on {table}"),
        });
    }

    fn plan_add_foreign_key(&mut self, table: &str, columns: &[String], group: Option<usize>) {
        let declared_fk = self.declared.table(table).and_then(|t| {
            t.foreign_keys.iter().find(|fk| fk.columns == columns)
        });

        let Some(fk) = declared_fk else { return };
        let constraint = fk
            .constraint_name
            .clone()
            .unwrap_or_else(|| format!("{table}_{}_fkey", columns.join("_")));

        self.steps.push(MigrationStep {
            kind: StepKind::AddForeignKey,
            table: table.to_owned(),
            column: columns.first().cloned(),
            forward_sql: self.ddl.add_foreign_key(table, fk),
            reverse: ReverseSql::Sql(self.ddl.drop_foreign_key(table, &constraint)),
            destructive: false,
            group,
            description: format!("add foreign key on {table} ({})", columns.join(", ")),
        });
    }

    /// Native ALTERs for PostgreSQL/MySQL, coordinating foreign keys.
    ///
    /// Type-changed columns connected through live foreign keys form one
    /// cluster; the whole cluster migrates as a single atomic group of
    /// *drop FKs → alter columns → recreate FKs*. A primary-key type change
    /// therefore drags every referencing table into its group.
    fn plan_native_alters(&mut self, diffs: &[SchemaDiff]) {
        let mut changed: BTreeSet<(String, String)> = BTreeSet::new();
        let mut type_changed: BTreeSet<(String, String)> = BTreeSet::new();

        for diff in diffs {
            match diff {
                SchemaDiff::ColumnTypeChanged { table, column, .. } => {
                    changed.insert((table.clone(), column.clone()));
                    type_changed.insert((table.clone(), column.clone()));
                }
                SchemaDiff::ColumnNullabilityChanged { table, column, .. }
                | SchemaDiff::ColumnDefaultChanged { table, column } => {
                    changed.insert((table.clone(), column.clone()));
                }
                _ => {}
            }
        }

        // Live FKs with a type-changed column on either side must come down
        // before the ALTER and back up afterwards.
        let mut coordinated_fks: Vec<(String, dataflow_describer::ForeignKey)> = Vec::new();
        for table in &self.live.tables {
            for fk in &table.foreign_keys {
                let owning_side = fk
                    .columns
                    .iter()
                    .any(|c| type_changed.contains(&(table.name.clone(), c.clone())));
                let referenced_side = fk.referenced_columns.iter().any(|c| {
                    type_changed.contains(&(fk.referenced_table.clone(), c.clone()))
                });

                if owning_side || referenced_side {
                    coordinated_fks.push((table.name.clone(), fk.clone()));
                }
            }
        }

        // Referencing columns follow the type of the column they point at,
        // even when no diff named them.
        let mut pulled_in: BTreeSet<(String, String)> = BTreeSet::new();
        for (owning_table, fk) in &coordinated_fks {
            for (column, referenced_column) in fk.columns.iter().zip(&fk.referenced_columns) {
                let target = (fk.referenced_table.clone(), referenced_column.clone());
                let own = (owning_table.clone(), column.clone());
                if type_changed.contains(&target) && !type_changed.contains(&own) {
                    pulled_in.insert(own);
                }
            }
        }

        // Cluster columns connected through coordinated FKs (union-find over
        // column ids).
        let mut nodes: Vec<(String, String)> = type_changed.iter().cloned().collect();
        nodes.extend(pulled_in.iter().cloned());
        nodes.sort();
        nodes.dedup();

        let index_of = |nodes: &[(String, String)], key: &(String, String)| {
            nodes.iter().position(|n| n == key)
        };

        let mut parent: Vec<usize> = (0..nodes.len()).collect();
        fn find(parent: &mut Vec<usize>, i: usize) -> usize {
            if parent[i] != i {
                let up = parent[i];
                let root = find(parent, up);
                parent[i] = root;
            }
            parent[i]
        }

        for (owning_table, fk) in &coordinated_fks {
            for (column, referenced_column) in fk.columns.iter().zip(&fk.referenced_columns) {
                let a = index_of(&nodes, &(owning_table.clone(), column.clone()));
                let b = index_of(&nodes, &(fk.referenced_table.clone(), referenced_column.clone()));
                if let (Some(a), Some(b)) = (a, b) {
                    let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
                    if ra != rb {
                        parent[ra] = rb;
                    }
                }
            }
        }

        // One migration group per cluster that has FKs to coordinate.
        let mut cluster_groups: BTreeMap<usize, usize> = BTreeMap::new();
        for (owning_table, fk) in &coordinated_fks {
            let anchor = fk
                .columns
                .first()
                .map(|c| (owning_table.clone(), c.clone()))
                .and_then(|key| index_of(&nodes, &key))
                .or_else(|| {
                    fk.referenced_columns
                        .first()
                        .map(|c| (fk.referenced_table.clone(), c.clone()))
                        .and_then(|key| index_of(&nodes, &key))
                });

            if let Some(anchor) = anchor {
                let root = find(&mut parent, anchor);
                if !cluster_groups.contains_key(&root) {
                    let group = self.new_group();
                    cluster_groups.insert(root, group);
                }
            }
        }

        let group_for = |parent: &mut Vec<usize>,
                         cluster_groups: &BTreeMap<usize, usize>,
                         nodes: &[(String, String)],
                         key: &(String, String)| {
            index_of(nodes, key)
                .map(|i| find(parent, i))
                .and_then(|root| cluster_groups.get(&root).copied())
        };

        // Phase 1: drop coordinated FKs.
        for (owning_table, fk) in coordinated_fks.clone() {
            let group = fk.columns.first().and_then(|c| {
                group_for(
                    &mut parent,
                    &cluster_groups,
                    &nodes,
                    &(owning_table.clone(), c.clone()),
                )
            });
            self.plan_drop_foreign_key(&owning_table, &fk.columns, &fk.referenced_table, group);
        }

        // Phase 2: alter every changed column, clustered ones in their group.
        let mut altered: BTreeSet<(String, String)> = BTreeSet::new();

        for (table_name, column_name) in changed.iter().chain(pulled_in.iter()) {
            if !altered.insert((table_name.clone(), column_name.clone())) {
                continue;
            }

            let Some(live_column) = self
                .live
                .table(table_name)
                .and_then(|t| t.column(column_name))
            else {
                continue;
            };

            let desired = match self
                .declared
                .table(table_name)
                .and_then(|t| t.column(column_name))
            {
                Some(column) => column.clone(),
                None => {
                    // A pulled-in referencing column absent from the declared
                    // diff follows the referenced column's new type.
                    let Some((_, fk)) = coordinated_fks.iter().find(|(t, fk)| {
                        t == table_name && fk.columns.contains(column_name)
                    }) else {
                        continue;
                    };
                    let position = fk
                        .columns
                        .iter()
                        .position(|c| c == column_name)
                        .unwrap_or(0);
                    let Some(referenced) = self
                        .declared
                        .table(&fk.referenced_table)
                        .and_then(|t| t.column(&fk.referenced_columns[position]))
                    else {
                        continue;
                    };

                    let mut desired = live_column.clone();
                    desired.tpe.family = referenced.tpe.family.clone();
                    desired.tpe.full_data_type = referenced.tpe.full_data_type.clone();
                    desired
                }
            };

            if desired.tpe == live_column.tpe && desired.default == live_column.default {
                continue;
            }

            let group = group_for(
                &mut parent,
                &cluster_groups,
                &nodes,
                &(table_name.clone(), column_name.clone()),
            );

            self.push_alter_step(table_name, &desired, live_column, group);
        }

        // Phase 3: recreate coordinated FKs, unless the declared schema
        // dropped them on purpose.
        for (owning_table, fk) in coordinated_fks {
            let explicitly_dropped = diffs.iter().any(|d| {
                matches!(
                    d,
                    SchemaDiff::ForeignKeyDropped { table, columns, .. }
                        if *table == owning_table && *columns == fk.columns
                )
            });
            if explicitly_dropped {
                continue;
            }

            let group = fk.columns.first().and_then(|c| {
                group_for(
                    &mut parent,
                    &cluster_groups,
                    &nodes,
                    &(owning_table.clone(), c.clone()),
                )
            });

            let declared_has = self
                .declared
                .table(&owning_table)
                .map(|t| t.foreign_keys.iter().any(|d| d.columns == fk.columns))
                .unwrap_or(false);

            if declared_has {
                self.plan_add_foreign_key(&owning_table, &fk.columns, group);
            } else {
                let constraint = fk.constraint_name.clone().unwrap_or_else(|| {
                    format!("{owning_table}_{}_fkey", fk.columns.join("_"))
                });
                self.steps.push(MigrationStep {
                    kind: StepKind::AddForeignKey,
                    table: owning_table.clone(),
                    column: fk.columns.first().cloned(),
                    forward_sql: self.ddl.add_foreign_key(&owning_table, &fk),
                    reverse: ReverseSql::Sql(self.ddl.drop_foreign_key(&owning_table, &constraint)),
                    destructive: false,
                    group,
                    description: format!("recreate foreign key on {owning_table}"),
                });
            }
        }
    }

    fn push_alter_step(
        &mut self,
        table_name: &str,
        desired: &Column,
        current: &Column,
        group: Option<usize>,
    ) {
        let destructive = is_lossy_conversion(&current.tpe.family, &desired.tpe.family);
        if destructive {
            self.warnings.push(format!(
                "type change on {table_name}.{} may lose data ({:?} -> {:?})",
                desired.name, current.tpe.family, desired.tpe.family
            ));
        }

        self.steps.push(MigrationStep {
            kind: StepKind::AlterColumn,
            table: table_name.to_owned(),
            column: Some(desired.name.clone()),
            forward_sql: self.ddl.alter_column(table_name, desired),
            reverse: ReverseSql::Sql(self.ddl.alter_column(table_name, current)),
            destructive,
            group,
            description: format!("alter column {table_name}.{}", desired.name),
        });
    }

    /// The one-step SQLite shape change: rebuild the table as declared.
    fn plan_sqlite_rebuild(&mut self, table_name: &str, diffs: &[SchemaDiff]) {
        let Some(current) = self.live.table(table_name) else { return };
        let Some(desired) = self.declared.table(table_name) else { return };

        let changes: Vec<String> = diffs
            .iter()
            .filter_map(|d| match d {
                SchemaDiff::ColumnTypeChanged { table, column, .. } if table == table_name => {
                    Some(format!("retype {column}"))
                }
                SchemaDiff::ColumnNullabilityChanged { table, column, .. } if table == table_name => {
                    Some(format!("renullability {column}"))
                }
                SchemaDiff::ForeignKeyAdded { table, columns, .. } if table == table_name => {
                    Some(format!("add fk on {}", columns.join(",")))
                }
                SchemaDiff::ForeignKeyDropped { table, columns, .. } if table == table_name => {
                    Some(format!("drop fk on {}", columns.join(",")))
                }
                _ => None,
            })
            .collect();

        let destructive = diffs.iter().any(|d| {
            matches!(d, SchemaDiff::ColumnDropped { table, .. } if table == table_name)
                || matches!(
                    d,
                    SchemaDiff::ColumnTypeChanged { table, from_family, to_family, .. }
                        if table == table_name && is_lossy_conversion(from_family, to_family)
                )
        });

        // Tightened NOT NULL columns get their default backfilled first.
        let mut forward = String::new();
        for diff in diffs {
            if let SchemaDiff::ColumnNullabilityChanged {
                table,
                column,
                now_required: true,
            } = diff
            {
                if table == table_name {
                    if let Some(default) = desired.column(column).and_then(|c| c.default.as_ref()) {
                        forward.push_str(&format!(
                            "UPDATE {} SET {} = {} WHERE {} IS NULL;\n",
                            self.ddl.quote(table_name),
                            self.ddl.quote(column),
                            self.ddl.render_default(default),
                            self.ddl.quote(column),
                        ));
                    }
                }
            }
        }
        forward.push_str(&self.ddl.rebuild_table(current, desired));

        let group = self.new_group();
        self.steps.push(MigrationStep {
            kind: StepKind::AlterColumn,
            table: table_name.to_owned(),
            column: None,
            forward_sql: forward,
            reverse: ReverseSql::Sql(self.ddl.rebuild_table(desired, current)),
            destructive,
            group: Some(group),
            description: format!("rebuild table {table_name} ({})", changes.join("; ")),
        });
    }

    fn reversible_table_ddl(&self, table: &Table) -> Option<String> {
        if table
            .columns
            .iter()
            .any(|c| matches!(c.tpe.family, ColumnTypeFamily::Unsupported(_)))
        {
            return None;
        }

        let mut statements = vec![self.ddl.create_table(table)];
        for index in &table.indexes {
            statements.push(self.ddl.create_index(&table.name, index));
        }
        Some(statements.join(";\n"))
    }

    fn impact_reports(&self, diffs: &[SchemaDiff]) -> Vec<ImpactReport> {
        diffs
            .iter()
            .map(|diff| {
                let (table, column, severity) = match diff {
                    SchemaDiff::TableAdded { table } => (Some(table), None, 1),
                    SchemaDiff::IndexAdded { table, .. } | SchemaDiff::IndexDropped { table, .. } => {
                        (Some(table), None, 2)
                    }
                    SchemaDiff::ColumnAdded { table, column } => (Some(table), Some(column), 1),
                    SchemaDiff::ColumnDefaultChanged { table, column } => (Some(table), Some(column), 2),
                    SchemaDiff::TableRenamed { to, .. } => (Some(to), None, 2),
                    SchemaDiff::TableRenameCandidates { dropped, .. } => (Some(dropped), None, 3),
                    SchemaDiff::ColumnRenamed { table, to, .. } => (Some(table), Some(to), 3),
                    SchemaDiff::ColumnTypeChanged { table, column, .. }
                    | SchemaDiff::ColumnNullabilityChanged { table, column, .. } => {
                        (Some(table), Some(column), 3)
                    }
                    SchemaDiff::ForeignKeyAdded { table, .. }
                    | SchemaDiff::ForeignKeyDropped { table, .. } => (Some(table), None, 3),
                    SchemaDiff::ColumnDropped { table, column } => (Some(table), Some(column), 4),
                    SchemaDiff::TableDropped { table } => (Some(table), None, 5),
                };

                let mut affected = Vec::new();
                let mut rewrites = Vec::new();

                if let (Some(table_name), Some(column_name)) = (table, column) {
                    if let Some(live_table) = self.live.table(table_name) {
                        for index in &live_table.indexes {
                            if index.columns.contains(column_name) {
                                affected.push(format!("index {}", index.name));
                            }
                        }
                        for fk in &live_table.foreign_keys {
                            if fk.columns.contains(column_name) {
                                let name = fk.constraint_name.as_deref().unwrap_or("fk");
                                affected.push(format!("foreign key {name}"));
                                rewrites.push(format!("recreate foreign key {name}"));
                            }
                        }
                    }

                    for other in &self.live.tables {
                        for fk in &other.foreign_keys {
                            if &fk.referenced_table == table_name
                                && fk.referenced_columns.contains(column_name)
                            {
                                let name = fk.constraint_name.as_deref().unwrap_or("fk");
                                affected.push(format!("foreign key {name} on {}", other.name));
                                rewrites.push(format!("recreate foreign key {name} on {}", other.name));
                            }
                        }
                    }
                }

                if let Some(table_name) = table {
                    for view in &self.live.views {
                        if view
                            .definition
                            .as_deref()
                            .map(|d| d.contains(table_name.as_str()))
                            .unwrap_or(false)
                        {
                            affected.push(format!("view {}", view.name));
                        }
                    }
                }

                ImpactReport {
                    diff: format!("{diff:?}"),
                    affected_objects: affected,
                    required_rewrites: rewrites,
                    severity,
                }
            })
            .collect()
    }
}

/// Whether converting between families can drop information.
fn is_lossy_conversion(from: &ColumnTypeFamily, to: &ColumnTypeFamily) -> bool {
    use ColumnTypeFamily as F;

    !matches!(
        (from, to),
        (F::Int, F::BigInt)
            | (F::Int, F::Float)
            | (F::Int, F::Decimal)
            | (F::Int, F::String)
            | (F::BigInt, F::Decimal)
            | (F::BigInt, F::String)
            | (F::Float, F::String)
            | (F::Decimal, F::String)
            | (F::Boolean, F::String)
            | (F::Date, F::DateTime)
            | (F::Date, F::String)
            | (F::DateTime, F::String)
            | (F::Uuid, F::String)
            | (F::Json, F::String)
    ) && from != to
}

fn assess_risk(
    steps: &[MigrationStep],
    impact: &[ImpactReport],
    affected_tables: &[String],
    row_counts: &HashMap<String, u64>,
    options: &MigrationOptions,
) -> RiskAssessment {
    let mut factors = BitFlags::<RiskFactor>::empty();
    let mut score: u32 = 0;

    if steps.is_empty() {
        return RiskAssessment {
            score: 0,
            band: RiskBand::Low,
            factors,
        };
    }

    if options.production {
        factors |= RiskFactor::Production;
        score += 20;
    }

    if !options.verified_backup {
        factors |= RiskFactor::NoVerifiedBackup;
        score += 10;
    }

    let destructive = steps.iter().any(|s| s.destructive);
    let largest = affected_tables
        .iter()
        .filter_map(|t| row_counts.get(t))
        .copied()
        .max()
        .unwrap_or(0);

    if largest > 10_000 {
        factors |= RiskFactor::LargeTable;
        score += if destructive { 20 } else { 10 };
    }

    let dependents: usize = impact.iter().map(|i| i.affected_objects.len()).sum();
    if dependents > 5 {
        factors |= RiskFactor::ManyDependents;
        score += 10;
    }

    if steps.iter().any(|s| s.reverse.is_irreversible()) {
        factors |= RiskFactor::Irreversible;
        score += 20;
    }

    if destructive {
        factors |= RiskFactor::DataLoss;
        score += 25;
    }

    let score = score.min(100) as u8;

    RiskAssessment {
        score,
        band: RiskBand::from_score(score),
        factors,
    }
}

#[cfg(test)]
mod tests;
