//! Diffing a live schema against the declared one.
//!
//! Output is semantic: the planner decides how each diff becomes SQL.
//! Rename detection is opt-in and conservative — a rename is only reported
//! when the column signatures match and exactly one candidate clears the
//! similarity threshold; anything ambiguous is surfaced as candidates and
//! planned as drop-and-add.

use dataflow_describer::{ColumnTypeFamily, SqlSchema, Table};

#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub rename_detection: bool,
    pub rename_similarity_threshold: f64,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            rename_detection: false,
            rename_similarity_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaDiff {
    TableAdded {
        table: String,
    },
    TableDropped {
        table: String,
    },
    TableRenamed {
        from: String,
        to: String,
    },
    /// A dropped table had several equally plausible rename targets. The
    /// drop/add diffs are still emitted; this one is informational.
    TableRenameCandidates {
        dropped: String,
        candidates: Vec<String>,
    },
    ColumnAdded {
        table: String,
        column: String,
    },
    ColumnDropped {
        table: String,
        column: String,
    },
    ColumnRenamed {
        table: String,
        from: String,
        to: String,
    },
    ColumnTypeChanged {
        table: String,
        column: String,
        from_family: ColumnTypeFamily,
        to_family: ColumnTypeFamily,
    },
    ColumnNullabilityChanged {
        table: String,
        column: String,
        now_required: bool,
    },
    ColumnDefaultChanged {
        table: String,
        column: String,
    },
    IndexAdded {
        table: String,
        index: String,
    },
    IndexDropped {
        table: String,
        index: String,
    },
    ForeignKeyAdded {
        table: String,
        columns: Vec<String>,
        referenced_table: String,
    },
    ForeignKeyDropped {
        table: String,
        columns: Vec<String>,
        referenced_table: String,
    },
}

/// Diffs `live` (the database as it is) against `declared` (as it should
/// become).
pub fn diff(live: &SqlSchema, declared: &SqlSchema, options: &DiffOptions) -> Vec<SchemaDiff> {
    let mut diffs = Vec::new();

    let added: Vec<&Table> = declared
        .tables
        .iter()
        .filter(|t| !live.has_table(&t.name))
        .collect();
    let dropped: Vec<&Table> = live
        .tables
        .iter()
        .filter(|t| !declared.has_table(&t.name))
        .collect();

    let mut renamed: Vec<(String, String)> = Vec::new();
    let mut consumed_added: Vec<&str> = Vec::new();
    let mut consumed_dropped: Vec<&str> = Vec::new();

    if options.rename_detection {
        for dropped_table in &dropped {
            let candidates: Vec<&&Table> = added
                .iter()
                .filter(|a| {
                    !consumed_added.contains(&a.name.as_str())
                        && a.column_signature() == dropped_table.column_signature()
                        && similarity(&a.name, &dropped_table.name)
                            >= options.rename_similarity_threshold
                })
                .collect();

            match candidates.as_slice() {
                [single] => {
                    renamed.push((dropped_table.name.clone(), single.name.clone()));
                    consumed_added.push(&single.name);
                    consumed_dropped.push(&dropped_table.name);
                }
                [] => {}
                many => {
                    diffs.push(SchemaDiff::TableRenameCandidates {
                        dropped: dropped_table.name.clone(),
                        candidates: many.iter().map(|t| t.name.clone()).collect(),
                    });
                }
            }
        }
    }

    for (from, to) in renamed {
        diffs.push(SchemaDiff::TableRenamed { from, to });
    }

    for table in &added {
        if !consumed_added.contains(&table.name.as_str()) {
            diffs.push(SchemaDiff::TableAdded {
                table: table.name.clone(),
            });
        }
    }

    for table in &dropped {
        if !consumed_dropped.contains(&table.name.as_str()) {
            diffs.push(SchemaDiff::TableDropped {
                table: table.name.clone(),
            });
        }
    }

    for declared_table in &declared.tables {
        if let Some(live_table) = live.table(&declared_table.name) {
            diff_table(live_table, declared_table, options, &mut diffs);
        }
    }

    diffs
}

fn diff_table(live: &Table, declared: &Table, options: &DiffOptions, diffs: &mut Vec<SchemaDiff>) {
    let table = declared.name.clone();

    let added: Vec<_> = declared
        .columns
        .iter()
        .filter(|c| live.column(&c.name).is_none())
        .collect();
    let dropped: Vec<_> = live
        .columns
        .iter()
        .filter(|c| declared.column(&c.name).is_none())
        .collect();

    let mut consumed_added: Vec<&str> = Vec::new();
    let mut consumed_dropped: Vec<&str> = Vec::new();

    if options.rename_detection {
        for dropped_column in &dropped {
            let candidates: Vec<_> = added
                .iter()
                .filter(|a| {
                    !consumed_added.contains(&a.name.as_str())
                        && a.tpe.family == dropped_column.tpe.family
                        && a.tpe.arity == dropped_column.tpe.arity
                        && similarity(&a.name, &dropped_column.name)
                            >= options.rename_similarity_threshold
                })
                .collect();

            if let [single] = candidates.as_slice() {
                diffs.push(SchemaDiff::ColumnRenamed {
                    table: table.clone(),
                    from: dropped_column.name.clone(),
                    to: single.name.clone(),
                });
                consumed_added.push(&single.name);
                consumed_dropped.push(&dropped_column.name);
            }
        }
    }

    for column in &added {
        if !consumed_added.contains(&column.name.as_str()) {
            diffs.push(SchemaDiff::ColumnAdded {
                table: table.clone(),
                column: column.name.clone(),
            });
        }
    }

    for column in &dropped {
        if !consumed_dropped.contains(&column.name.as_str()) {
            diffs.push(SchemaDiff::ColumnDropped {
                table: table.clone(),
                column: column.name.clone(),
            });
        }
    }

    for declared_column in &declared.columns {
        let Some(live_column) = live.column(&declared_column.name) else {
            continue;
        };

        if live_column.tpe.family != declared_column.tpe.family {
            diffs.push(SchemaDiff::ColumnTypeChanged {
                table: table.clone(),
                column: declared_column.name.clone(),
                from_family: live_column.tpe.family.clone(),
                to_family: declared_column.tpe.family.clone(),
            });
        }

        if live_column.tpe.arity != declared_column.tpe.arity {
            diffs.push(SchemaDiff::ColumnNullabilityChanged {
                table: table.clone(),
                column: declared_column.name.clone(),
                now_required: declared_column.is_required(),
            });
        }

        // Auto-increment columns own their default; nothing to compare.
        if !declared_column.auto_increment
            && !live_column.auto_increment
            && live_column.default != declared_column.default
        {
            diffs.push(SchemaDiff::ColumnDefaultChanged {
                table: table.clone(),
                column: declared_column.name.clone(),
            });
        }
    }

    // Indexes pair by column set and uniqueness, not by name, so renamed
    // auto-generated index names do not churn.
    for declared_index in &declared.indexes {
        let exists = live
            .indexes
            .iter()
            .any(|i| i.columns == declared_index.columns && i.unique == declared_index.unique);
        if !exists {
            diffs.push(SchemaDiff::IndexAdded {
                table: table.clone(),
                index: declared_index.name.clone(),
            });
        }
    }

    for live_index in &live.indexes {
        let exists = declared
            .indexes
            .iter()
            .any(|i| i.columns == live_index.columns && i.unique == live_index.unique);
        if !exists {
            diffs.push(SchemaDiff::IndexDropped {
                table: table.clone(),
                index: live_index.name.clone(),
            });
        }
    }

    for declared_fk in &declared.foreign_keys {
        let exists = live.foreign_keys.iter().any(|fk| {
            fk.columns == declared_fk.columns
                && fk.referenced_table == declared_fk.referenced_table
                && fk.referenced_columns == declared_fk.referenced_columns
        });
        if !exists {
            diffs.push(SchemaDiff::ForeignKeyAdded {
                table: table.clone(),
                columns: declared_fk.columns.clone(),
                referenced_table: declared_fk.referenced_table.clone(),
            });
        }
    }

    for live_fk in &live.foreign_keys {
        let exists = declared.foreign_keys.iter().any(|fk| {
            fk.columns == live_fk.columns
                && fk.referenced_table == live_fk.referenced_table
                && fk.referenced_columns == live_fk.referenced_columns
        });
        if !exists {
            diffs.push(SchemaDiff::ForeignKeyDropped {
                table: table.clone(),
                columns: live_fk.columns.clone(),
                referenced_table: live_fk.referenced_table.clone(),
            });
        }
    }
}

/// Normalized similarity in `[0, 1]`: 1 minus the Levenshtein distance over
/// the longer length, compared case-insensitively.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();

    if a == b {
        return 1.0;
    }

    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }

    1.0 - levenshtein(&a, &b) as f64 / longest as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_describer::{Column, ColumnArity, ColumnType};

    fn column(name: &str, full: &str, required: bool) -> Column {
        Column {
            name: name.to_owned(),
            tpe: ColumnType {
                family: dataflow_describer::family_from_sql_type(full),
                arity: if required { ColumnArity::Required } else { ColumnArity::Nullable },
                full_data_type: full.to_owned(),
            },
            default: None,
            auto_increment: false,
        }
    }

    fn table(name: &str, columns: Vec<Column>) -> Table {
        Table {
            name: name.to_owned(),
            columns,
            indexes: vec![],
            foreign_keys: vec![],
            primary_key: None,
        }
    }

    fn schema(tables: Vec<Table>) -> SqlSchema {
        SqlSchema { tables, views: vec![] }
    }

    #[test]
    fn detects_added_and_dropped_tables() {
        let live = schema(vec![table("old", vec![])]);
        let declared = schema(vec![table("new", vec![])]);

        let diffs = diff(&live, &declared, &DiffOptions::default());
        assert!(diffs.contains(&SchemaDiff::TableAdded { table: "new".to_owned() }));
        assert!(diffs.contains(&SchemaDiff::TableDropped { table: "old".to_owned() }));
    }

    #[test]
    fn rename_detection_requires_opt_in_and_signature_match() {
        let columns = || vec![column("id", "INTEGER", true), column("name", "TEXT", false)];
        let live = schema(vec![table("customers", columns())]);
        let declared = schema(vec![table("customer", columns())]);

        // Off: drop + add.
        let diffs = diff(&live, &declared, &DiffOptions::default());
        assert!(diffs.iter().any(|d| matches!(d, SchemaDiff::TableDropped { .. })));

        // On: a rename.
        let diffs = diff(
            &live,
            &declared,
            &DiffOptions {
                rename_detection: true,
                rename_similarity_threshold: 0.6,
            },
        );
        assert_eq!(
            diffs,
            vec![SchemaDiff::TableRenamed {
                from: "customers".to_owned(),
                to: "customer".to_owned(),
            }]
        );
    }

    #[test]
    fn ambiguous_renames_are_surfaced_not_guessed() {
        let columns = || vec![column("id", "INTEGER", true)];
        let live = schema(vec![table("orders", columns())]);
        let declared = schema(vec![table("order_v1", columns()), table("order_v2", columns())]);

        let diffs = diff(
            &live,
            &declared,
            &DiffOptions {
                rename_detection: true,
                rename_similarity_threshold: 0.5,
            },
        );

        assert!(diffs
            .iter()
            .any(|d| matches!(d, SchemaDiff::TableRenameCandidates { candidates, .. } if candidates.len() == 2)));
        // And the safe drop/add interpretation is still planned.
        assert!(diffs.iter().any(|d| matches!(d, SchemaDiff::TableDropped { .. })));
        assert!(diffs.iter().filter(|d| matches!(d, SchemaDiff::TableAdded { .. })).count() == 2);
    }

    #[test]
    fn detects_column_type_and_nullability_changes() {
        let live = schema(vec![table(
            "products",
            vec![column("id", "INTEGER", true), column("note", "TEXT", true)],
        )]);
        let declared = schema(vec![table(
            "products",
            vec![column("id", "BIGINT", true), column("note", "TEXT", false)],
        )]);

        let diffs = diff(&live, &declared, &DiffOptions::default());
        assert!(diffs.contains(&SchemaDiff::ColumnTypeChanged {
            table: "products".to_owned(),
            column: "id".to_owned(),
            from_family: ColumnTypeFamily::Int,
            to_family: ColumnTypeFamily::BigInt,
        }));
        assert!(diffs.contains(&SchemaDiff::ColumnNullabilityChanged {
            table: "products".to_owned(),
            column: "note".to_owned(),
            now_required: false,
        }));
    }

    #[test]
    fn similarity_is_normalized() {
        assert_eq!(similarity("users", "users"), 1.0);
        assert!(similarity("users", "user") > 0.7);
        assert!(similarity("users", "payments") < 0.4);
    }
}
