//! DDL rendering.
//!
//! All schema-changing SQL is produced here, from describer-level table and
//! column values whose identifiers were validated at model registration.
//! SQLite cannot alter column types or constraints in place, so those
//! operations lower to a table-rebuild script.

use dataflow_describer::{Column, ColumnArity, DefaultValue, ForeignKey, ForeignKeyAction, Index, Table};
use dataflow_sql::connector::SqlFamily;
use itertools::Itertools;

#[derive(Debug, Clone, Copy)]
pub struct DdlRenderer {
    pub family: SqlFamily,
}

impl DdlRenderer {
    pub fn new(family: SqlFamily) -> Self {
        Self { family }
    }

    pub fn quote(&self, identifier: &str) -> String {
        match self.family {
            SqlFamily::Postgres => format!("\"{identifier}\""),
            SqlFamily::Mysql | SqlFamily::Sqlite => format!("`{identifier}`"),
        }
    }

    fn quote_list(&self, identifiers: &[String]) -> String {
        identifiers.iter().map(|i| self.quote(i)).join(", ")
    }

    pub fn create_table(&self, table: &Table) -> String {
        let mut parts: Vec<String> = Vec::new();

        for column in &table.columns {
            parts.push(self.column_definition(table, column));
        }

        // A single-column auto-increment key is declared inline.
        if let Some(pk) = &table.primary_key {
            let inline = pk.columns.len() == 1
                && table
                    .column(&pk.columns[0])
                    .map(|c| c.auto_increment)
                    .unwrap_or(false);

            if !inline {
                parts.push(format!("PRIMARY KEY ({})", self.quote_list(&pk.columns)));
            }
        }

        // SQLite takes foreign keys inline only; for the others they are
        // separate ALTER steps so the planner can order them.
        if self.family == SqlFamily::Sqlite {
            for fk in &table.foreign_keys {
                parts.push(self.inline_foreign_key(fk));
            }
        }

        format!(
            "CREATE TABLE {} (\n    {}\n)",
            self.quote(&table.name),
            parts.join(",\n    ")
        )
    }

    pub fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE {}", self.quote(table))
    }

    pub fn rename_table(&self, from: &str, to: &str) -> String {
        match self.family {
            SqlFamily::Mysql => format!("RENAME TABLE {} TO {}", self.quote(from), self.quote(to)),
            _ => format!("ALTER TABLE {} RENAME TO {}", self.quote(from), self.quote(to)),
        }
    }

    pub fn add_column(&self, table: &Table, column: &Column) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote(&table.name),
            self.column_definition(table, column)
        )
    }

    pub fn drop_column(&self, table: &str, column: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.quote(table),
            self.quote(column)
        )
    }

    pub fn rename_column(&self, table: &str, from: &str, to: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            self.quote(table),
            self.quote(from),
            self.quote(to)
        )
    }

    /// Column type / nullability / default change. Valid for PostgreSQL and
    /// MySQL; SQLite goes through [`Self::rebuild_table`].
    pub fn alter_column(&self, table: &str, column: &Column) -> String {
        match self.family {
            SqlFamily::Postgres => {
                let mut statements = vec![format!(
                    "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                    self.quote(table),
                    self.quote(&column.name),
                    column.tpe.full_data_type,
                    self.quote(&column.name),
                    column.tpe.full_data_type,
                )];

                statements.push(match column.tpe.arity {
                    ColumnArity::Required => format!(
                        "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
                        self.quote(table),
                        self.quote(&column.name)
                    ),
                    ColumnArity::Nullable => format!(
                        "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL",
                        self.quote(table),
                        self.quote(&column.name)
                    ),
                });

                match &column.default {
                    Some(default) => statements.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                        self.quote(table),
                        self.quote(&column.name),
                        self.render_default(default)
                    )),
                    None => statements.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
                        self.quote(table),
                        self.quote(&column.name)
                    )),
                }

                statements.join(";\n")
            }
            SqlFamily::Mysql => format!(
                "ALTER TABLE {} MODIFY COLUMN {}",
                self.quote(table),
                self.column_fragment(column)
            ),
            SqlFamily::Sqlite => {
                unreachable!("sqlite column changes go through rebuild_table")
            }
        }
    }

    pub fn create_index(&self, table: &str, index: &Index) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote(&index.name),
            self.quote(table),
            self.quote_list(&index.columns)
        )
    }

    pub fn drop_index(&self, table: &str, index: &str) -> String {
        match self.family {
            SqlFamily::Mysql => format!("DROP INDEX {} ON {}", self.quote(index), self.quote(table)),
            _ => format!("DROP INDEX {}", self.quote(index)),
        }
    }

    /// Valid for PostgreSQL and MySQL; SQLite rebuilds instead.
    pub fn add_foreign_key(&self, table: &str, fk: &ForeignKey) -> String {
        let name = fk
            .constraint_name
            .clone()
            .unwrap_or_else(|| format!("{table}_{}_fkey", fk.columns.join("_")));

        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}){}",
            self.quote(table),
            self.quote(&name),
            self.quote_list(&fk.columns),
            self.quote(&fk.referenced_table),
            self.quote_list(&fk.referenced_columns),
            match fk.on_delete_action {
                ForeignKeyAction::Cascade => " ON DELETE CASCADE",
                ForeignKeyAction::Restrict => " ON DELETE RESTRICT",
                ForeignKeyAction::SetNull => " ON DELETE SET NULL",
                ForeignKeyAction::SetDefault => " ON DELETE SET DEFAULT",
                ForeignKeyAction::NoAction => "",
            }
        )
    }

    /// Valid for PostgreSQL and MySQL; SQLite rebuilds instead.
    pub fn drop_foreign_key(&self, table: &str, constraint: &str) -> String {
        match self.family {
            SqlFamily::Mysql => format!(
                "ALTER TABLE {} DROP FOREIGN KEY {}",
                self.quote(table),
                self.quote(constraint)
            ),
            _ => format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                self.quote(table),
                self.quote(constraint)
            ),
        }
    }

    /// The SQLite shape-change script: build the desired table under a scratch
    /// name, copy the shared columns, swap the names, restore the indexes.
    pub fn rebuild_table(&self, current: &Table, desired: &Table) -> String {
        let scratch_name = format!("_dataflow_new_{}", desired.name);
        let mut scratch = desired.clone();
        scratch.name = scratch_name.clone();

        let shared: Vec<String> = desired
            .columns
            .iter()
            .filter(|c| current.column(&c.name).is_some())
            .map(|c| c.name.clone())
            .collect();

        let mut statements = vec![
            "PRAGMA defer_foreign_keys = ON".to_owned(),
            self.create_table(&scratch),
        ];

        if !shared.is_empty() {
            statements.push(format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                self.quote(&scratch_name),
                self.quote_list(&shared),
                self.quote_list(&shared),
                self.quote(&current.name)
            ));
        }

        statements.push(self.drop_table(&current.name));
        statements.push(self.rename_table(&scratch_name, &desired.name));

        for index in &desired.indexes {
            statements.push(self.create_index(&desired.name, index));
        }

        let mut script = statements.join(";\n");
        script.push(';');
        script
    }

    /// One column in a CREATE TABLE or ADD COLUMN.
    fn column_definition(&self, table: &Table, column: &Column) -> String {
        let inline_pk = table
            .primary_key
            .as_ref()
            .map(|pk| pk.columns.len() == 1 && pk.columns[0] == column.name && column.auto_increment)
            .unwrap_or(false);

        if inline_pk {
            return match self.family {
                SqlFamily::Sqlite => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", self.quote(&column.name)),
                SqlFamily::Postgres => {
                    let serial = if column.tpe.full_data_type.eq_ignore_ascii_case("BIGINT") {
                        "BIGSERIAL"
                    } else {
                        "SERIAL"
                    };
                    format!("{} {serial} PRIMARY KEY", self.quote(&column.name))
                }
                SqlFamily::Mysql => format!(
                    "{} {} NOT NULL AUTO_INCREMENT PRIMARY KEY",
                    self.quote(&column.name),
                    column.tpe.full_data_type
                ),
            };
        }

        self.column_fragment(column)
    }

    /// `"name" TYPE [NOT NULL] [DEFAULT …]`
    fn column_fragment(&self, column: &Column) -> String {
        let mut fragment = format!("{} {}", self.quote(&column.name), column.tpe.full_data_type);

        if column.tpe.arity == ColumnArity::Required {
            fragment.push_str(" NOT NULL");
        }

        if let Some(default) = &column.default {
            fragment.push_str(" DEFAULT ");
            fragment.push_str(&self.render_default(default));
        }

        fragment
    }

    pub fn render_default(&self, default: &DefaultValue) -> String {
        match default {
            DefaultValue::Literal(literal) => {
                if literal_is_bare(literal) {
                    literal.clone()
                } else {
                    format!("'{}'", literal.replace('\'', "''"))
                }
            }
            DefaultValue::Now => "CURRENT_TIMESTAMP".to_owned(),
            DefaultValue::Uuid => "gen_random_uuid()".to_owned(),
            DefaultValue::DbGenerated(expression) => expression.clone(),
        }
    }

    fn inline_foreign_key(&self, fk: &ForeignKey) -> String {
        format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}){}",
            self.quote_list(&fk.columns),
            self.quote(&fk.referenced_table),
            self.quote_list(&fk.referenced_columns),
            match fk.on_delete_action {
                ForeignKeyAction::Cascade => " ON DELETE CASCADE",
                ForeignKeyAction::Restrict => " ON DELETE RESTRICT",
                ForeignKeyAction::SetNull => " ON DELETE SET NULL",
                ForeignKeyAction::SetDefault => " ON DELETE SET DEFAULT",
                ForeignKeyAction::NoAction => "",
            }
        )
    }
}

/// Numbers and booleans render unquoted, everything else is a string
/// literal.
fn literal_is_bare(literal: &str) -> bool {
    literal == "true"
        || literal == "false"
        || literal.parse::<i64>().is_ok()
        || literal.parse::<f64>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_describer::{ColumnType, PrimaryKey};
    use pretty_assertions::assert_eq;

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

    fn users_table() -> Table {
        let mut id = column("id", "INTEGER", true);
        id.auto_increment = true;

        let mut active = column("active", "BOOLEAN", true);
        active.default = Some(DefaultValue::Literal("true".to_owned()));

        Table {
            name: "users".to_owned(),
            columns: vec![id, column("email", "VARCHAR(255)", true), active],
            indexes: vec![Index {
                name: "users_email_key".to_owned(),
                columns: vec!["email".to_owned()],
                unique: true,
            }],
            foreign_keys: vec![],
            primary_key: Some(PrimaryKey {
                columns: vec!["id".to_owned()],
            }),
        }
    }

    #[test]
    fn create_table_sqlite() {
        let ddl = DdlRenderer::new(SqlFamily::Sqlite);
        assert_eq!(
            ddl.create_table(&users_table()),
            "CREATE TABLE `users` (\n    `id` INTEGER PRIMARY KEY AUTOINCREMENT,\n    `email` VARCHAR(255) NOT NULL,\n    `active` BOOLEAN NOT NULL DEFAULT true\n)"
        );
    }

    #[test]
    fn create_table_postgres_uses_serial() {
        let ddl = DdlRenderer::new(SqlFamily::Postgres);
        let rendered = ddl.create_table(&users_table());
        assert!(rendered.contains("\"id\" SERIAL PRIMARY KEY"), "{rendered}");
    }

    #[test]
    fn string_defaults_are_quoted_and_escaped() {
        let ddl = DdlRenderer::new(SqlFamily::Postgres);
        assert_eq!(
            ddl.render_default(&DefaultValue::Literal("it's".to_owned())),
            "'it''s'"
        );
        assert_eq!(ddl.render_default(&DefaultValue::Literal("42".to_owned())), "42");
        assert_eq!(ddl.render_default(&DefaultValue::Now), "CURRENT_TIMESTAMP");
    }

    #[test]
    fn rebuild_script_copies_shared_columns() {
        let ddl = DdlRenderer::new(SqlFamily::Sqlite);
        let current = users_table();

        let mut desired = users_table();
        desired.columns[1] = column("email", "TEXT", true);
        desired.columns.retain(|c| c.name != "active");

        let script = ddl.rebuild_table(&current, &desired);

        assert!(script.contains("CREATE TABLE `_dataflow_new_users`"), "{script}");
        assert!(
            script.contains("INSERT INTO `_dataflow_new_users` (`id`, `email`) SELECT `id`, `email` FROM `users`"),
            "{script}"
        );
        assert!(script.contains("DROP TABLE `users`"), "{script}");
        assert!(
            script.contains("ALTER TABLE `_dataflow_new_users` RENAME TO `users`"),
            "{script}"
        );
        assert!(script.contains("CREATE UNIQUE INDEX `users_email_key`"), "{script}");
    }
}
