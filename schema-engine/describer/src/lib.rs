//! Introspection of live database schemas.
//!
//! [`describe`] reads the catalog of a connected database into a
//! [`SqlSchema`] — the same shape the migration calculator produces from
//! declared models, so the two sides can be diffed symmetrically.

mod postgres;
mod sqlite;

use dataflow_sql::connector::{Queryable, SqlFamily};
use dataflow_sql::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Result<T> = std::result::Result<T, Error>;

/// Reads the live schema of the connected database.
pub async fn describe(conn: &dyn Queryable) -> Result<SqlSchema> {
    match conn.sql_family() {
        SqlFamily::Sqlite => sqlite::describe(conn).await,
        SqlFamily::Postgres => postgres::describe(conn).await,
        SqlFamily::Mysql => Err(Error::new(ErrorKind::UnsupportedConnector(
            "schema introspection for mysql arrives with its external connector".to_owned(),
        ))),
    }
}

/// A snapshot of a database schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SqlSchema {
    pub tables: Vec<Table>,
    pub views: Vec<View>,
}

impl SqlSchema {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// A stable fingerprint of the whole schema. Two schemas with the same
    /// tables, columns, indexes and foreign keys have the same checksum.
    pub fn checksum(&self) -> String {
        let mut normalized = self.clone();
        normalized.tables.sort_by(|a, b| a.name.cmp(&b.name));
        normalized.views.sort_by(|a, b| a.name.cmp(&b.name));

        let serialized =
            serde_json::to_string(&normalized).expect("schema serialization cannot fail");

        hex::encode(Sha256::digest(serialized.as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub indexes: Vec<Index>,
    pub foreign_keys: Vec<ForeignKey>,
    pub primary_key: Option<PrimaryKey>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// The ordered (name, family, arity) triple of every column; tables with
    /// equal signatures are rename candidates.
    pub fn column_signature(&self) -> Vec<(ColumnTypeFamily, ColumnArity)> {
        self.columns.iter().map(|c| (c.tpe.family.clone(), c.tpe.arity)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub name: String,
    pub definition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub tpe: ColumnType,
    pub default: Option<DefaultValue>,
    pub auto_increment: bool,
}

impl Column {
    pub fn is_required(&self) -> bool {
        self.tpe.arity == ColumnArity::Required
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnType {
    pub family: ColumnTypeFamily,
    pub arity: ColumnArity,
    /// The database's own spelling, e.g. `character varying(255)`.
    pub full_data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnTypeFamily {
    Int,
    BigInt,
    Float,
    Decimal,
    Boolean,
    String,
    DateTime,
    Date,
    Uuid,
    Json,
    Binary,
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnArity {
    Required,
    Nullable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DefaultValue {
    /// A plain literal, stored in its textual form.
    Literal(String),
    /// The current timestamp at insert time.
    Now,
    /// A generated UUID.
    Uuid,
    /// Anything else the database computes.
    DbGenerated(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub constraint_name: Option<String>,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub on_delete_action: ForeignKeyAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForeignKeyAction {
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

/// Normalizes a SQL type name to its family. Used on both the introspection
/// side and the calculator side so the two agree on spelling variants.
pub fn family_from_sql_type(raw: &str) -> ColumnTypeFamily {
    let upper = raw.trim().to_ascii_uppercase();
    let base = upper.split('(').next().unwrap_or(&upper).trim().to_owned();

    match base.as_str() {
        "INT" | "INTEGER" | "SMALLINT" | "INT2" | "INT4" | "MEDIUMINT" => ColumnTypeFamily::Int,
        "BIGINT" | "INT8" | "BIGSERIAL" | "SERIAL8" => ColumnTypeFamily::BigInt,
        "REAL" | "FLOAT" | "DOUBLE" | "DOUBLE PRECISION" | "FLOAT4" | "FLOAT8" => {
            ColumnTypeFamily::Float
        }
        "DECIMAL" | "NUMERIC" => ColumnTypeFamily::Decimal,
        "BOOL" | "BOOLEAN" => ColumnTypeFamily::Boolean,
        "TEXT" | "VARCHAR" | "CHARACTER VARYING" | "CHAR" | "CHARACTER" | "NAME" | "CLOB" => {
            ColumnTypeFamily::String
        }
        "DATETIME" | "TIMESTAMP" | "TIMESTAMPTZ" | "TIMESTAMP WITHOUT TIME ZONE"
        | "TIMESTAMP WITH TIME ZONE" => ColumnTypeFamily::DateTime,
        "DATE" => ColumnTypeFamily::Date,
        "UUID" => ColumnTypeFamily::Uuid,
        "JSON" | "JSONB" => ColumnTypeFamily::Json,
        "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" | "LONGBLOB" => ColumnTypeFamily::Binary,
        _ => ColumnTypeFamily::Unsupported(raw.to_owned()),
    }
}
