//! Declarative model descriptors.
//!
//! A [`ModelDescriptor`] is the user-facing declaration the engine registers:
//! named fields over a closed type set, a primary key, and behavior flags.
//! Validation happens here, eagerly — an identifier that would not survive
//! SQL generation is a registration error, never a runtime one.

use dataflow_sql::validate::{check_identifier, is_safe_default_literal};
use dataflow_value::ValueType;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// The closed set of declarable field types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Int32,
    Int64,
    Float64,
    /// Bounded string; unbounded when no length is given.
    String(Option<u32>),
    Text,
    Bool,
    Bytes,
    Timestamp,
    Date,
    Uuid,
    Json,
    Decimal(u32, u32),
    /// A fixed-dimension vector, stored as its JSON encoding.
    Vector(u32),
}

impl FieldType {
    /// The runtime value family carrying this field.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Int32 => ValueType::Int32,
            Self::Int64 => ValueType::Int64,
            Self::Float64 => ValueType::Float,
            Self::String(_) | Self::Text => ValueType::Text,
            Self::Bool => ValueType::Boolean,
            Self::Bytes => ValueType::Bytes,
            Self::Timestamp => ValueType::DateTime,
            Self::Date => ValueType::Date,
            Self::Uuid => ValueType::Uuid,
            Self::Json => ValueType::Json,
            Self::Decimal(_, _) => ValueType::Numeric,
            Self::Vector(_) => ValueType::Array,
        }
    }
}

/// Function tokens a default may name instead of a literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionToken {
    Now,
    CurrentTimestamp,
    Uuid,
}

impl FunctionToken {
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "now" => Some(Self::Now),
            "current_timestamp" => Some(Self::CurrentTimestamp),
            "uuid" => Some(Self::Uuid),
            _ => None,
        }
    }
}

/// A field's declared default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DefaultSpec {
    Literal(serde_json::Value),
    Function(FunctionToken),
}

/// A declared validation predicate, checked on input before SQL is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValidator {
    MinLength(u32),
    MaxLength(u32),
    Min(f64),
    Max(f64),
    Pattern(String),
}

/// A foreign-key reference to `model.field`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub model: String,
    pub field: String,
    pub on_delete_cascade: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub tpe: FieldType,
    pub nullable: bool,
    pub default: Option<DefaultSpec>,
    pub unique: bool,
    pub indexed: bool,
    pub auto_increment: bool,
    pub references: Option<ForeignKeyRef>,
    pub validators: Vec<FieldValidator>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, tpe: FieldType) -> Self {
        Self {
            name: name.into(),
            tpe,
            nullable: false,
            default: None,
            unique: false,
            indexed: false,
            auto_increment: false,
            references: None,
            validators: Vec::new(),
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn default_literal(mut self, value: serde_json::Value) -> Self {
        self.default = Some(DefaultSpec::Literal(value));
        self
    }

    pub fn default_function(mut self, token: FunctionToken) -> Self {
        self.default = Some(DefaultSpec::Function(token));
        self
    }

    pub fn references(mut self, model: impl Into<String>, field: impl Into<String>) -> Self {
        self.references = Some(ForeignKeyRef {
            model: model.into(),
            field: field.into(),
            on_delete_cascade: false,
        });
        self
    }

    pub fn references_cascade(mut self, model: impl Into<String>, field: impl Into<String>) -> Self {
        self.references = Some(ForeignKeyRef {
            model: model.into(),
            field: field.into(),
            on_delete_cascade: true,
        });
        self
    }

    pub fn validator(mut self, validator: FieldValidator) -> Self {
        self.validators.push(validator);
        self
    }
}

/// A secondary index declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Per-model behavior flags.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Overrides the table name; defaults to the model name.
    pub table_name: Option<String>,
    pub soft_delete: bool,
    pub multi_tenant: bool,
    pub audit_log: bool,
    pub versioned: bool,
    pub indexes: Vec<IndexSpec>,
    pub unique_constraints: Vec<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid identifier in model `{model}`: {source}")]
    InvalidIdentifier {
        model: String,
        #[source]
        source: dataflow_sql::Error,
    },

    #[error("model `{model}` declares field `{field}` twice")]
    DuplicateField { model: String, field: String },

    #[error("model `{model}` has no field `{field}` to use as its primary key")]
    UnknownPrimaryKey { model: String, field: String },

    #[error("field `{model}.{field}` is reserved by the `{flag}` config flag")]
    ReservedField {
        model: String,
        field: String,
        flag: &'static str,
    },

    #[error("default for `{model}.{field}` is not a safe literal")]
    UnsafeDefault { model: String, field: String },

    #[error("index on `{model}` names unknown column `{column}`")]
    UnknownIndexColumn { model: String, column: String },
}

/// A declared record type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    /// Declared fields in declaration order.
    pub fields: IndexMap<String, FieldDescriptor>,
    /// The primary-key field name. Defaults to an auto-added
    /// auto-incrementing `id`.
    pub primary_key: String,
    pub config: ModelConfig,
    #[serde(skip)]
    duplicate_fields: Vec<String>,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: IndexMap::new(),
            primary_key: "id".to_owned(),
            config: ModelConfig::default(),
            duplicate_fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        let name = field.name.clone();
        if self.fields.insert(name.clone(), field).is_some() {
            self.duplicate_fields.push(name);
        }
        self
    }

    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = field.into();
        self
    }

    pub fn config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn table_name(&self) -> &str {
        self.config.table_name.as_deref().unwrap_or(&self.name)
    }

    pub fn field_named(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    pub fn primary_key_field(&self) -> Option<&FieldDescriptor> {
        self.fields.get(&self.primary_key)
    }

    /// Columns implied by config flags, in the order they are appended to
    /// the table.
    pub fn implicit_fields(&self) -> Vec<FieldDescriptor> {
        let mut fields = Vec::new();

        if self.config.multi_tenant {
            fields.push(FieldDescriptor::new("tenant_id", FieldType::String(Some(63))).indexed());
        }

        if self.config.soft_delete {
            fields.push(FieldDescriptor::new("deleted_at", FieldType::Timestamp).nullable());
        }

        if self.config.audit_log {
            fields.push(
                FieldDescriptor::new("created_at", FieldType::Timestamp)
                    .default_function(FunctionToken::Now),
            );
            fields.push(
                FieldDescriptor::new("updated_at", FieldType::Timestamp)
                    .default_function(FunctionToken::Now),
            );
            fields.push(FieldDescriptor::new("created_by", FieldType::String(Some(63))).nullable());
            fields.push(FieldDescriptor::new("updated_by", FieldType::String(Some(63))).nullable());
        }

        if self.config.versioned {
            fields.push(
                FieldDescriptor::new("version", FieldType::Int64)
                    .default_literal(serde_json::json!(1)),
            );
        }

        fields
    }

    /// Declared plus implicit fields, the full column set of the table.
    pub fn all_fields(&self) -> Vec<FieldDescriptor> {
        let mut fields: Vec<FieldDescriptor> = self.fields.values().cloned().collect();
        fields.extend(self.implicit_fields());
        fields
    }

    /// Validates identifiers, defaults, the primary key and index
    /// references. Adds the default `id` primary key when the model does
    /// not declare one.
    pub fn validate(&mut self) -> Result<(), ModelError> {
        if let Some(duplicate) = self.duplicate_fields.first() {
            return Err(ModelError::DuplicateField {
                model: self.name.clone(),
                field: duplicate.clone(),
            });
        }

        check_identifier(&self.name).map_err(|source| ModelError::InvalidIdentifier {
            model: self.name.clone(),
            source,
        })?;
        check_identifier(self.table_name()).map_err(|source| ModelError::InvalidIdentifier {
            model: self.name.clone(),
            source,
        })?;

        // The default primary key materializes only if absent.
        if self.primary_key == "id" && !self.fields.contains_key("id") {
            let id = FieldDescriptor::new("id", FieldType::Int64).auto_increment();
            self.fields.shift_insert(0, "id".to_owned(), id);
        }

        for (flag, reserved) in [
            ("multi_tenant", self.config.multi_tenant.then_some("tenant_id")),
            ("soft_delete", self.config.soft_delete.then_some("deleted_at")),
            ("versioned", self.config.versioned.then_some("version")),
        ] {
            if let Some(reserved) = reserved {
                if self.fields.contains_key(reserved) {
                    return Err(ModelError::ReservedField {
                        model: self.name.clone(),
                        field: reserved.to_owned(),
                        flag,
                    });
                }
            }
        }

        if self.config.audit_log {
            for reserved in ["created_at", "updated_at", "created_by", "updated_by"] {
                if self.fields.contains_key(reserved) {
                    return Err(ModelError::ReservedField {
                        model: self.name.clone(),
                        field: reserved.to_owned(),
                        flag: "audit_log",
                    });
                }
            }
        }

        for field in self.fields.values() {
            check_identifier(&field.name).map_err(|source| ModelError::InvalidIdentifier {
                model: self.name.clone(),
                source,
            })?;

            if let Some(DefaultSpec::Literal(literal)) = &field.default {
                let rendered = match literal {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if !is_safe_default_literal(&rendered) {
                    return Err(ModelError::UnsafeDefault {
                        model: self.name.clone(),
                        field: field.name.clone(),
                    });
                }
            }
        }

        if !self.fields.contains_key(&self.primary_key) {
            return Err(ModelError::UnknownPrimaryKey {
                model: self.name.clone(),
                field: self.primary_key.clone(),
            });
        }

        let all = self.all_fields();
        for index in &self.config.indexes {
            for column in &index.columns {
                if !all.iter().any(|f| &f.name == column) {
                    return Err(ModelError::UnknownIndexColumn {
                        model: self.name.clone(),
                        column: column.clone(),
                    });
                }
            }
        }

        for columns in &self.config.unique_constraints {
            for column in columns {
                if !all.iter().any(|f| &f.name == column) {
                    return Err(ModelError::UnknownIndexColumn {
                        model: self.name.clone(),
                        column: column.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_model() -> ModelDescriptor {
        ModelDescriptor::new("User")
            .field(FieldDescriptor::new("email", FieldType::String(Some(255))).unique())
            .field(FieldDescriptor::new("active", FieldType::Bool).default_literal(serde_json::json!(true)))
    }

    #[test]
    fn default_primary_key_materializes_first() {
        let mut model = user_model();
        model.validate().unwrap();

        let first = model.fields.values().next().unwrap();
        assert_eq!(first.name, "id");
        assert_eq!(first.tpe, FieldType::Int64);
        assert!(first.auto_increment);
        assert_eq!(model.primary_key, "id");
    }

    #[test]
    fn declared_id_field_is_respected() {
        let mut model = ModelDescriptor::new("User")
            .field(FieldDescriptor::new("id", FieldType::Int32))
            .field(FieldDescriptor::new("email", FieldType::String(None)));
        model.validate().unwrap();

        assert_eq!(model.fields["id"].tpe, FieldType::Int32);
        assert!(!model.fields["id"].auto_increment);
    }

    #[test]
    fn reserved_field_collisions_are_errors() {
        let mut model = ModelDescriptor::new("Doc")
            .field(FieldDescriptor::new("tenant_id", FieldType::String(None)))
            .config(ModelConfig {
                multi_tenant: true,
                ..Default::default()
            });

        assert!(matches!(
            model.validate(),
            Err(ModelError::ReservedField { flag: "multi_tenant", .. })
        ));
    }

    #[test]
    fn invalid_identifiers_fail_at_validation() {
        let mut model =
            ModelDescriptor::new("User").field(FieldDescriptor::new("drop table", FieldType::Bool));
        assert!(model.validate().is_err());

        let mut model = ModelDescriptor::new("select");
        assert!(model.validate().is_err());
    }

    #[test]
    fn unsafe_default_literal_is_rejected() {
        let mut model = ModelDescriptor::new("User").field(
            FieldDescriptor::new("name", FieldType::Text)
                .default_literal(serde_json::json!("x'; DROP TABLE users; --")),
        );
        assert!(matches!(model.validate(), Err(ModelError::UnsafeDefault { .. })));
    }

    #[test]
    fn multi_tenant_models_grow_a_tenant_column() {
        let mut model = ModelDescriptor::new("Doc")
            .field(FieldDescriptor::new("title", FieldType::Text))
            .config(ModelConfig {
                multi_tenant: true,
                soft_delete: true,
                ..Default::default()
            });
        model.validate().unwrap();

        let all = model.all_fields();
        assert!(all.iter().any(|f| f.name == "tenant_id"));
        assert!(all.iter().any(|f| f.name == "deleted_at" && f.nullable));
    }

    #[test]
    fn index_on_unknown_column_is_rejected() {
        let mut model = ModelDescriptor::new("Doc")
            .field(FieldDescriptor::new("title", FieldType::Text))
            .config(ModelConfig {
                indexes: vec![IndexSpec {
                    columns: vec!["nope".to_owned()],
                    unique: false,
                }],
                ..Default::default()
            });

        assert!(matches!(
            model.validate(),
            Err(ModelError::UnknownIndexColumn { .. })
        ));
    }
}
