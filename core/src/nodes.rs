//! The node catalog.
//!
//! Every registered model materializes the same eleven operations, each with
//! a declared input and output schema. Parameters are validated against the
//! schema before a handler runs; the handlers themselves live in
//! [`handlers`].

pub(crate) mod handlers;

use crate::{Error, ErrorKind, Result};
use dataflow_model::ModelDescriptor;
use serde_json::Value as Json;

/// The fixed operation vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    List,
    Upsert,
    Count,
    BulkCreate,
    BulkUpdate,
    BulkDelete,
    BulkUpsert,
}

impl Operation {
    pub const ALL: [Operation; 11] = [
        Self::Create,
        Self::Read,
        Self::Update,
        Self::Delete,
        Self::List,
        Self::Upsert,
        Self::Count,
        Self::BulkCreate,
        Self::BulkUpdate,
        Self::BulkDelete,
        Self::BulkUpsert,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Upsert => "upsert",
            Self::Count => "count",
            Self::BulkCreate => "bulk_create",
            Self::BulkUpdate => "bulk_update",
            Self::BulkDelete => "bulk_delete",
            Self::BulkUpsert => "bulk_upsert",
        }
    }

    pub fn parse(model: &str, name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.name() == name)
            .ok_or_else(|| {
                Error::new(ErrorKind::UnknownOperation {
                    model: model.to_owned(),
                    name: name.to_owned(),
                    allowed: Self::ALL.iter().map(|op| op.name().to_owned()).collect(),
                })
            })
    }

    /// Reads go through the cache; writes invalidate it.
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::List | Self::Count)
    }

    /// The caller-facing alias for the affected-row count.
    pub fn rowcount_alias(self) -> Option<&'static str> {
        match self {
            Self::Create | Self::BulkCreate => Some("created"),
            Self::Update | Self::BulkUpdate => Some("updated"),
            Self::Delete | Self::BulkDelete => Some("deleted"),
            Self::Upsert | Self::BulkUpsert => Some("upserted"),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// A JSON object of field values.
    Object,
    /// An array of field-value objects.
    ObjectList,
    /// A filter document.
    Filter,
    /// An array of column names.
    Columns,
    /// An array of `"field"` / `"-field"` ordering keys.
    OrderBy,
    /// An array of primary-key values.
    ScalarList,
    Int,
    Bool,
    /// A single primary-key-shaped value.
    Scalar,
}

#[derive(Debug, Clone)]
pub struct ParamDescriptor {
    pub name: &'static str,
    pub tpe: ParamType,
    pub required: bool,
    pub default: Option<Json>,
    /// Values that end up inside SQL parameters (as opposed to knobs like
    /// `limit`); these are the ones the injection screens care about.
    pub injection_sensitive: bool,
}

impl ParamDescriptor {
    fn new(name: &'static str, tpe: ParamType) -> Self {
        Self {
            name,
            tpe,
            required: false,
            default: None,
            injection_sensitive: false,
        }
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn default_value(mut self, value: Json) -> Self {
        self.default = Some(value);
        self
    }

    fn sensitive(mut self) -> Self {
        self.injection_sensitive = true;
        self
    }
}

/// A catalog entry: one operation on one model, with its parameter schema.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub model: String,
    pub operation: Operation,
    pub inputs: Vec<ParamDescriptor>,
    pub outputs: Vec<&'static str>,
}

/// Builds the catalog entry for `(model, operation)`.
pub fn describe(model: &ModelDescriptor, operation: Operation) -> NodeDescriptor {
    use ParamType as P;

    let inputs = match operation {
        Operation::Create => vec![ParamDescriptor::new("fields", P::Object).required().sensitive()],
        Operation::Read => vec![
            ParamDescriptor::new("id", P::Scalar).sensitive(),
            ParamDescriptor::new("filter", P::Filter).sensitive(),
            ParamDescriptor::new("columns", P::Columns),
            ParamDescriptor::new("include_deleted", P::Bool).default_value(Json::Bool(false)),
        ],
        Operation::Update => vec![
            ParamDescriptor::new("id", P::Scalar).sensitive(),
            ParamDescriptor::new("filter", P::Filter).sensitive(),
            ParamDescriptor::new("fields", P::Object).required().sensitive(),
            ParamDescriptor::new("expected_version", P::Int),
        ],
        Operation::Delete => vec![
            ParamDescriptor::new("id", P::Scalar).sensitive(),
            ParamDescriptor::new("filter", P::Filter).sensitive(),
            ParamDescriptor::new("safe_mode", P::Bool).default_value(Json::Bool(true)),
            ParamDescriptor::new("confirmed", P::Bool).default_value(Json::Bool(false)),
        ],
        Operation::List => vec![
            ParamDescriptor::new("filter", P::Filter).sensitive(),
            ParamDescriptor::new("columns", P::Columns),
            ParamDescriptor::new("order_by", P::OrderBy),
            ParamDescriptor::new("limit", P::Int),
            ParamDescriptor::new("offset", P::Int),
            ParamDescriptor::new("include_deleted", P::Bool).default_value(Json::Bool(false)),
        ],
        Operation::Upsert => vec![
            ParamDescriptor::new("fields", P::Object).required().sensitive(),
            ParamDescriptor::new("conflict_on", P::Columns),
            ParamDescriptor::new("update_columns", P::Columns),
        ],
        Operation::Count => vec![
            ParamDescriptor::new("filter", P::Filter).sensitive(),
            ParamDescriptor::new("include_deleted", P::Bool).default_value(Json::Bool(false)),
        ],
        Operation::BulkCreate => vec![
            ParamDescriptor::new("records", P::ObjectList).required().sensitive(),
            ParamDescriptor::new("batch_size", P::Int),
        ],
        Operation::BulkUpdate => vec![
            ParamDescriptor::new("filter", P::Filter).sensitive(),
            ParamDescriptor::new("fields", P::Object).sensitive(),
            ParamDescriptor::new("records", P::ObjectList).sensitive(),
        ],
        Operation::BulkDelete => vec![
            ParamDescriptor::new("filter", P::Filter).sensitive(),
            ParamDescriptor::new("ids", P::ScalarList).sensitive(),
            ParamDescriptor::new("safe_mode", P::Bool).default_value(Json::Bool(true)),
            ParamDescriptor::new("confirmed", P::Bool).default_value(Json::Bool(false)),
        ],
        Operation::BulkUpsert => vec![
            ParamDescriptor::new("records", P::ObjectList).required().sensitive(),
            ParamDescriptor::new("conflict_on", P::Columns),
            ParamDescriptor::new("update_columns", P::Columns),
            ParamDescriptor::new("batch_size", P::Int),
        ],
    };

    let outputs = match operation {
        Operation::Create => vec!["data", "rows_affected", "created"],
        Operation::Read | Operation::List => vec!["data", "rows_affected"],
        Operation::Update | Operation::BulkUpdate => vec!["data", "rows_affected", "updated", "processed"],
        Operation::Delete | Operation::BulkDelete => vec!["data", "rows_affected", "deleted", "processed"],
        Operation::Upsert | Operation::BulkUpsert => vec!["data", "rows_affected", "upserted", "processed"],
        Operation::Count => vec!["data", "rows_affected"],
        Operation::BulkCreate => vec!["data", "rows_affected", "created", "processed"],
    };

    NodeDescriptor {
        model: model.name.clone(),
        operation,
        inputs,
        outputs,
    }
}

/// Validates a merged parameter map against the schema, filling defaults.
/// Framework-private keys (`_node_id` and friends) live in their own
/// underscore namespace and are never validated against user schemas.
pub fn validate_params(
    descriptor: &NodeDescriptor,
    params: &serde_json::Map<String, Json>,
) -> Result<serde_json::Map<String, Json>> {
    let mut validated = serde_json::Map::new();

    for (key, value) in params {
        if key.starts_with('_') {
            continue;
        }

        let Some(input) = descriptor.inputs.iter().find(|i| i.name == key.as_str()) else {
            return Err(Error::validation(format!(
                "`{}.{}` has no parameter `{key}`; declared parameters: {}",
                descriptor.model,
                descriptor.operation,
                descriptor.inputs.iter().map(|i| i.name).collect::<Vec<_>>().join(", ")
            )));
        };

        check_param_type(descriptor, input, value)?;
        validated.insert(key.clone(), value.clone());
    }

    for input in &descriptor.inputs {
        if validated.contains_key(input.name) {
            continue;
        }

        if let Some(default) = &input.default {
            validated.insert(input.name.to_owned(), default.clone());
        } else if input.required {
            return Err(Error::validation(format!(
                "`{}.{}` requires parameter `{}`",
                descriptor.model, descriptor.operation, input.name
            )));
        }
    }

    Ok(validated)
}

fn check_param_type(descriptor: &NodeDescriptor, input: &ParamDescriptor, value: &Json) -> Result<()> {
    let ok = match input.tpe {
        ParamType::Object | ParamType::Filter => value.is_object(),
        ParamType::ObjectList => {
            value.is_array() && value.as_array().unwrap().iter().all(Json::is_object)
        }
        ParamType::Columns | ParamType::OrderBy => {
            value.is_array() && value.as_array().unwrap().iter().all(Json::is_string)
        }
        ParamType::ScalarList => {
            value.is_array()
                && value
                    .as_array()
                    .unwrap()
                    .iter()
                    .all(|v| !v.is_array() && !v.is_object())
        }
        ParamType::Int => value.as_u64().is_some(),
        ParamType::Bool => value.is_boolean(),
        ParamType::Scalar => !value.is_array() && !value.is_object(),
    };

    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "parameter `{}` of `{}.{}` has the wrong shape (expected {:?})",
            input.name, descriptor.model, descriptor.operation, input.tpe
        )))
    }
}

/// The success envelope an operation hands back.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub data: Json,
    pub rows_affected: u64,
    pub extras: Vec<(&'static str, Json)>,
}

impl NodeOutput {
    pub fn new(data: Json, rows_affected: u64) -> Self {
        Self {
            data,
            rows_affected,
            extras: Vec::new(),
        }
    }

    pub fn with_extra(mut self, key: &'static str, value: Json) -> Self {
        self.extras.push((key, value));
        self
    }

    pub fn to_json(&self) -> Json {
        let mut map = serde_json::Map::new();
        map.insert("success".to_owned(), Json::Bool(true));
        map.insert("data".to_owned(), self.data.clone());
        map.insert("rows_affected".to_owned(), Json::from(self.rows_affected));
        for (key, value) in &self.extras {
            map.insert((*key).to_owned(), value.clone());
        }
        Json::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_model::{FieldDescriptor, FieldType};
    use serde_json::json;

    fn model() -> ModelDescriptor {
        let mut model =
            ModelDescriptor::new("User").field(FieldDescriptor::new("email", FieldType::Text));
        model.validate().unwrap();
        model
    }

    #[test]
    fn eleven_operations_with_fixed_names() {
        assert_eq!(Operation::ALL.len(), 11);
        assert_eq!(Operation::parse("User", "bulk_create").unwrap(), Operation::BulkCreate);

        let err = Operation::parse("User", "explode").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bulk_upsert"), "{message}");
        assert!(message.contains("create"), "{message}");
    }

    #[test]
    fn unknown_parameters_are_rejected_with_the_declared_set() {
        let descriptor = describe(&model(), Operation::List);
        let err = validate_params(&descriptor, json!({"fliter": {}}).as_object().unwrap()).unwrap_err();
        assert!(err.to_string().contains("filter"), "{err}");
    }

    #[test]
    fn defaults_fill_and_required_enforced() {
        let descriptor = describe(&model(), Operation::Delete);
        let validated = validate_params(&descriptor, json!({"id": 1}).as_object().unwrap()).unwrap();
        assert_eq!(validated["safe_mode"], json!(true));
        assert_eq!(validated["confirmed"], json!(false));

        let descriptor = describe(&model(), Operation::Create);
        assert!(validate_params(&descriptor, json!({}).as_object().unwrap()).is_err());
    }

    #[test]
    fn underscore_namespace_is_framework_private() {
        let descriptor = describe(&model(), Operation::List);
        let validated =
            validate_params(&descriptor, json!({"_node_id": "n1", "limit": 5}).as_object().unwrap())
                .unwrap();
        assert!(!validated.contains_key("_node_id"));
        assert_eq!(validated["limit"], json!(5));
    }

    #[test]
    fn wrong_shapes_are_validation_errors() {
        let descriptor = describe(&model(), Operation::List);
        assert!(validate_params(&descriptor, json!({"limit": "ten"}).as_object().unwrap()).is_err());
        assert!(validate_params(&descriptor, json!({"filter": []}).as_object().unwrap()).is_err());
        assert!(
            validate_params(&descriptor, json!({"columns": [1, 2]}).as_object().unwrap()).is_err()
        );
    }
}
