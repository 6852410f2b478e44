use super::*;
use dataflow_model::{FieldDescriptor, FieldType, ModelDescriptor};
use dataflow_sql::visitor::{Postgres, Visitor};
use pretty_assertions::assert_eq;
use serde_json::json;

fn user_model() -> ModelDescriptor {
    let mut model = ModelDescriptor::new("User")
        .field(FieldDescriptor::new("email", FieldType::String(Some(255))))
        .field(FieldDescriptor::new("status", FieldType::Text))
        .field(FieldDescriptor::new("age", FieldType::Int32).nullable())
        .field(FieldDescriptor::new("active", FieldType::Bool));
    model.validate().unwrap();
    model
}

fn sql_for(filter_doc: serde_json::Value) -> (String, Vec<Value>) {
    let model = user_model();
    let filter = Filter::parse(&filter_doc).unwrap();
    let conditions = filter.to_conditions(&model).unwrap();
    let select = dataflow_sql::ast::Select::from_table("User").so_that(conditions);
    Postgres::build(select).unwrap()
}

#[test]
fn empty_filter_is_explicit_match_all() {
    let filter = Filter::parse(&json!({})).unwrap();
    assert!(filter.is_match_all());

    let conditions = filter.to_conditions(&user_model()).unwrap();
    assert_eq!(conditions, dataflow_sql::ast::ConditionTree::NoCondition);
}

#[test]
fn ne_renders_positionally() {
    let (sql, params) = sql_for(json!({"status": {"$ne": "inactive"}}));
    assert_eq!(sql, r#"SELECT * FROM "User" WHERE "status" <> $1"#);
    assert_eq!(params, vec![Value::text("inactive")]);
}

#[test]
fn direct_equality_and_operator_forms_agree() {
    let (a, pa) = sql_for(json!({"status": "open"}));
    let (b, pb) = sql_for(json!({"status": {"$eq": "open"}}));
    assert_eq!(a, b);
    assert_eq!(pa, pb);
}

#[test]
fn null_equality_becomes_is_null() {
    let (sql, params) = sql_for(json!({"age": null}));
    assert_eq!(sql, r#"SELECT * FROM "User" WHERE "age" IS NULL"#);
    assert!(params.is_empty());
}

#[test]
fn logical_composition_nests() {
    let (sql, params) = sql_for(json!({
        "$or": [
            {"status": "new"},
            {"age": {"$gte": 18, "$lt": 65}}
        ]
    }));

    assert_eq!(
        sql,
        r#"SELECT * FROM "User" WHERE "status" = $1 OR ("age" >= $2 AND "age" < $3)"#
    );
    assert_eq!(params.len(), 3);
}

#[test]
fn in_coerces_to_field_type() {
    let (sql, params) = sql_for(json!({"age": {"$in": [18, 21]}}));
    assert_eq!(sql, r#"SELECT * FROM "User" WHERE "age" IN ($1, $2)"#);
    assert_eq!(params, vec![Value::int32(18), Value::int32(21)]);
}

#[test]
fn between_and_not() {
    let (sql, _) = sql_for(json!({"age": {"$between": [18, 65]}}));
    assert_eq!(sql, r#"SELECT * FROM "User" WHERE "age" BETWEEN $1 AND $2"#);

    let (sql, _) = sql_for(json!({"age": {"$not": {"$lt": 18}}}));
    assert_eq!(sql, r#"SELECT * FROM "User" WHERE NOT ("age" < $1)"#);
}

#[test]
fn exists_maps_to_null_checks() {
    let (sql, _) = sql_for(json!({"age": {"$exists": false}}));
    assert_eq!(sql, r#"SELECT * FROM "User" WHERE "age" IS NULL"#);

    let (sql, _) = sql_for(json!({"age": {"$exists": true}}));
    assert_eq!(sql, r#"SELECT * FROM "User" WHERE "age" IS NOT NULL"#);
}

#[test]
fn rejections() {
    // Unknown operator.
    assert!(Filter::parse(&json!({"age": {"$around": 5}})).is_err());
    // Unknown logical operator.
    assert!(Filter::parse(&json!({"$xor": []})).is_err());
    // Empty $in is an error, never a silent match-nothing.
    assert!(Filter::parse(&json!({"age": {"$in": []}})).is_err());
    // Empty logical arrays.
    assert!(Filter::parse(&json!({"$and": []})).is_err());
    // Wrong arity.
    assert!(Filter::parse(&json!({"age": {"$between": [1]}})).is_err());
    // Bad field identifier.
    assert!(Filter::parse(&json!({"age; DROP TABLE x": 1})).is_err());
    // Not an object.
    assert!(Filter::parse(&json!([1, 2])).is_err());

    // Unknown field caught at translation.
    let filter = Filter::parse(&json!({"nope": 1})).unwrap();
    assert!(filter.to_conditions(&user_model()).is_err());
}

#[test]
fn injection_payloads_stay_in_parameters() {
    let payload = "'; DROP TABLE x; --";
    let (sql, params) = sql_for(json!({"status": payload}));
    assert!(!sql.contains(payload));
    assert_eq!(params, vec![Value::text(payload)]);
}

#[test]
fn canonical_form_is_stable_and_order_preserving() {
    let doc = json!({"b": 1, "a": {"$gte": 2, "$lt": 9}});
    let first = Filter::parse(&doc).unwrap().canonical();
    let second = Filter::parse(&doc).unwrap().canonical();
    assert_eq!(first, second);
    // Insertion order is preserved, not alphabetized.
    assert!(first.find("\"b\"").unwrap() < first.find("\"a\"").unwrap());

    // Equality sugar normalizes to $eq, so both spellings share a fingerprint.
    let sugar = Filter::parse(&json!({"b": 1})).unwrap().canonical();
    let explicit = Filter::parse(&json!({"b": {"$eq": 1}})).unwrap().canonical();
    assert_eq!(sugar, explicit);
}

#[test]
fn in_memory_matching_reference_semantics() {
    let rows = vec![
        json!({"email": "a@x", "status": "open", "age": 20, "active": true}),
        json!({"email": "b@x", "status": "closed", "age": 40, "active": false}),
        json!({"email": "c@x", "status": "open", "age": null, "active": true}),
    ];

    let cases = vec![
        (json!({}), vec!["a@x", "b@x", "c@x"]),
        (json!({"status": "open"}), vec!["a@x", "c@x"]),
        (json!({"status": {"$ne": "open"}}), vec!["b@x"]),
        (json!({"age": {"$gte": 18, "$lt": 30}}), vec!["a@x"]),
        (json!({"age": null}), vec!["c@x"]),
        (json!({"age": {"$exists": true}}), vec!["a@x", "b@x"]),
        (json!({"$or": [{"age": {"$gt": 30}}, {"status": "open"}]}), vec!["a@x", "b@x", "c@x"]),
        (json!({"$nor": [{"status": "open"}]}), vec!["b@x"]),
        (json!({"email": {"$like": "_@x"}}), vec!["a@x", "b@x", "c@x"]),
        (json!({"email": {"$regex": "^a"}}), vec!["a@x"]),
        (json!({"age": {"$not": {"$lt": 30}}}), vec!["b@x", "c@x"]),
    ];

    for (doc, expected) in cases {
        let filter = Filter::parse(&doc).unwrap();
        let matched: Vec<&str> = rows
            .iter()
            .filter(|row| filter.matches(row.as_object().unwrap()))
            .map(|row| row["email"].as_str().unwrap())
            .collect();
        assert_eq!(matched, expected, "filter: {doc}");
    }
}
