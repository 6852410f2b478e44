//! The operation handlers behind the node catalog.
//!
//! Each handler composes the same pipeline: validate and coerce inputs,
//! let the interceptor rewrite conditions and values, build the AST, hand
//! it to the connection, shape the result envelope. Reads consult the cache
//! first; every write bumps the model's cache generation.

use crate::cache::{fingerprint, QueryCache};
use crate::context::ExecutionContext;
use crate::filter::{coerce_json, Filter};
use crate::interceptor::{self, StatementKind};
use crate::nodes::{NodeOutput, Operation};
use crate::{Error, ErrorKind, Result};
use dataflow_model::{
    DefaultSpec, FieldDescriptor, FieldValidator, FunctionToken, ModelDescriptor,
};
use dataflow_sql::ast::{
    count_star, Column, Comparable, ConditionTree, Delete, Expression, Insert, OnConflict, Order,
    Select, Update,
};
use dataflow_sql::connector::Queryable;
use dataflow_value::Value;
use serde_json::Value as Json;

type JsonMap = serde_json::Map<String, Json>;

pub(crate) struct OperationExecutor<'a> {
    pub model: &'a ModelDescriptor,
    pub conn: &'a dyn Queryable,
    pub cache: &'a dyn QueryCache,
    pub ctx: &'a ExecutionContext,
    pub bulk_batch_size: usize,
}

impl OperationExecutor<'_> {
    pub async fn execute(
        &self,
        operation: Operation,
        params: &JsonMap,
        preparsed_filter: Option<&Filter>,
    ) -> Result<NodeOutput> {
        tracing::debug!(
            target: "dataflow::node",
            model = %self.model.name,
            operation = %operation,
            "executing operation"
        );

        let output = match operation {
            Operation::Create => self.create(params).await?,
            Operation::Read => self.read(params, preparsed_filter).await?,
            Operation::Update => self.update(params, preparsed_filter).await?,
            Operation::Delete => self.delete(params, preparsed_filter).await?,
            Operation::List => self.list(params, preparsed_filter).await?,
            Operation::Upsert => self.upsert(params).await?,
            Operation::Count => self.count(params, preparsed_filter).await?,
            Operation::BulkCreate => self.bulk_create(params).await?,
            Operation::BulkUpdate => self.bulk_update(params, preparsed_filter).await?,
            Operation::BulkDelete => self.bulk_delete(params, preparsed_filter).await?,
            Operation::BulkUpsert => self.bulk_upsert(params).await?,
        };

        if !operation.is_read() {
            self.invalidate_cache().await;
        }

        Ok(output)
    }

    fn table(&self) -> &str {
        self.model.table_name()
    }

    fn supports_returning(&self) -> bool {
        self.conn.sql_family().supports_returning()
    }

    async fn invalidate_cache(&self) {
        if let Err(e) = self.cache.invalidate_model(&self.model.name).await {
            tracing::warn!(
                target: "dataflow::core",
                model = %self.model.name,
                error = %e,
                "cache invalidation failed; entries expire by TTL instead"
            );
        }
    }

    /// Consults the cache, degrading backend faults to a miss.
    async fn cache_get(&self, key: &str) -> Option<Json> {
        match self.cache.get(&self.model.name, key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(
                    target: "dataflow::core",
                    error = %e,
                    "cache read failed; treating as miss"
                );
                None
            }
        }
    }

    async fn cache_put(&self, key: &str, payload: Json) {
        if let Err(e) = self.cache.put(&self.model.name, key, payload).await {
            tracing::warn!(target: "dataflow::core", error = %e, "cache write failed");
        }
    }

    // --- input shaping -----------------------------------------------------

    fn filter_from(&self, params: &JsonMap, preparsed: Option<&Filter>) -> Result<Option<Filter>> {
        if let Some(filter) = preparsed {
            return Ok(Some(filter.clone()));
        }
        match params.get("filter") {
            Some(document) => Filter::parse(document).map(Some),
            None => Ok(None),
        }
    }

    fn pk_field(&self) -> Result<FieldDescriptor> {
        self.model.primary_key_field().cloned().ok_or_else(|| {
            Error::internal(format!("model `{}` lost its primary key", self.model.name))
        })
    }

    fn pk_value(&self, json: &Json) -> Result<Value> {
        let pk = self.pk_field()?;
        coerce_json(json, pk.tpe.value_type(), &pk.name)
    }

    /// The caller-supplied row scope: primary key, filter, or match-all.
    fn scope_conditions(
        &self,
        params: &JsonMap,
        preparsed: Option<&Filter>,
    ) -> Result<(ConditionTree, bool)> {
        if let Some(id) = params.get("id") {
            let pk = self.pk_field()?;
            let condition = Column::new(pk.name.clone()).equals(self.pk_value(id)?);
            return Ok((condition.into(), false));
        }

        match self.filter_from(params, preparsed)? {
            Some(filter) => {
                let match_all = filter.is_match_all();
                Ok((filter.to_conditions(self.model)?, match_all))
            }
            None => Ok((ConditionTree::NoCondition, true)),
        }
    }

    /// Coerces a `fields` object into typed column values, in insertion
    /// order. With `apply_defaults`, absent declared fields materialize
    /// their defaults.
    fn coerce_fields(&self, object: &JsonMap, apply_defaults: bool) -> Result<Vec<(String, Value)>> {
        let implicit: Vec<String> = self
            .model
            .implicit_fields()
            .into_iter()
            .map(|f| f.name)
            .collect();

        let mut values = Vec::with_capacity(object.len());

        for (name, json) in object {
            if implicit.iter().any(|i| i == name) {
                return Err(Error::validation(format!(
                    "field `{}.{name}` is managed by the engine and cannot be set directly",
                    self.model.name
                )));
            }

            let Some(field) = self.model.field_named(name) else {
                return Err(Error::validation(format!(
                    "model `{}` has no field `{name}`",
                    self.model.name
                )));
            };

            run_validators(&self.model.name, field, json)?;
            values.push((name.clone(), coerce_json(json, field.tpe.value_type(), name)?));
        }

        if apply_defaults {
            for field in self.model.fields.values() {
                if field.auto_increment || object.contains_key(&field.name) {
                    continue;
                }

                match &field.default {
                    Some(spec) => values.push((field.name.clone(), default_value(spec, field)?)),
                    None if !field.nullable => {
                        return Err(Error::validation(format!(
                            "field `{}.{}` is required and has no default",
                            self.model.name, field.name
                        )));
                    }
                    None => {}
                }
            }
        }

        Ok(values)
    }

    fn all_column_names(&self) -> Vec<String> {
        self.model.all_fields().into_iter().map(|f| f.name).collect()
    }

    fn projection(&self, params: &JsonMap) -> Vec<String> {
        params
            .get("columns")
            .and_then(Json::as_array)
            .map(|columns| {
                columns
                    .iter()
                    .filter_map(Json::as_str)
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn bool_param(params: &JsonMap, name: &str) -> bool {
        params.get(name).and_then(Json::as_bool).unwrap_or(false)
    }

    // --- reads -------------------------------------------------------------

    async fn read(&self, params: &JsonMap, preparsed: Option<&Filter>) -> Result<NodeOutput> {
        if !params.contains_key("id") && !params.contains_key("filter") && preparsed.is_none() {
            return Err(Error::validation("read needs `id` or `filter`"));
        }

        let include_deleted = Self::bool_param(params, "include_deleted");
        let (scope, _) = self.scope_conditions(params, preparsed)?;
        let conditions = interceptor::read_conditions(
            self.model,
            self.ctx,
            StatementKind::SingleSelect,
            scope,
            include_deleted,
        )?;

        let columns = self.projection(params);
        let key = self.read_fingerprint("read", params, preparsed, &columns, "")?;

        if let Some(hit) = self.cache_get(&key).await {
            let found = !hit.is_null();
            return Ok(NodeOutput::new(hit, u64::from(found)));
        }

        let mut select = Select::from_table(self.table()).so_that(conditions).limit(1);
        for column in &columns {
            select = select.column(column.as_str());
        }

        let rows = self.conn.query(select.into()).await?;
        let data = rows.first().map(|row| row.to_json()).unwrap_or(Json::Null);
        let found = !data.is_null();

        self.cache_put(&key, data.clone()).await;
        Ok(NodeOutput::new(data, u64::from(found)))
    }

    async fn list(&self, params: &JsonMap, preparsed: Option<&Filter>) -> Result<NodeOutput> {
        let include_deleted = Self::bool_param(params, "include_deleted");
        let (scope, _) = self.scope_conditions(params, preparsed)?;
        let conditions = interceptor::read_conditions(
            self.model,
            self.ctx,
            StatementKind::ListSelect,
            scope,
            include_deleted,
        )?;

        let columns = self.projection(params);
        let order_keys: Vec<String> = params
            .get("order_by")
            .and_then(Json::as_array)
            .map(|keys| keys.iter().filter_map(Json::as_str).map(ToOwned::to_owned).collect())
            .unwrap_or_default();

        let key =
            self.read_fingerprint("list", params, preparsed, &columns, &order_keys.join(","))?;

        if let Some(hit) = self.cache_get(&key).await {
            let count = hit.as_array().map(|a| a.len() as u64).unwrap_or(0);
            return Ok(NodeOutput::new(hit, count));
        }

        let mut select = Select::from_table(self.table()).so_that(conditions);
        for column in &columns {
            select = select.column(column.as_str());
        }
        for key in &order_keys {
            select = match key.strip_prefix('-') {
                Some(field) => select.order_by((Column::new(field), Order::Desc)),
                None => select.order_by((Column::new(key.as_str()), Order::Asc)),
            };
        }
        if let Some(limit) = params.get("limit").and_then(Json::as_u64) {
            select = select.limit(limit);
        }
        if let Some(offset) = params.get("offset").and_then(Json::as_u64) {
            select = select.offset(offset);
        }

        let rows = self.conn.query(select.into()).await?;
        let count = rows.len() as u64;
        let data = Json::Array(rows.iter().map(|row| row.to_json()).collect());

        tracing::debug!(target: "dataflow::list", model = %self.model.name, rows = count, "list executed");

        self.cache_put(&key, data.clone()).await;
        Ok(NodeOutput::new(data, count))
    }

    async fn count(&self, params: &JsonMap, preparsed: Option<&Filter>) -> Result<NodeOutput> {
        let include_deleted = Self::bool_param(params, "include_deleted");
        let (scope, _) = self.scope_conditions(params, preparsed)?;
        let conditions = interceptor::read_conditions(
            self.model,
            self.ctx,
            StatementKind::Count,
            scope,
            include_deleted,
        )?;

        let key = self.read_fingerprint("count", params, preparsed, &[], "")?;
        if let Some(hit) = self.cache_get(&key).await {
            let count = hit.as_u64().unwrap_or(0);
            return Ok(NodeOutput::new(hit, count));
        }

        let select = Select::from_table(self.table()).value(count_star()).so_that(conditions);
        let rows = self.conn.query(select.into()).await?;
        let count = rows
            .first()
            .and_then(|row| row.at(0))
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0) as u64;

        let data = Json::from(count);
        self.cache_put(&key, data.clone()).await;
        Ok(NodeOutput::new(data, count))
    }

    fn read_fingerprint(
        &self,
        operation: &str,
        params: &JsonMap,
        preparsed: Option<&Filter>,
        columns: &[String],
        order_by: &str,
    ) -> Result<String> {
        let canonical = match self.filter_from(params, preparsed)? {
            Some(filter) => filter.canonical(),
            None => String::new(),
        };

        // Everything that shapes the result set participates, the active
        // tenant included — cache entries never cross tenant scopes.
        let mut parameters: Vec<String> = Vec::new();
        if let Some(tenant) = &self.ctx.tenant {
            parameters.push(format!("tenant={tenant}"));
        }
        if let Some(id) = params.get("id") {
            parameters.push(format!("id={id}"));
        }
        for knob in ["include_deleted", "limit", "offset"] {
            if let Some(value) = params.get(knob) {
                parameters.push(format!("{knob}={value}"));
            }
        }

        Ok(fingerprint(
            &self.model.name,
            operation,
            &canonical,
            &parameters,
            columns,
            order_by,
        ))
    }

    // --- writes ------------------------------------------------------------

    async fn create(&self, params: &JsonMap) -> Result<NodeOutput> {
        let fields_json = params
            .get("fields")
            .and_then(Json::as_object)
            .ok_or_else(|| Error::validation("create needs a `fields` object"))?;

        let mut fields = self.coerce_fields(fields_json, true)?;
        interceptor::insert_values(self.model, self.ctx, StatementKind::Insert, &mut fields)?;

        let mut insert = Insert::single_into(self.table());
        for (name, value) in fields {
            insert = insert.value(name, value);
        }
        let insert: Insert = insert.into();

        let (data, rows_affected) = if self.supports_returning() {
            let insert = insert.returning(self.all_column_names());
            let rows = self.conn.query(insert.into()).await?;
            let row = rows.first().map(|r| r.to_json()).unwrap_or(Json::Null);
            (row, 1)
        } else {
            let result = self.conn.execute(insert.into()).await?;
            let data = match result.last_insert_id {
                Some(id) => self.reload_by_pk(Value::int64(id)).await?,
                None => Json::Null,
            };
            (data, result.rows_affected)
        };

        Ok(NodeOutput::new(data, rows_affected).with_extra("created", Json::from(1)))
    }

    async fn reload_by_pk(&self, pk: Value) -> Result<Json> {
        let pk_name = self.pk_field()?.name;
        let select = Select::from_table(self.table())
            .so_that(Column::new(pk_name).equals(pk))
            .limit(1);
        let rows = self.conn.query(select.into()).await?;
        Ok(rows.first().map(|r| r.to_json()).unwrap_or(Json::Null))
    }

    async fn update(&self, params: &JsonMap, preparsed: Option<&Filter>) -> Result<NodeOutput> {
        if !params.contains_key("id") && !params.contains_key("filter") && preparsed.is_none() {
            return Err(Error::validation("update needs `id` or `filter`"));
        }

        let fields_json = params
            .get("fields")
            .and_then(Json::as_object)
            .ok_or_else(|| Error::validation("update needs a `fields` object"))?;

        let (scope, _) = self.scope_conditions(params, preparsed)?;
        let mut conditions =
            interceptor::write_conditions(self.model, self.ctx, StatementKind::Update, scope)?;

        let mut assignments: Vec<(String, Expression)> = self
            .coerce_fields(fields_json, false)?
            .into_iter()
            .map(|(name, value)| (name, Expression::from(value)))
            .collect();

        let mut implicit = Vec::new();
        interceptor::update_values(self.model, self.ctx, &mut implicit);
        assignments.extend(
            implicit
                .into_iter()
                .map(|(name, value)| (name, Expression::from(value))),
        );

        if self.model.config.versioned {
            match params.get("expected_version").and_then(Json::as_i64) {
                Some(expected) => {
                    conditions = conditions.and_also("version".equals(Value::int64(expected)));
                    assignments.push(("version".to_owned(), Value::int64(expected + 1).into()));
                }
                None => {
                    assignments.push((
                        "version".to_owned(),
                        Expression::column("version").plus(Value::int64(1i64)),
                    ));
                }
            }
        }

        let mut update = Update::table(self.table()).so_that(conditions);
        for (name, expression) in assignments {
            update = update.set(name, expression);
        }

        let result = self.conn.execute(update.into()).await?;

        if result.rows_affected == 0
            && self.model.config.versioned
            && params.contains_key("expected_version")
        {
            return Err(Error::new(ErrorKind::ConstraintViolation {
                constraint: dataflow_sql::error::DatabaseConstraint::Fields(vec!["version".to_owned()]),
            }));
        }

        Ok(NodeOutput::new(Json::from(result.rows_affected), result.rows_affected)
            .with_extra("updated", Json::from(result.rows_affected))
            .with_extra("processed", Json::from(result.rows_affected)))
    }

    async fn delete(&self, params: &JsonMap, preparsed: Option<&Filter>) -> Result<NodeOutput> {
        let (scope, match_all) = self.scope_conditions(params, preparsed)?;
        self.guard_unsafe_bulk(params, match_all)?;

        let rows_affected = self.run_delete(scope).await?;

        Ok(NodeOutput::new(Json::from(rows_affected), rows_affected)
            .with_extra("deleted", Json::from(rows_affected))
            .with_extra("processed", Json::from(rows_affected)))
    }

    /// Soft-delete models stamp `deleted_at`; everything else really deletes.
    async fn run_delete(&self, scope: ConditionTree) -> Result<u64> {
        let conditions =
            interceptor::write_conditions(self.model, self.ctx, StatementKind::Delete, scope)?;

        let result = if self.model.config.soft_delete {
            let update = Update::table(self.table())
                .set("deleted_at", Value::datetime(chrono::Utc::now()))
                .so_that(conditions);
            self.conn.execute(update.into()).await?
        } else {
            let delete = Delete::from_table(self.table()).so_that(conditions);
            self.conn.execute(delete.into()).await?
        };

        Ok(result.rows_affected)
    }

    /// An all-rows write needs the explicit two-flag confirmation.
    fn guard_unsafe_bulk(&self, params: &JsonMap, match_all: bool) -> Result<()> {
        if !match_all {
            return Ok(());
        }

        let safe_mode = params.get("safe_mode").and_then(Json::as_bool).unwrap_or(true);
        let confirmed = Self::bool_param(params, "confirmed");

        if safe_mode || !confirmed {
            return Err(Error::new(ErrorKind::UnsafeBulkOperation));
        }

        Ok(())
    }

    async fn upsert(&self, params: &JsonMap) -> Result<NodeOutput> {
        let fields_json = params
            .get("fields")
            .and_then(Json::as_object)
            .ok_or_else(|| Error::validation("upsert needs a `fields` object"))?;

        let mut fields = self.coerce_fields(fields_json, true)?;
        interceptor::insert_values(self.model, self.ctx, StatementKind::Upsert, &mut fields)?;

        let conflict_target = self.conflict_target(params)?;
        let update_set = self.upsert_assignments(params, &fields, &conflict_target);

        let mut insert = Insert::single_into(self.table());
        for (name, value) in fields {
            insert = insert.value(name, value);
        }
        let insert = Insert::from(insert).on_conflict(OnConflict::DoUpdate {
            target: conflict_target,
            set: update_set,
        });

        let (data, rows_affected) = if self.supports_returning() {
            let insert = insert.returning(self.all_column_names());
            let rows = self.conn.query(insert.into()).await?;
            (rows.first().map(|r| r.to_json()).unwrap_or(Json::Null), 1)
        } else {
            let result = self.conn.execute(insert.into()).await?;
            (Json::Null, result.rows_affected.min(1))
        };

        Ok(NodeOutput::new(data, rows_affected)
            .with_extra("upserted", Json::from(1))
            .with_extra("processed", Json::from(1)))
    }

    fn conflict_target(&self, params: &JsonMap) -> Result<Vec<String>> {
        match params.get("conflict_on").and_then(Json::as_array) {
            Some(columns) => {
                let target: Vec<String> = columns
                    .iter()
                    .filter_map(Json::as_str)
                    .map(ToOwned::to_owned)
                    .collect();
                for column in &target {
                    if self.model.field_named(column).is_none() {
                        return Err(Error::validation(format!(
                            "conflict target `{column}` is not a field of `{}`",
                            self.model.name
                        )));
                    }
                }
                Ok(target)
            }
            None => Ok(vec![self.pk_field()?.name]),
        }
    }

    /// The SET clause of the conflict branch: caller-chosen columns, or
    /// every inserted column that is not part of the conflict target.
    fn upsert_assignments(
        &self,
        params: &JsonMap,
        inserted: &[(String, Value)],
        conflict_target: &[String],
    ) -> Vec<(String, Expression)> {
        let chosen: Option<Vec<String>> = params
            .get("update_columns")
            .and_then(Json::as_array)
            .map(|cols| cols.iter().filter_map(Json::as_str).map(ToOwned::to_owned).collect());

        let mut assignments: Vec<(String, Expression)> = Vec::new();

        for (name, _) in inserted {
            let skip = conflict_target.contains(name)
                || name == "created_at"
                || name == "created_by"
                || chosen.as_ref().map(|c| !c.contains(name)).unwrap_or(false);

            if !skip {
                assignments.push((name.clone(), Expression::excluded(name.as_str())));
            }
        }

        if self.model.config.versioned {
            assignments.push((
                "version".to_owned(),
                Expression::column("version").plus(Value::int64(1i64)),
            ));
        }

        assignments
    }

    // --- bulk --------------------------------------------------------------

    fn records_param<'p>(&self, params: &'p JsonMap) -> Result<&'p Vec<Json>> {
        params
            .get("records")
            .and_then(Json::as_array)
            .ok_or_else(|| Error::validation("bulk operation needs a `records` array"))
    }

    /// Rows per statement: the configured batch size, shrunk to respect the
    /// dialect's bound-parameter ceiling.
    fn chunk_size(&self, params: &JsonMap, columns: usize) -> usize {
        let configured = params
            .get("batch_size")
            .and_then(Json::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.bulk_batch_size)
            .max(1);

        let by_params = self.conn.sql_family().max_bind_values() / columns.max(1);
        configured.min(by_params.max(1))
    }

    async fn bulk_create(&self, params: &JsonMap) -> Result<NodeOutput> {
        let records = self.records_param(params)?;
        if records.is_empty() {
            return Err(Error::validation("bulk_create needs at least one record"));
        }

        let mut coerced: Vec<Vec<(String, Value)>> = Vec::with_capacity(records.len());
        for record in records {
            let object = record
                .as_object()
                .ok_or_else(|| Error::validation("bulk_create records must be objects"))?;
            let mut fields = self.coerce_fields(object, true)?;
            interceptor::insert_values(self.model, self.ctx, StatementKind::BulkDml, &mut fields)?;
            coerced.push(fields);
        }

        // Multi-row inserts need one column set; take the union in
        // first-seen order and fill gaps with typed nulls.
        let mut columns: Vec<String> = Vec::new();
        for fields in &coerced {
            for (name, _) in fields {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }

        let all_fields = self.model.all_fields();
        let null_for = |name: &str| -> Value {
            all_fields
                .iter()
                .find(|f| f.name == name)
                .map(|f| Value::null_of(f.tpe.value_type()))
                .unwrap_or(Value::null_text())
        };

        let mut rows_affected = 0;
        for chunk in coerced.chunks(self.chunk_size(params, columns.len())) {
            let mut insert = Insert::multi_into(self.table(), columns.clone());
            for fields in chunk {
                let row: Vec<Expression> = columns
                    .iter()
                    .map(|column| {
                        fields
                            .iter()
                            .find(|(name, _)| name == column)
                            .map(|(_, value)| value.clone())
                            .unwrap_or_else(|| null_for(column))
                            .into()
                    })
                    .collect();
                insert = insert.values(row);
            }

            let result = self.conn.execute(Insert::from(insert).into()).await?;
            rows_affected += result.rows_affected;
        }

        Ok(NodeOutput::new(Json::from(rows_affected), rows_affected)
            .with_extra("created", Json::from(rows_affected))
            .with_extra("processed", Json::from(rows_affected)))
    }

    async fn bulk_update(&self, params: &JsonMap, preparsed: Option<&Filter>) -> Result<NodeOutput> {
        // Two shapes: (filter, fields) applies one change set to a scope —
        // the empty filter is a legitimate match-all here; (records) applies
        // per-row changes keyed by primary key.
        if let Some(records) = params.get("records").and_then(Json::as_array) {
            return self.bulk_update_records(records).await;
        }

        let fields_json = params
            .get("fields")
            .and_then(Json::as_object)
            .ok_or_else(|| Error::validation("bulk_update needs `fields` or `records`"))?;

        let (scope, _) = self.scope_conditions(params, preparsed)?;
        let conditions =
            interceptor::write_conditions(self.model, self.ctx, StatementKind::BulkDml, scope)?;

        let mut update = Update::table(self.table()).so_that(conditions);
        for (name, value) in self.coerce_fields(fields_json, false)? {
            update = update.set(name, value);
        }

        let mut implicit = Vec::new();
        interceptor::update_values(self.model, self.ctx, &mut implicit);
        for (name, value) in implicit {
            update = update.set(name, value);
        }

        let result = self.conn.execute(update.into()).await?;

        Ok(NodeOutput::new(Json::from(result.rows_affected), result.rows_affected)
            .with_extra("updated", Json::from(result.rows_affected))
            .with_extra("processed", Json::from(result.rows_affected)))
    }

    /// The per-row form. One distinct update shape with identical values
    /// compiles to a single statement over an IN-list; mixed shapes fall
    /// back to one statement per row.
    async fn bulk_update_records(&self, records: &[Json]) -> Result<NodeOutput> {
        let pk = self.pk_field()?;

        let mut parsed: Vec<(Value, JsonMap)> = Vec::with_capacity(records.len());
        for record in records {
            let object = record
                .as_object()
                .ok_or_else(|| Error::validation("bulk_update records must be objects"))?;
            let id = object.get(&pk.name).ok_or_else(|| {
                Error::validation(format!("bulk_update records need the `{}` key", pk.name))
            })?;

            let mut fields = object.clone();
            fields.remove(&pk.name);
            parsed.push((self.pk_value(id)?, fields));
        }

        if parsed.is_empty() {
            return Err(Error::validation("bulk_update needs at least one record"));
        }

        let first_shape = parsed[0].1.clone();
        let uniform = parsed.iter().all(|(_, fields)| *fields == first_shape);

        let rows_affected = if uniform {
            let ids: Vec<Value> = parsed.iter().map(|(id, _)| id.clone()).collect();
            let scope: ConditionTree = Column::new(pk.name.clone()).in_selection(ids).into();
            let conditions =
                interceptor::write_conditions(self.model, self.ctx, StatementKind::BulkDml, scope)?;

            let mut update = Update::table(self.table()).so_that(conditions);
            for (name, value) in self.coerce_fields(&first_shape, false)? {
                update = update.set(name, value);
            }
            let mut implicit = Vec::new();
            interceptor::update_values(self.model, self.ctx, &mut implicit);
            for (name, value) in implicit {
                update = update.set(name, value);
            }

            self.conn.execute(update.into()).await?.rows_affected
        } else {
            let mut total = 0;
            for (id, fields) in &parsed {
                let scope: ConditionTree = Column::new(pk.name.clone()).equals(id.clone()).into();
                let conditions = interceptor::write_conditions(
                    self.model,
                    self.ctx,
                    StatementKind::BulkDml,
                    scope,
                )?;

                let mut update = Update::table(self.table()).so_that(conditions);
                for (name, value) in self.coerce_fields(fields, false)? {
                    update = update.set(name, value);
                }
                let mut implicit = Vec::new();
                interceptor::update_values(self.model, self.ctx, &mut implicit);
                for (name, value) in implicit {
                    update = update.set(name, value);
                }

                total += self.conn.execute(update.into()).await?.rows_affected;
            }
            total
        };

        Ok(NodeOutput::new(Json::from(rows_affected), rows_affected)
            .with_extra("updated", Json::from(rows_affected))
            .with_extra("processed", Json::from(rows_affected)))
    }

    async fn bulk_delete(&self, params: &JsonMap, preparsed: Option<&Filter>) -> Result<NodeOutput> {
        let scope = if let Some(ids) = params.get("ids").and_then(Json::as_array) {
            if ids.is_empty() {
                return Err(Error::invalid_filter("bulk_delete got an empty `ids` list"));
            }
            let pk = self.pk_field()?;
            let values: Result<Vec<Value>> = ids.iter().map(|id| self.pk_value(id)).collect();
            ConditionTree::from(Column::new(pk.name).in_selection(values?))
        } else {
            let (scope, match_all) = self.scope_conditions(params, preparsed)?;
            self.guard_unsafe_bulk(params, match_all)?;
            scope
        };

        let rows_affected = self.run_delete(scope).await?;

        Ok(NodeOutput::new(Json::from(rows_affected), rows_affected)
            .with_extra("deleted", Json::from(rows_affected))
            .with_extra("processed", Json::from(rows_affected)))
    }

    async fn bulk_upsert(&self, params: &JsonMap) -> Result<NodeOutput> {
        let records = self.records_param(params)?;
        if records.is_empty() {
            return Err(Error::validation("bulk_upsert needs at least one record"));
        }

        let conflict_target = self.conflict_target(params)?;

        let mut coerced: Vec<Vec<(String, Value)>> = Vec::with_capacity(records.len());
        for record in records {
            let object = record
                .as_object()
                .ok_or_else(|| Error::validation("bulk_upsert records must be objects"))?;
            let mut fields = self.coerce_fields(object, true)?;
            interceptor::insert_values(self.model, self.ctx, StatementKind::BulkDml, &mut fields)?;
            coerced.push(fields);
        }

        let mut columns: Vec<String> = Vec::new();
        for fields in &coerced {
            for (name, _) in fields {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }

        let update_set: Vec<(String, Expression)> = {
            let inserted: Vec<(String, Value)> =
                columns.iter().map(|c| (c.clone(), Value::null_text())).collect();
            self.upsert_assignments(params, &inserted, &conflict_target)
        };

        let all_fields = self.model.all_fields();
        let null_for = |name: &str| -> Value {
            all_fields
                .iter()
                .find(|f| f.name == name)
                .map(|f| Value::null_of(f.tpe.value_type()))
                .unwrap_or(Value::null_text())
        };

        let mut rows_affected = 0;
        for chunk in coerced.chunks(self.chunk_size(params, columns.len())) {
            let mut insert = Insert::multi_into(self.table(), columns.clone());
            for fields in chunk {
                let row: Vec<Expression> = columns
                    .iter()
                    .map(|column| {
                        fields
                            .iter()
                            .find(|(name, _)| name == column)
                            .map(|(_, value)| value.clone())
                            .unwrap_or_else(|| null_for(column))
                            .into()
                    })
                    .collect();
                insert = insert.values(row);
            }

            let insert = Insert::from(insert).on_conflict(OnConflict::DoUpdate {
                target: conflict_target.clone(),
                set: update_set.clone(),
            });

            let result = self.conn.execute(insert.into()).await?;
            rows_affected += result.rows_affected;
        }

        let processed = records.len() as u64;
        Ok(NodeOutput::new(Json::from(rows_affected), rows_affected)
            .with_extra("upserted", Json::from(rows_affected))
            .with_extra("processed", Json::from(processed)))
    }
}

fn default_value(spec: &DefaultSpec, field: &FieldDescriptor) -> Result<Value> {
    match spec {
        DefaultSpec::Literal(json) => coerce_json(json, field.tpe.value_type(), &field.name),
        DefaultSpec::Function(FunctionToken::Now | FunctionToken::CurrentTimestamp) => {
            Ok(Value::datetime(chrono::Utc::now()))
        }
        DefaultSpec::Function(FunctionToken::Uuid) => Ok(Value::uuid(uuid::Uuid::new_v4())),
    }
}

fn run_validators(model: &str, field: &FieldDescriptor, value: &Json) -> Result<()> {
    for validator in &field.validators {
        let ok = match validator {
            FieldValidator::MinLength(n) => value
                .as_str()
                .map(|s| s.chars().count() >= *n as usize)
                .unwrap_or(true),
            FieldValidator::MaxLength(n) => value
                .as_str()
                .map(|s| s.chars().count() <= *n as usize)
                .unwrap_or(true),
            FieldValidator::Min(min) => value.as_f64().map(|v| v >= *min).unwrap_or(true),
            FieldValidator::Max(max) => value.as_f64().map(|v| v <= *max).unwrap_or(true),
            FieldValidator::Pattern(pattern) => match (value.as_str(), regex::Regex::new(pattern)) {
                (Some(s), Ok(re)) => re.is_match(s),
                _ => true,
            },
        };

        if !ok {
            return Err(Error::validation(format!(
                "value for `{model}.{}` fails {validator:?}",
                field.name
            )));
        }
    }

    Ok(())
}
