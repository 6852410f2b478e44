//! Workflow construction and execution.
//!
//! A workflow is a labeled DAG of operation nodes. Building freezes the
//! graph — unknown source nodes, unknown parameters and cycles all fail at
//! build time — and execution walks the frozen topological order (Kahn's
//! algorithm, ties broken by node id), threading each node's output into
//! its dependents through dot-path projections.

use crate::cache::QueryCache;
use crate::context::ExecutionContext;
use crate::filter::Filter;
use crate::nodes::handlers::OperationExecutor;
use crate::nodes::{self, Operation};
use crate::registry::ModelRegistry;
use crate::{Error, ErrorKind, Result};
use dataflow_sql::connector::Queryable;
use indexmap::IndexMap;
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Wires one value of a predecessor's output into a parameter, e.g.
/// `source: "create_user.data.id"` → `target_param: "id"`.
#[derive(Debug, Clone)]
pub struct Connection {
    pub source: String,
    pub target_param: String,
}

impl Connection {
    pub fn new(source: impl Into<String>, target_param: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target_param: target_param.into(),
        }
    }

    fn source_node(&self) -> &str {
        self.source.split('.').next().unwrap_or(&self.source)
    }
}

/// Per-node runtime parameters: `node_id → {param: value}`.
pub type RuntimeInputs = serde_json::Map<String, Json>;

#[derive(Debug, Clone)]
pub(crate) struct NodeSpec {
    pub model: String,
    pub operation: Operation,
    pub static_params: serde_json::Map<String, Json>,
    /// Parsed once at add_node time; never re-parsed at execution.
    pub filter: Option<Filter>,
    pub connections: Vec<Connection>,
}

/// A workflow under construction.
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    pub label: String,
    pub(crate) nodes: IndexMap<String, NodeSpec>,
    pub(crate) acting_user: Option<String>,
}

impl WorkflowBuilder {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            nodes: IndexMap::new(),
            acting_user: None,
        }
    }

    /// Records who is running this workflow; audit-logged models write it
    /// into their `created_by`/`updated_by` columns.
    pub fn act_as(mut self, user: impl Into<String>) -> Self {
        self.acting_user = Some(user.into());
        self
    }

    pub(crate) fn insert_node(&mut self, node_id: &str, spec: NodeSpec) -> Result<()> {
        dataflow_sql::validate::check_identifier(node_id)
            .map_err(|e| Error::validation(format!("invalid node id: {e}")))?;

        if self.nodes.contains_key(node_id) {
            return Err(Error::validation(format!(
                "workflow `{}` already has a node `{node_id}`",
                self.label
            )));
        }

        self.nodes.insert(node_id.to_owned(), spec);
        Ok(())
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }
}

/// A frozen, validated workflow.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub label: String,
    pub(crate) nodes: IndexMap<String, NodeSpec>,
    pub(crate) order: Vec<String>,
    pub(crate) acting_user: Option<String>,
}

impl Workflow {
    /// Validates edges and parameters against the registry, then computes
    /// the deterministic execution order.
    pub(crate) fn freeze(builder: WorkflowBuilder, registry: &ModelRegistry) -> Result<Self> {
        for (node_id, spec) in &builder.nodes {
            let model = registry.get(&spec.model)?;
            let descriptor = nodes::describe(&model, spec.operation);

            for connection in &spec.connections {
                let source = connection.source_node();
                if !builder.nodes.contains_key(source) {
                    return Err(Error::new(ErrorKind::Workflow(format!(
                        "node `{node_id}` consumes `{}`, but there is no node `{source}`",
                        connection.source
                    ))));
                }
                if source == node_id {
                    return Err(Error::new(ErrorKind::Workflow(format!(
                        "node `{node_id}` cannot consume its own output"
                    ))));
                }

                if !descriptor.inputs.iter().any(|i| i.name == connection.target_param) {
                    return Err(Error::new(ErrorKind::Workflow(format!(
                        "`{}.{}` has no parameter `{}` for node `{node_id}` to bind",
                        spec.model, spec.operation, connection.target_param
                    ))));
                }
            }
        }

        let order = topological_order(&builder.nodes)?;

        Ok(Self {
            label: builder.label,
            nodes: builder.nodes,
            order,
            acting_user: builder.acting_user,
        })
    }

    pub fn execution_order(&self) -> &[String] {
        &self.order
    }
}

/// Kahn's algorithm with lexicographic tie-break on node id.
fn topological_order(nodes: &IndexMap<String, NodeSpec>) -> Result<Vec<String>> {
    let mut incoming: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for id in nodes.keys() {
        incoming.entry(id).or_default();
        outgoing.entry(id).or_default();
    }

    for (id, spec) in nodes {
        for connection in &spec.connections {
            let source = connection.source_node();
            incoming.get_mut(id.as_str()).expect("registered").insert(source);
            outgoing.get_mut(source).expect("validated in freeze").insert(id);
        }
    }

    let mut ready: BTreeSet<&str> = incoming
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(id, _)| *id)
        .collect();
    let mut order: Vec<String> = Vec::with_capacity(nodes.len());

    while !ready.is_empty() {
        let next = *ready.iter().next().expect("checked non-empty");
        ready.remove(next);
        order.push(next.to_owned());

        let dependents = outgoing.get(next).cloned().unwrap_or_default();
        for dependent in dependents {
            let deps = incoming.get_mut(dependent).expect("registered");
            deps.remove(next);
            if deps.is_empty() {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck: Vec<&str> = nodes
            .keys()
            .map(String::as_str)
            .filter(|id| !order.iter().any(|o| o == id))
            .collect();
        return Err(Error::new(ErrorKind::Workflow(format!(
            "workflow has a cycle involving: {}",
            stuck.join(", ")
        ))));
    }

    Ok(order)
}

/// A cooperative cancellation signal. Cancelling interrupts the node the
/// runtime is suspended on and fails the run; the engine rolls back any
/// transaction it opened for the workflow.
#[derive(Clone, Default)]
pub struct WorkflowCancellation {
    cancelled: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl WorkflowCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Runs the workflow's nodes in order against one connection.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run(
    workflow: &Workflow,
    registry: &ModelRegistry,
    conn: &dyn Queryable,
    cache: &dyn QueryCache,
    ctx: &ExecutionContext,
    runtime_inputs: Option<&RuntimeInputs>,
    cancellation: Option<&WorkflowCancellation>,
    bulk_batch_size: usize,
) -> Result<IndexMap<String, Json>> {
    let mut results: IndexMap<String, Json> = IndexMap::with_capacity(workflow.order.len());

    for node_id in &workflow.order {
        if cancellation.map(WorkflowCancellation::is_cancelled).unwrap_or(false) {
            return Err(Error::new(ErrorKind::Cancelled));
        }

        let spec = &workflow.nodes[node_id];
        let model = registry.get(&spec.model)?;
        let descriptor = nodes::describe(&model, spec.operation);

        // Input resolution: static params, then runtime params, then
        // edge-produced values; later sources win.
        let mut merged = spec.static_params.clone();

        if let Some(inputs) = runtime_inputs.and_then(|all| all.get(node_id.as_str())) {
            let object = inputs.as_object().ok_or_else(|| {
                Error::validation(format!("runtime inputs for `{node_id}` must be an object"))
            })?;
            for (key, value) in object {
                merged.insert(key.clone(), value.clone());
            }
        }

        for connection in &spec.connections {
            let value = resolve_path(&results, &connection.source).ok_or_else(|| {
                Error::new(ErrorKind::Workflow(format!(
                    "node `{node_id}` consumes `{}`, which produced no value",
                    connection.source
                )))
            })?;
            merged.insert(connection.target_param.clone(), value);
        }

        merged.insert("_node_id".to_owned(), Json::String(node_id.clone()));

        let validated = nodes::validate_params(&descriptor, &merged)?;

        let executor = OperationExecutor {
            model: &model,
            conn,
            cache,
            ctx,
            bulk_batch_size,
        };

        let output = match cancellation {
            Some(signal) => {
                tokio::select! {
                    biased;
                    _ = signal.wait() => return Err(Error::new(ErrorKind::Cancelled)),
                    output = executor.execute(spec.operation, &validated, spec.filter.as_ref()) => output?,
                }
            }
            None => executor.execute(spec.operation, &validated, spec.filter.as_ref()).await?,
        };

        results.insert(node_id.clone(), output.to_json());
    }

    Ok(results)
}

/// Projects a dot-path (`node.data.0.id`) into the result map.
fn resolve_path(results: &IndexMap<String, Json>, path: &str) -> Option<Json> {
    let mut segments = path.split('.');
    let node = segments.next()?;
    let mut current = results.get(node)?;

    for segment in segments {
        current = match current {
            Json::Object(map) => map.get(segment)?,
            Json::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current.clone())
}
