//! The per-execution context handed to every operation handler.

/// Snapshot of ambient state taken when a workflow starts executing. This —
/// not any global — is what flows into tenant predicates and audit columns,
/// so concurrently running workflows never see each other's context.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// The active tenant at execution start, if any.
    pub tenant: Option<String>,
    /// The acting user recorded in audit columns.
    pub user: Option<String>,
    /// Unique id of this workflow run.
    pub run_id: String,
}

impl ExecutionContext {
    pub fn new(tenant: Option<String>, user: Option<String>) -> Self {
        Self {
            tenant,
            user,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}
