//! The engine-level error surface.
//!
//! Every kind carries an identifier-stable code and a remediation hint.
//! Messages that might embed user data go through the sensitive-value mask
//! before they are logged.

use dataflow_sql::error::DatabaseConstraint;

#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("refusing bulk operation with an empty filter")]
    UnsafeBulkOperation,

    #[error("no active tenant; multi-tenant models need one")]
    TenantRequired,

    #[error("tenant `{0}` is not registered or not active")]
    TenantUnavailable(String),

    #[error("tenant `{0}` is still the active context of a running task")]
    TenantInUse(String),

    #[error("unknown model `{name}`; registered models: {}", available.join(", "))]
    UnknownModel { name: String, available: Vec<String> },

    #[error("unknown operation `{name}` for model `{model}`; available: {}", allowed.join(", "))]
    UnknownOperation {
        model: String,
        name: String,
        allowed: Vec<String>,
    },

    #[error("constraint violation: {constraint}")]
    ConstraintViolation { constraint: DatabaseConstraint },

    #[error("adapter fault: {0}")]
    AdapterFault(#[source] dataflow_sql::Error),

    #[error("{0}")]
    MigrationLockHeld(String),

    #[error("{0}")]
    MigrationAborted(String),

    #[error("manual recovery required; affected tables: {}", affected_tables.join(", "))]
    ManualRecoveryRequired { affected_tables: Vec<String> },

    #[error("cache backend fault: {0}")]
    CacheBackendFault(String),

    #[error("called from the wrong context: {0}")]
    WrongContext(String),

    #[error("workflow execution cancelled")]
    Cancelled,

    #[error("workflow error: {0}")]
    Workflow(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ErrorKind::Validation(message.into()).into()
    }

    pub fn invalid_filter(message: impl Into<String>) -> Self {
        ErrorKind::InvalidFilter(message.into()).into()
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal(message.into()).into()
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The identifier-stable code for this kind.
    pub fn code(&self) -> &'static str {
        match &self.kind {
            ErrorKind::Validation(_) => "DF1001",
            ErrorKind::InvalidFilter(_) => "DF1002",
            ErrorKind::UnsafeBulkOperation => "DF1003",
            ErrorKind::UnknownModel { .. } => "DF1004",
            ErrorKind::UnknownOperation { .. } => "DF1005",
            ErrorKind::TenantRequired => "DF2001",
            ErrorKind::TenantUnavailable(_) => "DF2002",
            ErrorKind::TenantInUse(_) => "DF2003",
            ErrorKind::AdapterFault(_) => "DF3001",
            ErrorKind::ConstraintViolation { .. } => "DF3002",
            ErrorKind::MigrationLockHeld(_) => "DF4001",
            ErrorKind::MigrationAborted(_) => "DF4002",
            ErrorKind::ManualRecoveryRequired { .. } => "DF4003",
            ErrorKind::CacheBackendFault(_) => "DF5001",
            ErrorKind::WrongContext(_) => "DF6001",
            ErrorKind::Cancelled => "DF6002",
            ErrorKind::Workflow(_) => "DF6003",
            ErrorKind::Internal(_) => "DF9001",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match &self.kind {
            ErrorKind::Validation(_) => Some("fix the model or parameter declaration and retry"),
            ErrorKind::InvalidFilter(_) => {
                Some("check operator names, arities and field names in the filter document")
            }
            ErrorKind::UnsafeBulkOperation => {
                Some("pass safe_mode=false together with confirmed=true to affect every row")
            }
            ErrorKind::TenantRequired => {
                Some("enter a tenant scope with switch()/scope() before running this operation")
            }
            ErrorKind::TenantUnavailable(_) => Some("register or activate the tenant first"),
            ErrorKind::TenantInUse(_) => Some("wait for tasks using this tenant to finish"),
            ErrorKind::UnknownModel { .. } => Some("register the model before referencing it"),
            ErrorKind::UnknownOperation { .. } => None,
            ErrorKind::AdapterFault(_) => Some("the call may succeed on retry if the fault is transient"),
            ErrorKind::ConstraintViolation { .. } => None,
            ErrorKind::MigrationLockHeld(_) => {
                Some("wait for the running migration, or force-release a stale lock")
            }
            ErrorKind::MigrationAborted(_) => None,
            ErrorKind::ManualRecoveryRequired { .. } => {
                Some("apply the remaining reverse statements by hand, then verify the schema")
            }
            ErrorKind::CacheBackendFault(_) => Some("reads continue uncached until the backend recovers"),
            ErrorKind::WrongContext(_) => None,
            ErrorKind::Cancelled => None,
            ErrorKind::Workflow(_) => None,
            ErrorKind::Internal(_) => Some("this is a bug; please report it"),
        }
    }

    /// The structured failure envelope callers see.
    pub fn to_envelope(&self) -> serde_json::Value {
        let data = match &self.kind {
            ErrorKind::InvalidFilter(_) | ErrorKind::Workflow(_) => serde_json::json!([]),
            _ => serde_json::json!(0),
        };

        serde_json::json!({
            "success": false,
            "error": {
                "kind": self.code(),
                "message": self.to_string(),
                "hint": self.hint(),
            },
            "data": data,
        })
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<dataflow_sql::Error> for Error {
    fn from(e: dataflow_sql::Error) -> Self {
        use dataflow_sql::ErrorKind as Sql;

        let kind = match e.kind() {
            Sql::UniqueConstraintViolation { constraint }
            | Sql::ForeignKeyConstraintViolation { constraint }
            | Sql::NullConstraintViolation { constraint } => ErrorKind::ConstraintViolation {
                constraint: constraint.clone(),
            },
            Sql::InvalidIdentifier { .. } | Sql::InvalidSavepointName(_) => {
                ErrorKind::Validation(e.to_string())
            }
            _ => ErrorKind::AdapterFault(e),
        };

        Self::new(kind)
    }
}

impl From<dataflow_model::ModelError> for Error {
    fn from(e: dataflow_model::ModelError) -> Self {
        Self::new(ErrorKind::Validation(e.to_string()))
    }
}

impl From<dataflow_migrate::MigrateError> for Error {
    fn from(e: dataflow_migrate::MigrateError) -> Self {
        use dataflow_migrate::MigrateError as M;

        let kind = match e {
            M::LockHeld { .. } => ErrorKind::MigrationLockHeld(e.to_string()),
            M::ManualRecoveryRequired {
                ref affected_tables, ..
            } => ErrorKind::ManualRecoveryRequired {
                affected_tables: affected_tables.clone(),
            },
            M::Sql(inner) => return inner.into(),
            other => ErrorKind::MigrationAborted(other.to_string()),
        };

        Self::new(kind)
    }
}
