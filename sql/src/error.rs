//! Error type shared by the SQL layer.

use std::fmt;

#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
    original_code: Option<String>,
    original_message: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            original_code: None,
            original_message: None,
        }
    }

    pub fn with_original(kind: ErrorKind, code: Option<String>, message: Option<String>) -> Self {
        Self {
            kind,
            original_code: code,
            original_message: message,
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The driver-native error code, when one was reported.
    pub fn original_code(&self) -> Option<&str> {
        self.original_code.as_deref()
    }

    pub fn original_message(&self) -> Option<&str> {
        self.original_message.as_deref()
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::UniqueConstraintViolation { .. }
                | ErrorKind::ForeignKeyConstraintViolation { .. }
                | ErrorKind::NullConstraintViolation { .. }
        )
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.kind, ErrorKind::ConnectionError(_) | ErrorKind::PoolTimeout)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// The column or constraint a violation points at, when the driver says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseConstraint {
    Fields(Vec<String>),
    Index(String),
    Unknown,
}

impl fmt::Display for DatabaseConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fields(fields) => write!(f, "fields: ({})", fields.join(", ")),
            Self::Index(index) => write!(f, "index: {index}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("error querying the database: {0}")]
    QueryError(String),

    #[error("unique constraint violation: {constraint}")]
    UniqueConstraintViolation { constraint: DatabaseConstraint },

    #[error("foreign key constraint violation: {constraint}")]
    ForeignKeyConstraintViolation { constraint: DatabaseConstraint },

    #[error("null constraint violation: {constraint}")]
    NullConstraintViolation { constraint: DatabaseConstraint },

    #[error("error opening a connection: {0}")]
    ConnectionError(String),

    #[error("timed out waiting for a connection from the pool")]
    PoolTimeout,

    #[error("the connection pool was bound to a scheduler context that has shut down")]
    ContextClosed,

    #[error("transaction already poisoned by a previous failure, roll back first")]
    TransactionPoisoned,

    #[error("transaction already committed or rolled back")]
    TransactionClosed,

    #[error("invalid database URL: {0}")]
    DatabaseUrlIsInvalid(String),

    #[error("invalid identifier `{name}`: {reason}")]
    InvalidIdentifier { name: String, reason: String },

    #[error("invalid savepoint name `{0}`")]
    InvalidSavepointName(String),

    #[error("no native driver for `{0}`; register an external connector for this family")]
    UnsupportedConnector(String),

    #[error("the `{0}` dialect cannot express this query: {1}")]
    UnsupportedByDialect(&'static str, String),

    #[error("could not convert value at column `{column}`: {reason}")]
    ConversionError { column: String, reason: String },

    #[error("expected exactly one row, the query returned {0}")]
    NotSingleRow(usize),

    #[error("value out of range: {0}")]
    ValueOutOfRange(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;

        match e {
            rusqlite::Error::SqliteFailure(ffi_error, Some(ref message)) => {
                let code = format!("{}", ffi_error.extended_code);
                match ffi_error.code {
                    ErrorCode::ConstraintViolation => {
                        let kind = sqlite_constraint_kind(message);
                        Error::with_original(kind, Some(code), Some(message.clone()))
                    }
                    _ => Error::with_original(
                        ErrorKind::QueryError(message.clone()),
                        Some(code),
                        Some(message.clone()),
                    ),
                }
            }
            other => Error::new(ErrorKind::QueryError(other.to_string())),
        }
    }
}

/// SQLite reports constraint failures in the message text, e.g.
/// `UNIQUE constraint failed: users.email`.
fn sqlite_constraint_kind(message: &str) -> ErrorKind {
    let fields_after = |prefix: &str| -> DatabaseConstraint {
        message
            .strip_prefix(prefix)
            .map(|rest| {
                let fields = rest
                    .split(", ")
                    .map(|qualified| qualified.rsplit('.').next().unwrap_or(qualified).to_owned())
                    .collect();
                DatabaseConstraint::Fields(fields)
            })
            .unwrap_or(DatabaseConstraint::Unknown)
    };

    if message.starts_with("UNIQUE constraint failed") {
        ErrorKind::UniqueConstraintViolation {
            constraint: fields_after("UNIQUE constraint failed: "),
        }
    } else if message.starts_with("NOT NULL constraint failed") {
        ErrorKind::NullConstraintViolation {
            constraint: fields_after("NOT NULL constraint failed: "),
        }
    } else if message.starts_with("FOREIGN KEY constraint failed") {
        ErrorKind::ForeignKeyConstraintViolation {
            constraint: DatabaseConstraint::Unknown,
        }
    } else {
        ErrorKind::QueryError(message.to_owned())
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(e: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::SqlState;

        let Some(db_error) = e.as_db_error() else {
            return Error::new(ErrorKind::ConnectionError(e.to_string()));
        };

        let code = db_error.code().code().to_owned();
        let message = db_error.message().to_owned();
        let constraint = db_error
            .column()
            .map(|c| DatabaseConstraint::Fields(vec![c.to_owned()]))
            .or_else(|| db_error.constraint().map(|c| DatabaseConstraint::Index(c.to_owned())))
            .unwrap_or(DatabaseConstraint::Unknown);

        let kind = match db_error.code() {
            s if *s == SqlState::UNIQUE_VIOLATION => ErrorKind::UniqueConstraintViolation { constraint },
            s if *s == SqlState::FOREIGN_KEY_VIOLATION => {
                ErrorKind::ForeignKeyConstraintViolation { constraint }
            }
            s if *s == SqlState::NOT_NULL_VIOLATION => ErrorKind::NullConstraintViolation { constraint },
            _ => ErrorKind::QueryError(message.clone()),
        };

        Error::with_original(kind, Some(code), Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_unique_violation_extracts_columns() {
        let kind = sqlite_constraint_kind("UNIQUE constraint failed: users.email, users.tenant_id");
        match kind {
            ErrorKind::UniqueConstraintViolation {
                constraint: DatabaseConstraint::Fields(fields),
            } => assert_eq!(fields, vec!["email".to_owned(), "tenant_id".to_owned()]),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn sqlite_fk_violation_has_no_column_info() {
        let kind = sqlite_constraint_kind("FOREIGN KEY constraint failed");
        assert!(matches!(
            kind,
            ErrorKind::ForeignKeyConstraintViolation {
                constraint: DatabaseConstraint::Unknown
            }
        ));
    }
}
