//! An abstraction layer for the SQL databases DataFlow runs on.
//!
//! The crate splits into three floors:
//!
//! - [`ast`]: a builder-style SQL AST. Nothing in here renders text.
//! - [`visitor`]: dialect visitors turning an AST into a SQL string plus an
//!   ordered parameter list. This is the only place SQL text is produced.
//! - [`connector`]: the drivers. [`connector::Queryable`] is the executable
//!   surface; native connectors exist for SQLite and PostgreSQL, everything
//!   else arrives through [`connector::ExternalConnector`].
//!
//! Values never travel inside SQL strings. The visitors emit placeholders
//! and the connectors bind [`Value`]s positionally.

pub mod ast;
pub mod connector;
pub mod error;
pub mod pooled;
pub mod validate;
pub mod visitor;

pub use dataflow_value::{Value, ValueType};
pub use error::{Error, ErrorKind};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::ast::*;
    pub use crate::connector::{
        ConnectionInfo, ExecuteResult, IsolationLevel, Queryable, ResultRow, ResultSet, SqlFamily,
        Transaction, TransactionCapable,
    };
    pub use crate::visitor::Visitor;
    pub use crate::{Value, ValueType};
}
