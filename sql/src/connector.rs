//! Database connectors.
//!
//! [`Queryable`] is the executable surface every driver exposes. The native
//! connectors live in [`sqlite`] and [`postgres`]; other families plug in
//! through [`ExternalConnectorFactory`]. The document family is only a
//! boundary here, see [`DocumentAdapter`].

mod connection_info;
mod document;
mod external;
mod postgres;
mod queryable;
mod result_set;
mod sqlite;
mod transaction;

pub use connection_info::{ConnectionInfo, MysqlUrl, PostgresUrl, SqlFamily, SqliteParams};
pub use document::DocumentAdapter;
pub use external::ExternalConnectorFactory;
pub use postgres::PostgreSql;
pub use queryable::{ExecuteResult, IsolationLevel, Queryable, SqlConnection, TransactionCapable};
pub use result_set::{ResultRow, ResultSet};
pub use sqlite::Sqlite;
pub use transaction::Transaction;
