use super::{ConnectionInfo, SqlConnection, SqlFamily};
use crate::Result;
use async_trait::async_trait;

/// The seam for database families without a native driver in this crate.
///
/// A factory yields fully capable [`SqlConnection`]s; the pool treats them
/// exactly like native ones. This is how MySQL execution (and any
/// out-of-tree driver) plugs in: the dialect is rendered here, the wire
/// protocol is the factory's business.
#[async_trait]
pub trait ExternalConnectorFactory: Send + Sync {
    /// The dialect the produced connections speak.
    fn sql_family(&self) -> SqlFamily;

    async fn connect(&self, info: &ConnectionInfo) -> Result<Box<dyn SqlConnection + Send + Sync>>;
}
