//! DataFlow: a model-driven database workflow framework.
//!
//! Declare record types as [`ModelDescriptor`]s, register them with a
//! [`DataFlow`] engine, and every model gains the same eleven operations —
//! create, read, update, delete, list, upsert, count and their bulk
//! variants. Operations compose into acyclic workflows executed in
//! dependency order against a pooled SQL backend.
//!
//! ```no_run
//! use dataflow::prelude::*;
//! use serde_json::json;
//!
//! # async fn demo() -> dataflow::Result<()> {
//! let engine = DataFlow::new("sqlite:///:memory:", EngineConfig::default())?;
//! engine.register_model(
//!     ModelDescriptor::new("User")
//!         .field(FieldDescriptor::new("email", FieldType::String(Some(255))).unique())
//!         .field(FieldDescriptor::new("active", FieldType::Bool).default_literal(json!(true))),
//! )?;
//! engine.initialize().await?;
//!
//! let mut wf = engine.create_workflow("signup");
//! engine.add_node(
//!     &mut wf,
//!     "User",
//!     "create",
//!     "create_user",
//!     json!({"fields": {"email": "a@example.com"}}),
//!     None,
//! )?;
//! let (results, _run_id) = engine.execute_workflow(wf, None).await?;
//! assert!(results["create_user"]["success"].as_bool().unwrap());
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod context;
mod engine;
mod error;
mod filter;
mod interceptor;
mod nodes;
mod registry;
mod tenant;
mod workflow;

pub use cache::{CacheError, DisabledCache, InMemoryCache, QueryCache};
pub use config::{CacheConfig, EngineConfig, LogConfig, LogPreset, MigrationConfig, PoolSettings};
pub use context::ExecutionContext;
pub use engine::DataFlow;
pub use error::{Error, ErrorKind};
pub use filter::Filter;
pub use nodes::{NodeDescriptor, NodeOutput, Operation, ParamDescriptor, ParamType};
pub use tenant::{TenantContext, TenantGuard, TenantRecord};
pub use workflow::{Connection, RuntimeInputs, Workflow, WorkflowBuilder, WorkflowCancellation};

pub use dataflow_model::{
    DefaultSpec, FieldDescriptor, FieldType, FieldValidator, ForeignKeyRef, FunctionToken,
    IndexSpec, ModelConfig, ModelDescriptor,
};
pub use dataflow_value::{Value, ValueType};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        DataFlow, EngineConfig, FieldDescriptor, FieldType, LogConfig, ModelConfig,
        ModelDescriptor, Operation,
    };
}
