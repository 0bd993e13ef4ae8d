//! Chronicle Core - workflow execution core of the Chronicle history service
//!
//! This crate owns the durable state of workflow executions: the mutable
//! state aggregate built from history events, the execution cache that
//! serializes work per execution, the optimistic update loop and the
//! coordinators that start runs and hand decision tasks to workers.
//! Storage is reached only through the traits in [`domain::persistence`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - executions, events, mutable state and store interfaces
pub mod domain;

/// Application layer - cache, retry loop and operation coordinators
pub mod application;

/// Request and response types of the engine operations
pub mod types;

/// Error types
pub mod error;

/// Engine configuration
pub mod config;

/// History builders for tests
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use application::deadline::OperationContext;
pub use application::execution_cache::ExecutionCache;
pub use application::history_engine::HistoryEngine;
pub use config::EngineConfig;
pub use domain::execution::{
    DomainId, ExecutionKey, TaskList, WorkflowExecution, WorkflowIdReusePolicy, WorkflowStatus,
};
pub use domain::mutable_state::{MutableState, MutableStateSnapshot};
pub use domain::persistence::{ExecutionStore, HistoryStore, PersistenceError};
pub use domain::shard::ShardContext;
pub use error::CoreError;
