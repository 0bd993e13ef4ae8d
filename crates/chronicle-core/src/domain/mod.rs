/// Execution identity, status and metadata
pub mod execution;

/// History events
pub mod events;

/// Decision tasks and worker decisions
pub mod decision;

/// Mutable state aggregate
pub mod mutable_state;

/// Query registry
pub mod query_registry;

/// Persistence interfaces
pub mod persistence;

/// Shard and cluster metadata
pub mod shard;
