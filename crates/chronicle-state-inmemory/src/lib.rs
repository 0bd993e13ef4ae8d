//! In-memory stores for the Chronicle history service
//!
//! This crate implements the `ExecutionStore` and `HistoryStore` traits of
//! chronicle-core with the same conditional-update, current-run and shard
//! ownership rules a durable store enforces. It is meant for tests and for
//! embedding the engine where durability is not required.

use std::sync::Arc;

use chronicle_core::domain::persistence::{ExecutionStore, HistoryStore};

pub mod execution_store;
pub use execution_store::{CurrentRun, InMemoryExecutionStore};

pub mod history_store;
pub use history_store::InMemoryHistoryStore;

/// Provider for a matching pair of in-memory stores
#[derive(Debug, Clone)]
pub struct InMemoryStateStoreProvider {
    executions: Arc<InMemoryExecutionStore>,
    histories: Arc<InMemoryHistoryStore>,
}

impl InMemoryStateStoreProvider {
    /// Create empty stores owned by a shard holding `range_id`
    pub fn new(range_id: i64) -> Self {
        Self {
            executions: Arc::new(InMemoryExecutionStore::new(range_id)),
            histories: Arc::new(InMemoryHistoryStore::new()),
        }
    }

    /// Stores in the form the engine consumes
    pub fn create_stores(&self) -> (Arc<dyn ExecutionStore>, Arc<dyn HistoryStore>) {
        (self.executions.clone(), self.histories.clone())
    }

    /// Concrete execution store, for inspection
    pub fn executions(&self) -> &Arc<InMemoryExecutionStore> {
        &self.executions
    }

    /// Concrete history store, for inspection
    pub fn histories(&self) -> &Arc<InMemoryHistoryStore> {
        &self.histories
    }
}

impl Default for InMemoryStateStoreProvider {
    fn default() -> Self {
        Self::new(1)
    }
}
