/// Operation deadlines
pub mod deadline;

/// Per-execution persistence handle
pub mod execution_context;

/// Execution cache with per-key locks
pub mod execution_cache;

/// Optimistic update loop
pub mod retry;

/// Decision task lifecycle
pub mod decision_handler;

/// Start and signal-with-start
pub mod start_handler;

/// Engine facade
pub mod history_engine;

#[cfg(test)]
mod test_support;
