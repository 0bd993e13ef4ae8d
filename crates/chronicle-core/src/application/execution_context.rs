//! Per-execution context: lazily loaded aggregate plus its persistence path

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::retry::ConditionalUpdate;
use crate::domain::execution::ExecutionKey;
use crate::domain::mutable_state::MutableState;
use crate::domain::persistence::{
    AlreadyStartedConflict, AppendHistoryNodesRequest, ConditionalUpdateToken,
    CreateWorkflowExecutionRequest, CreateWorkflowMode, ExecutionStore,
    GetWorkflowExecutionRequest, HistoryStore, PersistenceError, UpdateWorkflowExecutionRequest,
};
use crate::domain::query_registry::QueryRegistry;
use crate::domain::shard::ShardContext;
use crate::CoreError;

/// Result of inserting a new run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The run was inserted and is now current
    Created,
    /// Another run blocks the workflow id
    Conflict(AlreadyStartedConflict),
}

/// Cached aggregate of one execution and the stores that back it
pub struct ExecutionContext {
    key: ExecutionKey,
    state: Option<MutableState>,
    retained_queries: Option<QueryRegistry>,
    sticky_ttl: Option<Duration>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    shard: Arc<ShardContext>,
}

impl ExecutionContext {
    /// Create an unloaded context
    pub fn new(
        key: ExecutionKey,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        shard: Arc<ShardContext>,
    ) -> Self {
        Self {
            key,
            state: None,
            retained_queries: None,
            sticky_ttl: None,
            execution_store,
            history_store,
            shard,
        }
    }

    /// Let stickiness of the cached run lapse after `ttl` of inactivity
    pub fn with_sticky_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.sticky_ttl = ttl;
        self
    }

    /// Key of the execution
    pub fn key(&self) -> &ExecutionKey {
        &self.key
    }

    /// True when the aggregate is held in memory
    pub fn is_loaded(&self) -> bool {
        self.state.is_some()
    }

    /// The aggregate if already loaded
    pub fn loaded_state(&self) -> Option<&MutableState> {
        self.state.as_ref()
    }

    /// Mutable access to the aggregate if already loaded
    pub fn loaded_state_mut(&mut self) -> Option<&mut MutableState> {
        self.state.as_mut()
    }

    /// Load the aggregate on first use, then serve it from memory
    pub async fn load_state(&mut self) -> Result<&mut MutableState, CoreError> {
        if self.state.is_none() {
            let response = self
                .execution_store
                .get_workflow_execution(GetWorkflowExecutionRequest {
                    domain_id: self.key.domain_id.clone(),
                    execution: self.key.execution(),
                })
                .await?;

            let mut state = MutableState::from_snapshot(response.state);
            state.set_sticky_ttl(self.sticky_ttl);
            if let Some(queries) = self.retained_queries.take() {
                state.replace_query_registry(queries);
            }
            debug!(
                execution = %self.key,
                next_event_id = state.next_event_id(),
                "Loaded mutable state"
            );
            self.state = Some(state);
        }

        let task_id = self.shard.next_task_id();
        let version = self.shard.failover_version(&self.key.domain_id);
        match self.state.as_mut() {
            Some(state) => {
                state.set_transaction_task_id(task_id);
                state.set_current_version(version);
                Ok(state)
            }
            None => Err(CoreError::Internal(format!(
                "mutable state of {} vanished after load",
                self.key
            ))),
        }
    }

    /// Write new events to history, then conditionally update the row
    ///
    /// The batch is chained to the last committed one; if the row update
    /// then loses, the batch stays unreachable from the committed history.
    pub async fn persist_state(&mut self) -> Result<(), CoreError> {
        let state = self.state.as_mut().ok_or_else(|| {
            CoreError::Internal(format!("persist called on unloaded execution {}", self.key))
        })?;

        let events = state.new_events().to_vec();
        if let Some(first) = events.first() {
            let transaction_id = first.task_id;
            let response = self
                .history_store
                .append_history_nodes(AppendHistoryNodesRequest {
                    branch_token: state.current_branch_token().to_vec(),
                    events,
                    transaction_id,
                    prev_transaction_id: state.committed_transaction_id(),
                })
                .await?;
            trace!(execution = %self.key, size = response.size, transaction_id, "Appended history batch");
        }

        self.execution_store
            .update_workflow_execution(UpdateWorkflowExecutionRequest {
                condition: ConditionalUpdateToken {
                    expected_next_event_id: state.update_condition(),
                    range_id: self.shard.range_id(),
                },
                snapshot: state.to_snapshot(),
            })
            .await?;

        state.commit();
        state.query_registry_mut().notify_terminated();
        Ok(())
    }

    /// Append the new run's events to history
    pub async fn append_initial_history(&self, state: &MutableState) -> Result<(), CoreError> {
        let events = state.new_events().to_vec();
        let transaction_id = match events.first() {
            Some(first) => first.task_id,
            None => return Ok(()),
        };
        self.history_store
            .append_history_nodes(AppendHistoryNodesRequest {
                branch_token: state.current_branch_token().to_vec(),
                events,
                transaction_id,
                prev_transaction_id: state.committed_transaction_id(),
            })
            .await?;
        Ok(())
    }

    /// Insert the run row; a blocking current run is reported, not raised
    pub async fn create_workflow_execution(
        &self,
        state: &MutableState,
        mode: CreateWorkflowMode,
    ) -> Result<CreateOutcome, CoreError> {
        let result = self
            .execution_store
            .create_workflow_execution(CreateWorkflowExecutionRequest {
                range_id: self.shard.range_id(),
                mode,
                new_snapshot: state.to_snapshot(),
            })
            .await;

        match result {
            Ok(()) => Ok(CreateOutcome::Created),
            Err(PersistenceError::WorkflowExecutionAlreadyStarted(conflict)) => {
                Ok(CreateOutcome::Conflict(conflict))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Adopt a freshly created run as the cached aggregate
    pub fn install(&mut self, mut state: MutableState) {
        state.commit();
        state.set_sticky_ttl(self.sticky_ttl);
        self.retained_queries = None;
        self.state = Some(state);
    }

    /// Drop the aggregate but keep `queries` for the next load
    pub fn invalidate_with(&mut self, queries: QueryRegistry) {
        self.state = None;
        self.retained_queries = Some(queries);
    }

    /// Drop the aggregate and everything attached to it
    pub fn clear(&mut self) {
        self.state = None;
        self.retained_queries = None;
    }
}

#[async_trait]
impl ConditionalUpdate for ExecutionContext {
    async fn load(&mut self) -> Result<&mut MutableState, CoreError> {
        self.load_state().await
    }

    async fn persist(&mut self) -> Result<(), CoreError> {
        self.persist_state().await
    }

    fn invalidate(&mut self, retained_queries: QueryRegistry) {
        self.invalidate_with(retained_queries);
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("key", &self.key)
            .field("loaded", &self.state.is_some())
            .finish()
    }
}
