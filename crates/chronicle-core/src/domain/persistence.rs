//! Persistence traits for the history engine
//!
//! The engine consumes two stores: an [`ExecutionStore`] holding one
//! versioned row per run plus a current-run pointer per workflow id, and a
//! [`HistoryStore`] holding the append-only event branches. Requests are
//! owned structs so implementations can move them across await points.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::events::HistoryEvent;
use super::execution::{DomainId, WorkflowExecution, WorkflowStatus};
use super::mutable_state::MutableStateSnapshot;

/// Token a writer presents to prove it saw the latest row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalUpdateToken {
    /// `next_event_id` of the row the writer loaded
    pub expected_next_event_id: i64,
    /// Shard range id the writer holds
    pub range_id: i64,
}

/// How a new run relates to the current run of the same workflow id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateWorkflowMode {
    /// No current run may exist
    BrandNew,
    /// Replace a closed current run; rejected if the current run moved on
    WorkflowIdReuse {
        /// Run id the caller observed as current
        previous_run_id: String,
        /// Last write version of that run
        previous_last_write_version: i64,
    },
}

/// Details of the run that blocked a create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlreadyStartedConflict {
    /// Human readable reason
    pub message: String,
    /// Request id that created the current run
    pub start_request_id: String,
    /// Run id of the current run
    pub run_id: String,
    /// Status of the current run
    pub status: WorkflowStatus,
    /// Last write version of the current run
    pub last_write_version: i64,
}

/// Errors reported by store implementations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Row or branch does not exist
    #[error("entity not exists: {0}")]
    EntityNotExists(String),

    /// A current run blocks the create
    #[error("workflow execution already started: {}", .0.message)]
    WorkflowExecutionAlreadyStarted(AlreadyStartedConflict),

    /// Conditional update lost to another writer
    #[error("condition failed: {0}")]
    ConditionFailed(String),

    /// Range id presented by the writer is stale
    #[error("shard ownership lost: {0}")]
    ShardOwnershipLost(String),

    /// Store did not answer in time
    #[error("persistence timeout: {0}")]
    Timeout(String),

    /// Any other store failure
    #[error("persistence failure: {0}")]
    Internal(String),
}

/// Load one run
#[derive(Debug, Clone, PartialEq)]
pub struct GetWorkflowExecutionRequest {
    /// Owning domain
    pub domain_id: DomainId,
    /// Run to load
    pub execution: WorkflowExecution,
}

/// Loaded run
#[derive(Debug, Clone, PartialEq)]
pub struct GetWorkflowExecutionResponse {
    /// Persisted aggregate
    pub state: MutableStateSnapshot,
}

/// Insert a new run and make it current
#[derive(Debug, Clone, PartialEq)]
pub struct CreateWorkflowExecutionRequest {
    /// Shard range id held by the writer
    pub range_id: i64,
    /// Relation to the existing current run
    pub mode: CreateWorkflowMode,
    /// Initial aggregate of the new run
    pub new_snapshot: MutableStateSnapshot,
}

/// Conditionally replace a run
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateWorkflowExecutionRequest {
    /// Version the writer loaded
    pub condition: ConditionalUpdateToken,
    /// New aggregate
    pub snapshot: MutableStateSnapshot,
}

/// Look up the current run of a workflow id
#[derive(Debug, Clone, PartialEq)]
pub struct GetCurrentExecutionRequest {
    /// Owning domain
    pub domain_id: DomainId,
    /// Workflow id
    pub workflow_id: String,
}

/// Current run of a workflow id
#[derive(Debug, Clone, PartialEq)]
pub struct GetCurrentExecutionResponse {
    /// Run id
    pub run_id: String,
    /// Request id that created the run
    pub start_request_id: String,
    /// Run status
    pub status: WorkflowStatus,
    /// Last write version
    pub last_write_version: i64,
}

/// Append a batch of events to a branch
#[derive(Debug, Clone, PartialEq)]
pub struct AppendHistoryNodesRequest {
    /// Target branch
    pub branch_token: Vec<u8>,
    /// Events in id order
    pub events: Vec<HistoryEvent>,
    /// Shard task id of the write
    pub transaction_id: i64,
    /// Transaction id of the committed batch this one extends, 0 for the first batch
    pub prev_transaction_id: i64,
}

/// Result of an append
#[derive(Debug, Clone, PartialEq)]
pub struct AppendHistoryNodesResponse {
    /// Encoded size of the batch in bytes
    pub size: usize,
}

/// Read a range of a branch
#[derive(Debug, Clone, PartialEq)]
pub struct ReadHistoryBranchRequest {
    /// Branch to read
    pub branch_token: Vec<u8>,
    /// First event id, inclusive
    pub min_event_id: i64,
    /// Last event id, exclusive
    pub max_event_id: i64,
    /// Transaction id of the last batch the execution row committed
    ///
    /// Batches written by a writer that then lost its conditional update
    /// are not reachable from it and are never returned.
    pub last_transaction_id: i64,
}

/// Events read from a branch
#[derive(Debug, Clone, PartialEq)]
pub struct ReadHistoryBranchResponse {
    /// Events in id order
    pub events: Vec<HistoryEvent>,
}

/// Store of execution rows and current-run pointers
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Load one run
    async fn get_workflow_execution(
        &self,
        request: GetWorkflowExecutionRequest,
    ) -> Result<GetWorkflowExecutionResponse, PersistenceError>;

    /// Insert a new run, failing with `WorkflowExecutionAlreadyStarted` when blocked
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<(), PersistenceError>;

    /// Replace a run if its `next_event_id` still matches the token
    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<(), PersistenceError>;

    /// Look up the current run of a workflow id
    async fn get_current_execution(
        &self,
        request: GetCurrentExecutionRequest,
    ) -> Result<GetCurrentExecutionResponse, PersistenceError>;
}

/// Append-only store of history branches
///
/// Every batch names the batch it extends, so the committed history is the
/// chain ending at the transaction id recorded in the execution row.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append events to a branch
    async fn append_history_nodes(
        &self,
        request: AppendHistoryNodesRequest,
    ) -> Result<AppendHistoryNodesResponse, PersistenceError>;

    /// Read events of a branch
    async fn read_history_branch(
        &self,
        request: ReadHistoryBranchRequest,
    ) -> Result<ReadHistoryBranchResponse, PersistenceError>;
}
