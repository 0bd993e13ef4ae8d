//! Request and response types of the history engine operations
//!
//! Fields the caller may leave unset are `Option`s; the engine fills in
//! defaults from its configuration or from the workflow.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::domain::decision::{Decision, StickyExecutionAttributes};
use crate::domain::events::{DecisionTaskFailedCause, HistoryEvent, Payload, TimeoutType};
use crate::domain::execution::{
    DomainId, ExecutionKey, TaskList, WorkflowExecution, WorkflowIdReusePolicy, WorkflowStatus,
};
use crate::domain::query_registry::{WorkflowQuery, WorkflowQueryResult};
use crate::CoreError;

/// Message returned when a request names no domain
pub const MISSING_DOMAIN_MESSAGE: &str = "Missing domain UUID.";

/// Addresses one scheduled task of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskToken {
    /// Owning domain
    pub domain_id: DomainId,
    /// Workflow id
    pub workflow_id: String,
    /// Run id
    pub run_id: String,
    /// Event id of the scheduled event
    pub schedule_id: i64,
}

impl TaskToken {
    /// The run the task belongs to
    pub fn execution(&self) -> WorkflowExecution {
        WorkflowExecution::new(self.workflow_id.clone(), self.run_id.clone())
    }

    /// Cache key of the run
    pub fn key(&self) -> ExecutionKey {
        ExecutionKey::new(&self.domain_id, &self.execution())
    }
}

// ----- decisions -----

/// A worker polled a decision task off a task list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDecisionTaskStartedRequest {
    /// Owning domain
    pub domain_id: DomainId,
    /// Run the decision belongs to
    pub execution: WorkflowExecution,
    /// Event id of DecisionTaskScheduled
    pub schedule_id: i64,
    /// Id of the matching task in the task list
    pub task_id: i64,
    /// Poll request id, used to recognise a retried dispatch
    pub request_id: String,
    /// Poller identity
    pub identity: String,
    /// Task list the poll arrived on
    pub poll_task_list: TaskList,
}

/// Everything a worker needs to process a started decision
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDecisionTaskStartedResponse {
    /// Workflow type name
    pub workflow_type: String,
    /// Started id of the previous completed decision
    pub previous_started_event_id: Option<i64>,
    /// Event id of DecisionTaskScheduled
    pub scheduled_event_id: i64,
    /// Event id of DecisionTaskStarted
    pub started_event_id: i64,
    /// Next event id after the started event
    pub next_event_id: i64,
    /// Attempt of the decision
    pub attempt: i64,
    /// True when the poll came from the execution's sticky task list
    pub sticky_execution_enabled: bool,
    /// Normal task list of the execution
    pub workflow_execution_task_list: TaskList,
    /// History branch to read events from
    pub branch_token: Vec<u8>,
    /// When the decision was scheduled
    pub scheduled_timestamp: DateTime<Utc>,
    /// When the decision was started
    pub started_timestamp: Option<DateTime<Utc>>,
    /// Queries to answer with this decision
    pub queries: BTreeMap<String, WorkflowQuery>,
}

/// A worker finished a decision task
#[derive(Debug, Clone, PartialEq)]
pub struct RespondDecisionTaskCompletedRequest {
    /// Decision being completed
    pub task_token: TaskToken,
    /// Commands in the order they were made
    pub decisions: Vec<Decision>,
    /// Affinity for the next decision; `None` routes it to the normal task list
    pub sticky_attributes: Option<StickyExecutionAttributes>,
    /// Answers keyed by query id
    pub query_results: BTreeMap<String, WorkflowQueryResult>,
    /// Worker identity
    pub identity: String,
    /// Opaque worker context stored on the execution
    pub execution_context: Option<Payload>,
    /// Schedule another decision even when nothing new happened
    pub force_create_new_decision_task: bool,
}

/// What became of a completed decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespondDecisionTaskCompletedResponse {
    /// Set when the decisions were rejected and the task recorded as failed
    pub failed_cause: Option<DecisionTaskFailedCause>,
    /// Schedule id of the decision scheduled in the same update
    pub new_decision_schedule_id: Option<i64>,
}

/// A worker could not process a decision task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespondDecisionTaskFailedRequest {
    /// Decision being failed
    pub task_token: TaskToken,
    /// Failure cause
    pub cause: DecisionTaskFailedCause,
    /// Failure details
    pub details: Payload,
    /// Worker identity
    pub identity: String,
}

/// A decision timer fired in the external timeout sweeper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionTimeoutTask {
    /// Owning domain
    pub domain_id: DomainId,
    /// Run the decision belongs to
    pub execution: WorkflowExecution,
    /// Schedule id the timer was created for
    pub schedule_id: i64,
    /// Attempt the timer was created for
    pub attempt: i64,
    /// Which timeout fired
    pub timeout_type: TimeoutType,
}

// ----- start -----

/// Start a new run of a workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartWorkflowExecutionRequest {
    /// Owning domain
    pub domain_id: DomainId,
    /// Workflow id
    pub workflow_id: String,
    /// Workflow type name
    pub workflow_type: String,
    /// Normal task list
    pub task_list: String,
    /// Workflow input
    pub input: Payload,
    /// Execution timeout, required
    pub execution_start_to_close_timeout_seconds: Option<i32>,
    /// Decision timeout, required
    pub task_start_to_close_timeout_seconds: Option<i32>,
    /// Starter identity
    pub identity: String,
    /// Idempotency key of the start
    pub request_id: String,
    /// Reuse rule against a closed run; defaults to `AllowDuplicateFailedOnly`
    pub workflow_id_reuse_policy: Option<WorkflowIdReusePolicy>,
}

/// Run created, or found, for a start request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartWorkflowExecutionResponse {
    /// Run id
    pub run_id: String,
}

/// Signal the current run, starting a new one when none is open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalWithStartWorkflowExecutionRequest {
    /// Owning domain
    pub domain_id: DomainId,
    /// Workflow id
    pub workflow_id: String,
    /// Workflow type name
    pub workflow_type: String,
    /// Normal task list
    pub task_list: String,
    /// Workflow input
    pub input: Payload,
    /// Execution timeout, required
    pub execution_start_to_close_timeout_seconds: Option<i32>,
    /// Decision timeout, required
    pub task_start_to_close_timeout_seconds: Option<i32>,
    /// Caller identity
    pub identity: String,
    /// Idempotency key of both the start and the signal
    pub request_id: String,
    /// Reuse rule against a closed run
    pub workflow_id_reuse_policy: Option<WorkflowIdReusePolicy>,
    /// Signal name
    pub signal_name: String,
    /// Signal payload
    pub signal_input: Payload,
}

impl SignalWithStartWorkflowExecutionRequest {
    pub(crate) fn start_request(&self) -> StartWorkflowExecutionRequest {
        StartWorkflowExecutionRequest {
            domain_id: self.domain_id.clone(),
            workflow_id: self.workflow_id.clone(),
            workflow_type: self.workflow_type.clone(),
            task_list: self.task_list.clone(),
            input: self.input.clone(),
            execution_start_to_close_timeout_seconds: self.execution_start_to_close_timeout_seconds,
            task_start_to_close_timeout_seconds: self.task_start_to_close_timeout_seconds,
            identity: self.identity.clone(),
            request_id: self.request_id.clone(),
            workflow_id_reuse_policy: self.workflow_id_reuse_policy,
        }
    }
}

// ----- activities -----

/// A worker polled an activity task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordActivityTaskStartedRequest {
    /// Owning domain
    pub domain_id: DomainId,
    /// Run the activity belongs to
    pub execution: WorkflowExecution,
    /// Event id of ActivityTaskScheduled
    pub schedule_id: i64,
    /// Id of the matching task in the task list
    pub task_id: i64,
    /// Poll request id
    pub request_id: String,
    /// Poller identity
    pub identity: String,
}

/// Everything a worker needs to run a started activity
#[derive(Debug, Clone, PartialEq)]
pub struct RecordActivityTaskStartedResponse {
    /// The ActivityTaskScheduled event
    pub scheduled_event: HistoryEvent,
    /// When the activity was started
    pub started_timestamp: Option<DateTime<Utc>>,
    /// Attempt of the activity
    pub attempt: i32,
    /// Last recorded heartbeat details
    pub heartbeat_details: Option<Payload>,
    /// Workflow type of the owning run
    pub workflow_type: String,
}

/// A worker finished an activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespondActivityTaskCompletedRequest {
    /// Activity being completed
    pub task_token: TaskToken,
    /// Activity result
    pub result: Payload,
    /// Worker identity
    pub identity: String,
}

/// A worker failed an activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespondActivityTaskFailedRequest {
    /// Activity being failed
    pub task_token: TaskToken,
    /// Failure reason
    pub reason: String,
    /// Failure details
    pub details: Payload,
    /// Worker identity
    pub identity: String,
}

// ----- external requests -----

/// Deliver a signal to a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalWorkflowExecutionRequest {
    /// Owning domain
    pub domain_id: DomainId,
    /// Workflow id
    pub workflow_id: String,
    /// Run id; `None` targets the current run
    pub run_id: Option<String>,
    /// Signal name
    pub signal_name: String,
    /// Signal payload
    pub input: Payload,
    /// Caller identity
    pub identity: String,
    /// Idempotency key of the signal
    pub request_id: Option<String>,
}

/// Ask a run to cancel itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCancelWorkflowExecutionRequest {
    /// Owning domain
    pub domain_id: DomainId,
    /// Workflow id
    pub workflow_id: String,
    /// Run id; `None` targets the current run
    pub run_id: Option<String>,
    /// Why cancellation is requested
    pub cause: String,
    /// Caller identity
    pub identity: String,
    /// Idempotency key of the request
    pub request_id: Option<String>,
}

/// Close a run immediately
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateWorkflowExecutionRequest {
    /// Owning domain
    pub domain_id: DomainId,
    /// Workflow id
    pub workflow_id: String,
    /// Run id; `None` targets the current run
    pub run_id: Option<String>,
    /// Termination reason
    pub reason: String,
    /// Termination details
    pub details: Payload,
    /// Caller identity
    pub identity: String,
}

/// A user timer fired in the external timer sweeper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTimerTask {
    /// Owning domain
    pub domain_id: DomainId,
    /// Run the timer belongs to
    pub execution: WorkflowExecution,
    /// Timer that fired
    pub timer_id: String,
}

// ----- reads -----

/// Run a query through the next decision task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryWorkflowRequest {
    /// Owning domain
    pub domain_id: DomainId,
    /// Run to query
    pub execution: WorkflowExecution,
    /// The query
    pub query: WorkflowQuery,
}

/// Answer of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryWorkflowResponse {
    /// Worker's answer
    pub query_result: Payload,
}

/// Inspect a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMutableStateRequest {
    /// Owning domain
    pub domain_id: DomainId,
    /// Run to inspect
    pub execution: WorkflowExecution,
}

/// Read-only view of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMutableStateResponse {
    /// The run
    pub execution: WorkflowExecution,
    /// Workflow type name
    pub workflow_type: String,
    /// Lifecycle status
    pub status: WorkflowStatus,
    /// Id of the next event to append
    pub next_event_id: i64,
    /// Started id of the last completed decision
    pub previous_started_event_id: Option<i64>,
    /// First event id of the last persisted batch
    pub last_first_event_id: i64,
    /// True while the run is open
    pub is_workflow_running: bool,
    /// Normal task list
    pub task_list: String,
    /// Sticky task list, when enabled
    pub sticky_task_list: Option<String>,
    /// Schedule-to-start timeout of sticky decisions
    pub sticky_schedule_to_start_timeout_secs: Option<i32>,
    /// History branch of the run
    pub branch_token: Vec<u8>,
    /// Transaction id of the last committed history batch
    pub last_transaction_id: i64,
}

/// Fail with `BadRequest` when no domain is named
pub(crate) fn require_domain(domain_id: &DomainId) -> Result<(), CoreError> {
    if domain_id.is_empty() {
        Err(CoreError::BadRequest(MISSING_DOMAIN_MESSAGE.to_string()))
    } else {
        Ok(())
    }
}

/// Fail with `BadRequest` when `value` is blank
pub(crate) fn require_non_empty(value: &str, message: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        Err(CoreError::BadRequest(message.to_string()))
    } else {
        Ok(())
    }
}
