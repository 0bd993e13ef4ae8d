//! Workflow execution identity, lifecycle status and execution metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// First event id of every history
pub const FIRST_EVENT_ID: i64 = 1;

/// Sentinel for "no event", e.g. a decision that is scheduled but not started
pub const EMPTY_EVENT_ID: i64 = 0;

/// Failover version used when the domain is not global
pub const EMPTY_VERSION: i64 = -24;

/// Value object: Domain ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainId(pub String);

impl DomainId {
    /// True when no domain identifier was supplied
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: one run of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Business identifier chosen by the caller
    pub workflow_id: String,
    /// Server generated run identifier
    pub run_id: String,
}

impl WorkflowExecution {
    /// Create a new workflow execution identity
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

/// Cache and lock key of one execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionKey {
    /// Owning domain
    pub domain_id: DomainId,
    /// Workflow id
    pub workflow_id: String,
    /// Run id
    pub run_id: String,
}

impl ExecutionKey {
    /// Build a key from a domain and an execution
    pub fn new(domain_id: &DomainId, execution: &WorkflowExecution) -> Self {
        Self {
            domain_id: domain_id.clone(),
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id.clone(),
        }
    }

    /// The execution part of the key
    pub fn execution(&self) -> WorkflowExecution {
        WorkflowExecution::new(self.workflow_id.clone(), self.run_id.clone())
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain_id, self.workflow_id, self.run_id)
    }
}

/// Lifecycle status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// Row created, started event not yet applied
    Created,
    /// Execution is open
    Running,
    /// Closed by a complete decision
    Completed,
    /// Closed by a fail decision
    Failed,
    /// Closed by a cancel decision
    Canceled,
    /// Closed by an operator
    Terminated,
    /// Closed by the execution timeout
    TimedOut,
    /// Closed and continued in a new run
    ContinuedAsNew,
}

impl WorkflowStatus {
    /// True while the execution accepts new events
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, WorkflowStatus::Created | WorkflowStatus::Running)
    }

    /// Close statuses that `AllowDuplicateFailedOnly` accepts as reusable
    #[inline]
    pub fn is_unsuccessful_close(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Failed
                | WorkflowStatus::Canceled
                | WorkflowStatus::Terminated
                | WorkflowStatus::TimedOut
        )
    }
}

/// Kind of task list a task is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TaskListKind {
    /// Shared task list polled by every worker
    #[default]
    Normal,
    /// Worker-specific task list
    Sticky,
}

/// Value object: task list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskList {
    /// Task list name
    pub name: String,
    /// Task list kind
    #[serde(default)]
    pub kind: TaskListKind,
}

impl TaskList {
    /// Normal task list with the given name
    pub fn normal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskListKind::Normal,
        }
    }

    /// Sticky task list with the given name
    pub fn sticky(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskListKind::Sticky,
        }
    }
}

/// Rule governing whether a new run may reuse a workflow id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WorkflowIdReusePolicy {
    /// Reuse only when the previous run failed, was canceled, terminated or timed out
    #[default]
    AllowDuplicateFailedOnly,
    /// Reuse whenever the previous run is closed
    AllowDuplicate,
    /// Never reuse
    RejectDuplicate,
    /// Reuse when the previous run is closed; an open run is never replaced
    TerminateIfRunning,
}

impl WorkflowIdReusePolicy {
    /// Decide whether a new run may be created over a closed run with the given status
    pub fn allows_reuse_of(&self, previous: WorkflowStatus) -> bool {
        if previous.is_open() {
            return false;
        }
        match self {
            WorkflowIdReusePolicy::AllowDuplicateFailedOnly => previous.is_unsuccessful_close(),
            WorkflowIdReusePolicy::AllowDuplicate | WorkflowIdReusePolicy::TerminateIfRunning => true,
            WorkflowIdReusePolicy::RejectDuplicate => false,
        }
    }
}

/// Execution metadata held by the mutable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Owning domain
    pub domain_id: DomainId,
    /// Workflow id
    pub workflow_id: String,
    /// Run id
    pub run_id: String,
    /// Workflow type name
    pub workflow_type: String,
    /// Normal task list
    pub task_list: String,
    /// Sticky task list, when the last worker asked for affinity
    pub sticky_task_list: Option<String>,
    /// Schedule-to-start timeout for sticky decisions
    pub sticky_schedule_to_start_timeout_secs: Option<i32>,
    /// Execution start-to-close timeout
    pub execution_timeout_secs: i32,
    /// Decision start-to-close timeout
    pub decision_timeout_secs: i32,
    /// Request id that created this run
    pub start_request_id: String,
    /// Identity of the starter
    pub identity: String,
    /// Lifecycle status
    pub status: WorkflowStatus,
    /// Id of the next event to append
    pub next_event_id: i64,
    /// Started id of the last completed decision
    pub last_processed_event_id: i64,
    /// First event id of the last persisted batch
    pub last_first_event_id: i64,
    /// Cancel has been requested
    pub cancel_requested: bool,
    /// Request id of the cancel request
    pub cancel_request_id: Option<String>,
    /// Number of signals received
    pub signal_count: i64,
    /// History branch of this run
    pub branch_token: Vec<u8>,
    /// Timestamp of the started event
    pub start_timestamp: Option<DateTime<Utc>>,
    /// Timestamp of the last applied event
    pub last_updated_timestamp: Option<DateTime<Utc>>,
    /// Timestamp of the close event
    pub close_timestamp: Option<DateTime<Utc>>,
    /// Last execution context reported by a decision
    pub execution_context: Option<Vec<u8>>,
}

impl ExecutionInfo {
    /// Blank execution metadata for a run that has no events yet
    pub fn new(domain_id: DomainId, execution: &WorkflowExecution) -> Self {
        Self {
            domain_id,
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id.clone(),
            workflow_type: String::new(),
            task_list: String::new(),
            sticky_task_list: None,
            sticky_schedule_to_start_timeout_secs: None,
            execution_timeout_secs: 0,
            decision_timeout_secs: 0,
            start_request_id: String::new(),
            identity: String::new(),
            status: WorkflowStatus::Created,
            next_event_id: FIRST_EVENT_ID,
            last_processed_event_id: EMPTY_EVENT_ID,
            last_first_event_id: FIRST_EVENT_ID,
            cancel_requested: false,
            cancel_request_id: None,
            signal_count: 0,
            branch_token: execution.run_id.as_bytes().to_vec(),
            start_timestamp: None,
            last_updated_timestamp: None,
            close_timestamp: None,
            execution_context: None,
        }
    }

    /// Execution identity
    pub fn execution(&self) -> WorkflowExecution {
        WorkflowExecution::new(self.workflow_id.clone(), self.run_id.clone())
    }
}
