//! History events
//!
//! A workflow run's history is an ordered list of [`HistoryEvent`]s. Each
//! event carries one [`EventAttributes`] variant; the mutable state reducer
//! dispatches on that variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::execution::{TaskList, WorkflowIdReusePolicy};

/// Opaque payload produced and consumed by workers
pub type Payload = Vec<u8>;

/// One entry of a workflow history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Position in the history, starting at 1
    pub event_id: i64,
    /// Failover version active when the event was written
    pub version: i64,
    /// Shard task id of the write that produced the event
    pub task_id: i64,
    /// Time the event was produced
    pub timestamp: DateTime<Utc>,
    /// Type specific attributes
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// The event type tag
    #[inline]
    pub fn event_type(&self) -> EventType {
        self.attributes.event_type()
    }
}

/// Why a decision or activity timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutType {
    /// Task was started but not completed in time
    StartToClose,
    /// Task was not picked up in time
    ScheduleToStart,
    /// Task did not close within its overall budget
    ScheduleToClose,
    /// Worker stopped heartbeating
    Heartbeat,
}

/// Why a decision task failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionTaskFailedCause {
    /// A close decision raced with new events
    UnhandledDecision,
    /// A decision carried invalid attributes
    BadDecisionAttributes,
    /// A timer id was reused while still pending
    StartTimerDuplicateId,
    /// An activity id was reused while still pending
    ScheduleActivityDuplicateId,
    /// Worker reported a failure
    WorkflowWorkerUnhandledFailure,
    /// Sticky task list was reset by an operator
    ResetStickyTaskList,
}

/// Attributes of the first event of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionStartedAttributes {
    /// Workflow type name
    pub workflow_type: String,
    /// Normal task list
    pub task_list: TaskList,
    /// Workflow input
    pub input: Payload,
    /// Execution start-to-close timeout
    pub execution_start_to_close_timeout_seconds: i32,
    /// Decision start-to-close timeout
    pub task_start_to_close_timeout_seconds: i32,
    /// Identity of the starter
    pub identity: String,
    /// Request id used for start dedup
    pub request_id: String,
    /// Reuse policy the run was started with
    pub workflow_id_reuse_policy: WorkflowIdReusePolicy,
    /// Previous run of the same workflow id, if any
    pub continued_execution_run_id: Option<String>,
    /// Parent execution when started as a child
    pub parent_workflow_id: Option<String>,
    /// Parent run when started as a child
    pub parent_run_id: Option<String>,
}

/// Type specific attributes of a history event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "attributes")]
pub enum EventAttributes {
    /// Run started
    WorkflowExecutionStarted(WorkflowExecutionStartedAttributes),
    /// Run closed successfully
    WorkflowExecutionCompleted {
        /// Workflow result
        result: Payload,
        /// Decision that closed the run
        decision_task_completed_event_id: i64,
    },
    /// Run closed with failure
    WorkflowExecutionFailed {
        /// Failure reason
        reason: String,
        /// Failure details
        details: Payload,
        /// Decision that closed the run
        decision_task_completed_event_id: i64,
    },
    /// Run closed after a cancel request
    WorkflowExecutionCanceled {
        /// Cancellation details
        details: Payload,
        /// Decision that closed the run
        decision_task_completed_event_id: i64,
    },
    /// Run closed by an operator
    WorkflowExecutionTerminated {
        /// Termination reason
        reason: String,
        /// Termination details
        details: Payload,
        /// Operator identity
        identity: String,
    },
    /// Run closed by its execution timeout
    WorkflowExecutionTimedOut,
    /// External signal delivered
    WorkflowExecutionSignaled {
        /// Signal name
        signal_name: String,
        /// Signal payload
        input: Payload,
        /// Sender identity
        identity: String,
        /// Request id used for dedup
        request_id: Option<String>,
    },
    /// External cancel request delivered
    WorkflowExecutionCancelRequested {
        /// Free form cause
        cause: String,
        /// Requester identity
        identity: String,
        /// Request id used for dedup
        request_id: Option<String>,
    },
    /// Decision scheduled
    DecisionTaskScheduled {
        /// Task list the decision is dispatched to
        task_list: TaskList,
        /// Decision start-to-close timeout
        start_to_close_timeout_seconds: i32,
        /// Attempt number, 0 for the first attempt
        attempt: i64,
    },
    /// Decision picked up by a worker
    DecisionTaskStarted {
        /// Scheduled event of this decision
        scheduled_event_id: i64,
        /// Worker identity
        identity: String,
        /// Poll request id used for dedup
        request_id: String,
    },
    /// Decision finished by the worker
    DecisionTaskCompleted {
        /// Scheduled event of this decision
        scheduled_event_id: i64,
        /// Started event of this decision
        started_event_id: i64,
        /// Worker identity
        identity: String,
        /// Execution context reported by the worker
        execution_context: Option<Payload>,
    },
    /// Decision timed out
    DecisionTaskTimedOut {
        /// Scheduled event of this decision
        scheduled_event_id: i64,
        /// Started event, EMPTY_EVENT_ID for schedule-to-start timeouts
        started_event_id: i64,
        /// Which timeout fired
        timeout_type: TimeoutType,
    },
    /// Decision failed
    DecisionTaskFailed {
        /// Scheduled event of this decision
        scheduled_event_id: i64,
        /// Started event of this decision
        started_event_id: i64,
        /// Failure cause
        cause: DecisionTaskFailedCause,
        /// Failure details
        details: Payload,
        /// Worker identity
        identity: String,
    },
    /// Activity scheduled by a decision
    ActivityTaskScheduled {
        /// Workflow scoped activity id
        activity_id: String,
        /// Activity type name
        activity_type: String,
        /// Task list the activity is dispatched to
        task_list: TaskList,
        /// Activity input
        input: Payload,
        /// Overall timeout
        schedule_to_close_timeout_seconds: i32,
        /// Dispatch timeout
        schedule_to_start_timeout_seconds: i32,
        /// Execution timeout
        start_to_close_timeout_seconds: i32,
        /// Heartbeat timeout
        heartbeat_timeout_seconds: i32,
        /// Decision that scheduled the activity
        decision_task_completed_event_id: i64,
    },
    /// Activity picked up by a worker
    ActivityTaskStarted {
        /// Scheduled event of this activity
        scheduled_event_id: i64,
        /// Worker identity
        identity: String,
        /// Poll request id used for dedup
        request_id: String,
        /// Attempt number
        attempt: i32,
    },
    /// Activity finished successfully
    ActivityTaskCompleted {
        /// Scheduled event of this activity
        scheduled_event_id: i64,
        /// Started event of this activity
        started_event_id: i64,
        /// Activity result
        result: Payload,
        /// Worker identity
        identity: String,
    },
    /// Activity finished with failure
    ActivityTaskFailed {
        /// Scheduled event of this activity
        scheduled_event_id: i64,
        /// Started event of this activity
        started_event_id: i64,
        /// Failure reason
        reason: String,
        /// Failure details
        details: Payload,
        /// Worker identity
        identity: String,
    },
    /// Activity timed out
    ActivityTaskTimedOut {
        /// Scheduled event of this activity
        scheduled_event_id: i64,
        /// Started event, EMPTY_EVENT_ID when never started
        started_event_id: i64,
        /// Which timeout fired
        timeout_type: TimeoutType,
    },
    /// User timer started by a decision
    TimerStarted {
        /// Workflow scoped timer id
        timer_id: String,
        /// Delay before the timer fires
        start_to_fire_timeout_seconds: i64,
        /// Decision that started the timer
        decision_task_completed_event_id: i64,
    },
    /// User timer fired
    TimerFired {
        /// Workflow scoped timer id
        timer_id: String,
        /// Started event of the timer
        started_event_id: i64,
    },
    /// User timer canceled by a decision
    TimerCanceled {
        /// Workflow scoped timer id
        timer_id: String,
        /// Started event of the timer
        started_event_id: i64,
        /// Decision that canceled the timer
        decision_task_completed_event_id: i64,
        /// Worker identity
        identity: String,
    },
    /// Marker recorded by a decision
    MarkerRecorded {
        /// Marker name
        marker_name: String,
        /// Marker details
        details: Payload,
        /// Decision that recorded the marker
        decision_task_completed_event_id: i64,
    },
    /// Child workflow start requested
    StartChildWorkflowExecutionInitiated {
        /// Child domain
        domain: String,
        /// Child workflow id
        workflow_id: String,
        /// Child workflow type
        workflow_type: String,
        /// Child task list
        task_list: TaskList,
        /// Child input
        input: Payload,
        /// Decision that started the child
        decision_task_completed_event_id: i64,
    },
    /// Child workflow run created
    ChildWorkflowExecutionStarted {
        /// Initiated event of the child
        initiated_event_id: i64,
        /// Child workflow id
        workflow_id: String,
        /// Child run id
        run_id: String,
    },
    /// Child workflow completed
    ChildWorkflowExecutionCompleted {
        /// Initiated event of the child
        initiated_event_id: i64,
        /// Started event of the child
        started_event_id: i64,
        /// Child result
        result: Payload,
    },
    /// Child workflow failed
    ChildWorkflowExecutionFailed {
        /// Initiated event of the child
        initiated_event_id: i64,
        /// Started event of the child
        started_event_id: i64,
        /// Failure reason
        reason: String,
        /// Failure details
        details: Payload,
    },
    /// Cancel of another workflow requested
    RequestCancelExternalWorkflowExecutionInitiated {
        /// Target domain
        domain: String,
        /// Target workflow id
        workflow_id: String,
        /// Target run id, empty for the current run
        run_id: Option<String>,
        /// Decision that requested the cancel
        decision_task_completed_event_id: i64,
    },
    /// Cancel of another workflow delivered
    ExternalWorkflowExecutionCancelRequested {
        /// Initiated event of the request
        initiated_event_id: i64,
        /// Target workflow id
        workflow_id: String,
        /// Target run id
        run_id: Option<String>,
    },
    /// Signal to another workflow requested
    SignalExternalWorkflowExecutionInitiated {
        /// Target domain
        domain: String,
        /// Target workflow id
        workflow_id: String,
        /// Target run id, empty for the current run
        run_id: Option<String>,
        /// Signal name
        signal_name: String,
        /// Signal payload
        input: Payload,
        /// Decision that requested the signal
        decision_task_completed_event_id: i64,
    },
    /// Signal to another workflow delivered
    ExternalWorkflowExecutionSignaled {
        /// Initiated event of the request
        initiated_event_id: i64,
        /// Target workflow id
        workflow_id: String,
        /// Target run id
        run_id: Option<String>,
    },
}

/// Event type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionCanceled,
    WorkflowExecutionTerminated,
    WorkflowExecutionTimedOut,
    WorkflowExecutionSignaled,
    WorkflowExecutionCancelRequested,
    DecisionTaskScheduled,
    DecisionTaskStarted,
    DecisionTaskCompleted,
    DecisionTaskTimedOut,
    DecisionTaskFailed,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    ActivityTaskTimedOut,
    TimerStarted,
    TimerFired,
    TimerCanceled,
    MarkerRecorded,
    StartChildWorkflowExecutionInitiated,
    ChildWorkflowExecutionStarted,
    ChildWorkflowExecutionCompleted,
    ChildWorkflowExecutionFailed,
    RequestCancelExternalWorkflowExecutionInitiated,
    ExternalWorkflowExecutionCancelRequested,
    SignalExternalWorkflowExecutionInitiated,
    ExternalWorkflowExecutionSignaled,
}

impl EventType {
    /// True for events that close the run
    pub fn is_workflow_close(&self) -> bool {
        matches!(
            self,
            EventType::WorkflowExecutionCompleted
                | EventType::WorkflowExecutionFailed
                | EventType::WorkflowExecutionCanceled
                | EventType::WorkflowExecutionTerminated
                | EventType::WorkflowExecutionTimedOut
        )
    }
}

impl EventAttributes {
    /// The event type tag of these attributes
    pub fn event_type(&self) -> EventType {
        match self {
            EventAttributes::WorkflowExecutionStarted(_) => EventType::WorkflowExecutionStarted,
            EventAttributes::WorkflowExecutionCompleted { .. } => EventType::WorkflowExecutionCompleted,
            EventAttributes::WorkflowExecutionFailed { .. } => EventType::WorkflowExecutionFailed,
            EventAttributes::WorkflowExecutionCanceled { .. } => EventType::WorkflowExecutionCanceled,
            EventAttributes::WorkflowExecutionTerminated { .. } => EventType::WorkflowExecutionTerminated,
            EventAttributes::WorkflowExecutionTimedOut => EventType::WorkflowExecutionTimedOut,
            EventAttributes::WorkflowExecutionSignaled { .. } => EventType::WorkflowExecutionSignaled,
            EventAttributes::WorkflowExecutionCancelRequested { .. } => {
                EventType::WorkflowExecutionCancelRequested
            }
            EventAttributes::DecisionTaskScheduled { .. } => EventType::DecisionTaskScheduled,
            EventAttributes::DecisionTaskStarted { .. } => EventType::DecisionTaskStarted,
            EventAttributes::DecisionTaskCompleted { .. } => EventType::DecisionTaskCompleted,
            EventAttributes::DecisionTaskTimedOut { .. } => EventType::DecisionTaskTimedOut,
            EventAttributes::DecisionTaskFailed { .. } => EventType::DecisionTaskFailed,
            EventAttributes::ActivityTaskScheduled { .. } => EventType::ActivityTaskScheduled,
            EventAttributes::ActivityTaskStarted { .. } => EventType::ActivityTaskStarted,
            EventAttributes::ActivityTaskCompleted { .. } => EventType::ActivityTaskCompleted,
            EventAttributes::ActivityTaskFailed { .. } => EventType::ActivityTaskFailed,
            EventAttributes::ActivityTaskTimedOut { .. } => EventType::ActivityTaskTimedOut,
            EventAttributes::TimerStarted { .. } => EventType::TimerStarted,
            EventAttributes::TimerFired { .. } => EventType::TimerFired,
            EventAttributes::TimerCanceled { .. } => EventType::TimerCanceled,
            EventAttributes::MarkerRecorded { .. } => EventType::MarkerRecorded,
            EventAttributes::StartChildWorkflowExecutionInitiated { .. } => {
                EventType::StartChildWorkflowExecutionInitiated
            }
            EventAttributes::ChildWorkflowExecutionStarted { .. } => EventType::ChildWorkflowExecutionStarted,
            EventAttributes::ChildWorkflowExecutionCompleted { .. } => {
                EventType::ChildWorkflowExecutionCompleted
            }
            EventAttributes::ChildWorkflowExecutionFailed { .. } => EventType::ChildWorkflowExecutionFailed,
            EventAttributes::RequestCancelExternalWorkflowExecutionInitiated { .. } => {
                EventType::RequestCancelExternalWorkflowExecutionInitiated
            }
            EventAttributes::ExternalWorkflowExecutionCancelRequested { .. } => {
                EventType::ExternalWorkflowExecutionCancelRequested
            }
            EventAttributes::SignalExternalWorkflowExecutionInitiated { .. } => {
                EventType::SignalExternalWorkflowExecutionInitiated
            }
            EventAttributes::ExternalWorkflowExecutionSignaled { .. } => {
                EventType::ExternalWorkflowExecutionSignaled
            }
        }
    }
}
