//! Decision tasks and the commands a worker returns for them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{DecisionTaskFailedCause, Payload};
use super::execution::{TaskListKind, EMPTY_EVENT_ID};

/// The pending decision of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInfo {
    /// Version of the scheduled event
    pub version: i64,
    /// Event id of DecisionTaskScheduled
    pub schedule_id: i64,
    /// Event id of DecisionTaskStarted, `EMPTY_EVENT_ID` while unstarted
    pub started_id: i64,
    /// Poll request id that started the decision
    pub request_id: Option<String>,
    /// Task list the decision was dispatched to
    pub task_list: String,
    /// Whether `task_list` is the sticky one
    pub kind: TaskListKind,
    /// Attempt number, 0 for the first
    pub attempt: i64,
    /// Start-to-close timeout
    pub start_to_close_timeout_secs: i32,
    /// When the decision was scheduled
    pub scheduled_timestamp: DateTime<Utc>,
    /// When the decision was started
    pub started_timestamp: Option<DateTime<Utc>>,
    /// When the first attempt of this decision was scheduled
    pub original_scheduled_timestamp: DateTime<Utc>,
}

impl DecisionInfo {
    /// True once a worker picked the decision up
    #[inline]
    pub fn is_started(&self) -> bool {
        self.started_id != EMPTY_EVENT_ID
    }

    /// True when the decision was dispatched to a sticky task list
    #[inline]
    pub fn is_sticky(&self) -> bool {
        self.kind == TaskListKind::Sticky
    }
}

/// Sticky settings a worker attaches to a completed decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickyExecutionAttributes {
    /// Worker specific task list
    pub worker_task_list: String,
    /// Schedule-to-start timeout for sticky decisions
    pub schedule_to_start_timeout_seconds: Option<i32>,
}

/// A command returned by a worker in a completed decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    /// Schedule an activity
    ScheduleActivityTask {
        /// Workflow scoped activity id
        activity_id: String,
        /// Activity type name
        activity_type: String,
        /// Task list, defaults to the workflow task list
        task_list: Option<String>,
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
    },
    /// Start a user timer
    StartTimer {
        /// Workflow scoped timer id
        timer_id: String,
        /// Delay before firing
        start_to_fire_timeout_seconds: i64,
    },
    /// Cancel a pending user timer
    CancelTimer {
        /// Timer to cancel
        timer_id: String,
    },
    /// Record a marker in history
    RecordMarker {
        /// Marker name
        marker_name: String,
        /// Marker details
        details: Payload,
    },
    /// Close the run successfully
    CompleteWorkflowExecution {
        /// Workflow result
        result: Payload,
    },
    /// Close the run with failure
    FailWorkflowExecution {
        /// Failure reason
        reason: String,
        /// Failure details
        details: Payload,
    },
    /// Close the run as canceled
    CancelWorkflowExecution {
        /// Cancellation details
        details: Payload,
    },
    /// Ask another workflow to cancel
    RequestCancelExternalWorkflowExecution {
        /// Target domain
        domain: String,
        /// Target workflow id
        workflow_id: String,
        /// Target run, `None` for the current run
        run_id: Option<String>,
    },
    /// Signal another workflow
    SignalExternalWorkflowExecution {
        /// Target domain
        domain: String,
        /// Target workflow id
        workflow_id: String,
        /// Target run, `None` for the current run
        run_id: Option<String>,
        /// Signal name
        signal_name: String,
        /// Signal payload
        input: Payload,
    },
    /// Start a child workflow
    StartChildWorkflowExecution {
        /// Child domain
        domain: String,
        /// Child workflow id
        workflow_id: String,
        /// Child workflow type
        workflow_type: String,
        /// Child task list, defaults to the parent task list
        task_list: Option<String>,
        /// Child input
        input: Payload,
    },
}

impl Decision {
    /// True for decisions that close the run
    pub fn closes_workflow(&self) -> bool {
        matches!(
            self,
            Decision::CompleteWorkflowExecution { .. }
                | Decision::FailWorkflowExecution { .. }
                | Decision::CancelWorkflowExecution { .. }
        )
    }
}

/// Reason a batch of decisions was rejected before any was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRejection {
    /// Cause recorded on the DecisionTaskFailed event
    pub cause: DecisionTaskFailedCause,
    /// Human readable detail
    pub message: String,
}

impl DecisionRejection {
    pub(crate) fn new(cause: DecisionTaskFailedCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }
}
