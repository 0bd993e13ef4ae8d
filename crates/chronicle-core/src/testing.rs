//! History builders for tests
//!
//! [`TestWorkflow`] drives a [`MutableState`] through the same `add_*`
//! operations the engine uses and keeps the produced history, so tests can
//! hand a realistic snapshot or event list to a store.

use crate::domain::events::{HistoryEvent, WorkflowExecutionStartedAttributes};
use crate::domain::execution::{
    DomainId, TaskList, WorkflowExecution, WorkflowIdReusePolicy, WorkflowStatus, EMPTY_VERSION,
};
use crate::domain::mutable_state::{MutableState, MutableStateSnapshot, ScheduleActivityAttributes};
use crate::CoreError;

/// Task list used by test workflows
pub const TEST_TASK_LIST: &str = "testTaskList";

/// Identity used by test workers
pub const TEST_IDENTITY: &str = "testIdentity";

/// Request id that started test workflows
pub const TEST_START_REQUEST_ID: &str = "test-start-request";

/// Builder of a workflow run and its history
#[derive(Debug, Clone)]
pub struct TestWorkflow {
    state: MutableState,
    history: Vec<HistoryEvent>,
}

impl TestWorkflow {
    /// Run with only the started event
    pub fn started(domain_id: &DomainId, execution: &WorkflowExecution) -> Result<Self, CoreError> {
        Self::started_with_request_id(domain_id, execution, TEST_START_REQUEST_ID)
    }

    /// Run with only the started event, created by `request_id`
    pub fn started_with_request_id(
        domain_id: &DomainId,
        execution: &WorkflowExecution,
        request_id: &str,
    ) -> Result<Self, CoreError> {
        let mut workflow = Self {
            state: MutableState::new(domain_id.clone(), execution, EMPTY_VERSION),
            history: Vec::new(),
        };
        workflow
            .state
            .add_workflow_execution_started_event(WorkflowExecutionStartedAttributes {
                workflow_type: "wType".to_string(),
                task_list: TaskList::normal(TEST_TASK_LIST),
                input: b"input".to_vec(),
                execution_start_to_close_timeout_seconds: 100,
                task_start_to_close_timeout_seconds: 200,
                identity: TEST_IDENTITY.to_string(),
                request_id: request_id.to_string(),
                workflow_id_reuse_policy: WorkflowIdReusePolicy::AllowDuplicateFailedOnly,
                continued_execution_run_id: None,
                parent_workflow_id: None,
                parent_run_id: None,
            })?;
        workflow.flush();
        Ok(workflow)
    }

    /// Run with the started event and a scheduled first decision (schedule id 2)
    pub fn with_pending_decision(
        domain_id: &DomainId,
        execution: &WorkflowExecution,
    ) -> Result<Self, CoreError> {
        let mut workflow = Self::started(domain_id, execution)?;
        workflow.schedule_decision()?;
        Ok(workflow)
    }

    fn flush(&mut self) {
        let events = self.state.take_new_events();
        self.history.extend(events);
        self.state.commit();
    }

    /// Schedule a decision; returns its schedule id
    pub fn schedule_decision(&mut self) -> Result<i64, CoreError> {
        let decision = self.state.add_decision_task_scheduled_event()?;
        self.flush();
        Ok(decision.schedule_id)
    }

    /// Start a decision from the normal task list; returns its started id
    pub fn start_decision(&mut self, schedule_id: i64, request_id: &str) -> Result<i64, CoreError> {
        self.start_decision_on(schedule_id, &TaskList::normal(TEST_TASK_LIST), request_id)
    }

    /// Start a decision from the given poll task list; returns its started id
    pub fn start_decision_on(
        &mut self,
        schedule_id: i64,
        poll_task_list: &TaskList,
        request_id: &str,
    ) -> Result<i64, CoreError> {
        let decision = self.state.add_decision_task_started_event(
            schedule_id,
            request_id.to_string(),
            poll_task_list,
            TEST_IDENTITY.to_string(),
        )?;
        self.flush();
        Ok(decision.started_id)
    }

    /// Complete a started decision; returns the completed event id
    pub fn complete_decision(&mut self, schedule_id: i64, started_id: i64) -> Result<i64, CoreError> {
        let event = self.state.add_decision_task_completed_event(
            schedule_id,
            started_id,
            TEST_IDENTITY.to_string(),
            None,
        )?;
        self.flush();
        Ok(event.event_id)
    }

    /// Schedule an activity; returns its schedule id
    pub fn schedule_activity(&mut self, decision_completed_id: i64, activity_id: &str) -> Result<i64, CoreError> {
        let activity = self.state.add_activity_task_scheduled_event(
            decision_completed_id,
            ScheduleActivityAttributes {
                activity_id: activity_id.to_string(),
                activity_type: "activity_type".to_string(),
                task_list: TEST_TASK_LIST.to_string(),
                input: b"activity-input".to_vec(),
                schedule_to_close_timeout_seconds: 100,
                schedule_to_start_timeout_seconds: 10,
                start_to_close_timeout_seconds: 50,
                heartbeat_timeout_seconds: 5,
            },
        )?;
        self.flush();
        Ok(activity.schedule_id)
    }

    /// Start a scheduled activity; returns its started id
    pub fn start_activity(&mut self, schedule_id: i64, request_id: &str) -> Result<i64, CoreError> {
        let activity = self.state.add_activity_task_started_event(
            schedule_id,
            request_id.to_string(),
            TEST_IDENTITY.to_string(),
        )?;
        self.flush();
        Ok(activity.started_id)
    }

    /// Start a user timer
    pub fn start_timer(&mut self, decision_completed_id: i64, timer_id: &str, seconds: i64) -> Result<(), CoreError> {
        self.state
            .add_timer_started_event(decision_completed_id, timer_id.to_string(), seconds)?;
        self.flush();
        Ok(())
    }

    /// Close the run with the given terminal status
    pub fn close(&mut self, status: WorkflowStatus) -> Result<(), CoreError> {
        let last = self.state.next_event_id() - 1;
        match status {
            WorkflowStatus::Completed => {
                self.state.add_workflow_execution_completed_event(last, Vec::new())?;
            }
            WorkflowStatus::Failed => {
                self.state
                    .add_workflow_execution_failed_event(last, "failed".to_string(), Vec::new())?;
            }
            WorkflowStatus::Canceled => {
                self.state.add_workflow_execution_canceled_event(last, Vec::new())?;
            }
            WorkflowStatus::Terminated => {
                self.state.add_workflow_execution_terminated_event(
                    "terminated".to_string(),
                    Vec::new(),
                    TEST_IDENTITY.to_string(),
                )?;
            }
            WorkflowStatus::TimedOut => {
                self.state.add_workflow_execution_timed_out_event()?;
            }
            other => {
                return Err(CoreError::InvalidStateTransition(format!(
                    "{:?} is not a close status",
                    other
                )))
            }
        }
        self.flush();
        Ok(())
    }

    /// Route decisions to a sticky task list
    pub fn set_sticky(&mut self, task_list: &str, schedule_to_start_timeout_secs: i32) {
        self.state.set_sticky_task_list(task_list, schedule_to_start_timeout_secs);
    }

    /// The aggregate
    pub fn state(&self) -> &MutableState {
        &self.state
    }

    /// Persisted form of the aggregate
    pub fn snapshot(&self) -> MutableStateSnapshot {
        self.state.to_snapshot()
    }

    /// Every event produced so far
    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    /// Next event id of the run
    pub fn next_event_id(&self) -> i64 {
        self.state.next_event_id()
    }
}
