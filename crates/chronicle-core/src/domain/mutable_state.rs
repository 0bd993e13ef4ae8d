//! Mutable state aggregate
//!
//! The in-memory state of one workflow run. Every transition goes through
//! [`MutableState::apply_event`]: replay folds stored events through it and
//! the live `add_*` operations build the next event, apply it, and buffer
//! it for persistence. Both paths therefore derive identical state, with one
//! exception: sticky routing follows the worker that polled last and is never
//! recorded in history, so a replayed run starts on its normal task list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::decision::DecisionInfo;
use super::events::{
    DecisionTaskFailedCause, EventAttributes, HistoryEvent, Payload, TimeoutType,
    WorkflowExecutionStartedAttributes,
};
use super::execution::{
    DomainId, ExecutionInfo, TaskList, WorkflowExecution, WorkflowStatus,
    EMPTY_EVENT_ID, EMPTY_VERSION, FIRST_EVENT_ID,
};
use super::query_registry::QueryRegistry;
use crate::CoreError;

/// Reason recorded on queries that were open when the run closed
pub const QUERY_FAILED_WORKFLOW_CLOSED: &str = "workflow execution closed before the query was answered";

/// A scheduled or started activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// Version of the scheduled event
    pub version: i64,
    /// Event id of ActivityTaskScheduled
    pub schedule_id: i64,
    /// The scheduled event, handed to the worker on start
    pub scheduled_event: HistoryEvent,
    /// Workflow scoped activity id
    pub activity_id: String,
    /// Activity type name
    pub activity_type: String,
    /// Task list the activity is dispatched to
    pub task_list: String,
    /// Event id of ActivityTaskStarted, `EMPTY_EVENT_ID` while unstarted
    pub started_id: i64,
    /// When the activity was started
    pub started_timestamp: Option<DateTime<Utc>>,
    /// Poll request id that started the activity
    pub request_id: Option<String>,
    /// Identity of the worker that started the activity
    pub started_identity: Option<String>,
    /// Attempt number
    pub attempt: i32,
    /// Overall timeout
    pub schedule_to_close_timeout_secs: i32,
    /// Dispatch timeout
    pub schedule_to_start_timeout_secs: i32,
    /// Execution timeout
    pub start_to_close_timeout_secs: i32,
    /// Heartbeat timeout
    pub heartbeat_timeout_secs: i32,
    /// Last heartbeat details
    pub details: Option<Payload>,
}

impl ActivityInfo {
    /// True once a worker picked the activity up
    #[inline]
    pub fn is_started(&self) -> bool {
        self.started_id != EMPTY_EVENT_ID
    }
}

/// A pending user timer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerInfo {
    /// Version of the started event
    pub version: i64,
    /// Workflow scoped timer id
    pub timer_id: String,
    /// Event id of TimerStarted
    pub started_id: i64,
    /// When the timer is due
    pub expiry_timestamp: DateTime<Utc>,
}

/// A child workflow initiated by this run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    /// Version of the initiated event
    pub version: i64,
    /// Event id of StartChildWorkflowExecutionInitiated
    pub initiated_id: i64,
    /// Event id of ChildWorkflowExecutionStarted, `EMPTY_EVENT_ID` until started
    pub started_id: i64,
    /// Child domain
    pub domain: String,
    /// Child workflow id
    pub workflow_id: String,
    /// Child workflow type
    pub workflow_type: String,
    /// Child run id once started
    pub run_id: Option<String>,
}

/// An outstanding cancel request to another workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCancelInfo {
    /// Version of the initiated event
    pub version: i64,
    /// Event id of the initiated event
    pub initiated_id: i64,
    /// Target domain
    pub domain: String,
    /// Target workflow id
    pub workflow_id: String,
    /// Target run id
    pub run_id: Option<String>,
}

/// An outstanding signal to another workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInfo {
    /// Version of the initiated event
    pub version: i64,
    /// Event id of the initiated event
    pub initiated_id: i64,
    /// Target domain
    pub domain: String,
    /// Target workflow id
    pub workflow_id: String,
    /// Target run id
    pub run_id: Option<String>,
    /// Signal name
    pub signal_name: String,
    /// Signal payload
    pub input: Payload,
}

/// Failover versions of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    /// Version stamped on new events
    pub current_version: i64,
    /// Version of the last event applied
    pub last_write_version: i64,
}

impl Default for VersionHistory {
    fn default() -> Self {
        Self {
            current_version: EMPTY_VERSION,
            last_write_version: EMPTY_VERSION,
        }
    }
}

/// Persisted form of the aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutableStateSnapshot {
    /// Execution metadata
    pub execution_info: ExecutionInfo,
    /// The pending decision, if any
    pub pending_decision: Option<DecisionInfo>,
    /// Attempt number of the next decision
    pub decision_attempt: i64,
    /// Scheduled time of the first attempt of the current decision chain
    pub decision_original_scheduled_timestamp: Option<DateTime<Utc>>,
    /// Pending activities keyed by schedule id
    pub activities: BTreeMap<i64, ActivityInfo>,
    /// Pending timers keyed by timer id
    pub timers: BTreeMap<String, TimerInfo>,
    /// Pending children keyed by initiated id
    pub children: BTreeMap<i64, ChildExecutionInfo>,
    /// Pending external cancel requests keyed by initiated id
    pub request_cancels: BTreeMap<i64, RequestCancelInfo>,
    /// Pending external signals keyed by initiated id
    pub signals: BTreeMap<i64, SignalInfo>,
    /// Request ids of signals already applied
    pub signal_requested_ids: BTreeSet<String>,
    /// Failover versions
    pub version_history: VersionHistory,
    /// Task id of the last applied event, marks batch boundaries
    pub last_event_task_id: i64,
}

impl MutableStateSnapshot {
    /// Blank snapshot for a run with no events
    pub fn new(domain_id: DomainId, execution: &WorkflowExecution, current_version: i64) -> Self {
        Self {
            execution_info: ExecutionInfo::new(domain_id, execution),
            pending_decision: None,
            decision_attempt: 0,
            decision_original_scheduled_timestamp: None,
            activities: BTreeMap::new(),
            timers: BTreeMap::new(),
            children: BTreeMap::new(),
            request_cancels: BTreeMap::new(),
            signals: BTreeMap::new(),
            signal_requested_ids: BTreeSet::new(),
            version_history: VersionHistory {
                current_version,
                last_write_version: EMPTY_VERSION,
            },
            last_event_task_id: 0,
        }
    }
}

/// Attributes of an activity being scheduled
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleActivityAttributes {
    /// Workflow scoped activity id
    pub activity_id: String,
    /// Activity type name
    pub activity_type: String,
    /// Task list the activity is dispatched to
    pub task_list: String,
    /// Activity input
    pub input: Payload,
    /// Overall timeout
    pub schedule_to_close_timeout_seconds: i32,
    /// Dispatch timeout
    pub schedule_to_start_timeout_seconds: i32,
    /// Execution timeout
    pub start_to_close_timeout_seconds: i32,
    /// Heartbeat timeout
    pub heartbeat_timeout_seconds: i32,
}

/// Aggregate: one workflow run
#[derive(Debug, Clone)]
pub struct MutableState {
    snapshot: MutableStateSnapshot,
    update_condition: i64,
    committed_transaction_id: i64,
    new_events: Vec<HistoryEvent>,
    transaction_task_id: i64,
    sticky_ttl: Option<Duration>,
    query_registry: QueryRegistry,
}

impl MutableState {
    /// Empty state for a run that has no events yet
    pub fn new(domain_id: DomainId, execution: &WorkflowExecution, current_version: i64) -> Self {
        Self::from_snapshot(MutableStateSnapshot::new(domain_id, execution, current_version))
    }

    /// Rehydrate a persisted snapshot
    pub fn from_snapshot(snapshot: MutableStateSnapshot) -> Self {
        let update_condition = snapshot.execution_info.next_event_id;
        let committed_transaction_id = snapshot.last_event_task_id;
        Self {
            snapshot,
            update_condition,
            committed_transaction_id,
            new_events: Vec::new(),
            transaction_task_id: 0,
            sticky_ttl: None,
            query_registry: QueryRegistry::new(),
        }
    }

    /// Rebuild a run from its stored history
    pub fn replay(
        domain_id: DomainId,
        execution: &WorkflowExecution,
        events: &[HistoryEvent],
    ) -> Result<Self, CoreError> {
        let version = events.last().map(|e| e.version).unwrap_or(EMPTY_VERSION);
        let mut state = Self::new(domain_id, execution, version);
        for event in events {
            state.apply_event(event)?;
        }
        state.update_condition = state.next_event_id();
        state.committed_transaction_id = state.snapshot.last_event_task_id;
        Ok(state)
    }

    // ----- snapshotting -----

    /// Borrow the persisted part
    pub fn snapshot(&self) -> &MutableStateSnapshot {
        &self.snapshot
    }

    /// Copy of the persisted part
    pub fn to_snapshot(&self) -> MutableStateSnapshot {
        self.snapshot.clone()
    }

    /// Events appended since the last commit
    pub fn new_events(&self) -> &[HistoryEvent] {
        &self.new_events
    }

    /// Drain events appended since the last commit
    pub fn take_new_events(&mut self) -> Vec<HistoryEvent> {
        std::mem::take(&mut self.new_events)
    }

    /// Mark the current state as persisted
    pub fn commit(&mut self) {
        self.new_events.clear();
        self.update_condition = self.snapshot.execution_info.next_event_id;
        self.committed_transaction_id = self.snapshot.last_event_task_id;
    }

    /// `next_event_id` the store holds for this run
    pub fn update_condition(&self) -> i64 {
        self.update_condition
    }

    /// Transaction id of the last history batch the store holds for this run
    pub fn committed_transaction_id(&self) -> i64 {
        self.committed_transaction_id
    }

    /// Version stamped on new events
    pub fn set_current_version(&mut self, version: i64) {
        self.snapshot.version_history.current_version = version;
    }

    /// Task id stamped on the next batch of events
    pub fn set_transaction_task_id(&mut self, task_id: i64) {
        self.transaction_task_id = task_id;
    }

    // ----- derived state -----

    /// Execution metadata
    pub fn execution_info(&self) -> &ExecutionInfo {
        &self.snapshot.execution_info
    }

    /// Execution identity
    pub fn execution(&self) -> WorkflowExecution {
        self.snapshot.execution_info.execution()
    }

    /// Id of the next event to append
    #[inline]
    pub fn next_event_id(&self) -> i64 {
        self.snapshot.execution_info.next_event_id
    }

    /// Started id of the last completed decision, `None` before the first
    pub fn previous_started_event_id(&self) -> Option<i64> {
        match self.snapshot.execution_info.last_processed_event_id {
            EMPTY_EVENT_ID => None,
            id => Some(id),
        }
    }

    /// Version of the last event applied
    pub fn last_write_version(&self) -> i64 {
        self.snapshot.version_history.last_write_version
    }

    /// History branch of this run
    pub fn current_branch_token(&self) -> &[u8] {
        &self.snapshot.execution_info.branch_token
    }

    /// True while the run accepts new events
    #[inline]
    pub fn is_workflow_running(&self) -> bool {
        self.snapshot.execution_info.status == WorkflowStatus::Running
    }

    /// True once a cancel was requested
    pub fn is_cancel_requested(&self) -> bool {
        self.snapshot.execution_info.cancel_requested
    }

    /// True when a signal with this request id was already applied
    pub fn is_signal_requested(&self, request_id: &str) -> bool {
        self.snapshot.signal_requested_ids.contains(request_id)
    }

    /// The pending decision
    pub fn pending_decision(&self) -> Option<&DecisionInfo> {
        self.snapshot.pending_decision.as_ref()
    }

    /// True when a decision is scheduled or started
    pub fn has_pending_decision(&self) -> bool {
        self.snapshot.pending_decision.is_some()
    }

    /// True when a decision is started
    pub fn has_in_flight_decision(&self) -> bool {
        self.snapshot
            .pending_decision
            .as_ref()
            .map(|d| d.is_started())
            .unwrap_or(false)
    }

    /// A pending activity by schedule id
    pub fn pending_activity(&self, schedule_id: i64) -> Option<&ActivityInfo> {
        self.snapshot.activities.get(&schedule_id)
    }

    /// All pending activities
    pub fn pending_activities(&self) -> &BTreeMap<i64, ActivityInfo> {
        &self.snapshot.activities
    }

    /// True when an activity with this id is pending
    pub fn has_pending_activity_id(&self, activity_id: &str) -> bool {
        self.snapshot
            .activities
            .values()
            .any(|a| a.activity_id == activity_id)
    }

    /// A pending timer by id
    pub fn pending_timer(&self, timer_id: &str) -> Option<&TimerInfo> {
        self.snapshot.timers.get(timer_id)
    }

    /// All pending timers
    pub fn pending_timers(&self) -> &BTreeMap<String, TimerInfo> {
        &self.snapshot.timers
    }

    /// All pending children
    pub fn pending_children(&self) -> &BTreeMap<i64, ChildExecutionInfo> {
        &self.snapshot.children
    }

    /// All pending external cancel requests
    pub fn pending_request_cancels(&self) -> &BTreeMap<i64, RequestCancelInfo> {
        &self.snapshot.request_cancels
    }

    /// All pending external signals
    pub fn pending_signals(&self) -> &BTreeMap<i64, SignalInfo> {
        &self.snapshot.signals
    }

    /// Queries waiting on this run
    pub fn query_registry(&self) -> &QueryRegistry {
        &self.query_registry
    }

    /// Mutable access to the query registry
    pub fn query_registry_mut(&mut self) -> &mut QueryRegistry {
        &mut self.query_registry
    }

    /// Swap in a registry carried over from a discarded copy of this run
    pub fn replace_query_registry(&mut self, registry: QueryRegistry) -> QueryRegistry {
        std::mem::replace(&mut self.query_registry, registry)
    }

    // ----- stickiness -----

    /// Stickiness lapses once the run has been idle longer than `ttl`
    pub fn set_sticky_ttl(&mut self, ttl: Option<Duration>) {
        self.sticky_ttl = ttl;
    }

    /// True when decisions go to a worker specific task list
    pub fn is_sticky_task_list_enabled(&self) -> bool {
        let info = &self.snapshot.execution_info;
        let named = info
            .sticky_task_list
            .as_deref()
            .map(|name| !name.is_empty())
            .unwrap_or(false);
        if !named {
            return false;
        }
        match (self.sticky_ttl, info.last_updated_timestamp) {
            // A timestamp in the future gives a negative age, which never expires
            (Some(ttl), Some(updated)) => (Utc::now() - updated)
                .to_std()
                .map(|idle| idle <= ttl)
                .unwrap_or(true),
            _ => true,
        }
    }

    /// Route future decisions to a worker specific task list
    pub fn set_sticky_task_list(&mut self, task_list: impl Into<String>, schedule_to_start_timeout_secs: i32) {
        let info = &mut self.snapshot.execution_info;
        info.sticky_task_list = Some(task_list.into());
        info.sticky_schedule_to_start_timeout_secs = Some(schedule_to_start_timeout_secs);
    }

    /// Route future decisions to the normal task list
    pub fn clear_stickiness(&mut self) {
        let info = &mut self.snapshot.execution_info;
        info.sticky_task_list = None;
        info.sticky_schedule_to_start_timeout_secs = None;
    }

    // ----- reducer -----

    /// Apply one event; the only place state transitions happen
    pub fn apply_event(&mut self, event: &HistoryEvent) -> Result<(), CoreError> {
        let expected = self.next_event_id();
        if event.event_id != expected {
            return Err(CoreError::InvalidStateTransition(format!(
                "event id {} does not follow next event id {}",
                event.event_id, expected
            )));
        }
        if !matches!(event.attributes, EventAttributes::WorkflowExecutionStarted(_)) {
            self.require_running(event)?;
        }

        let id = event.event_id;
        let ts = event.timestamp;
        let version = event.version;
        let s = &mut self.snapshot;

        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted(attrs) => {
                if s.execution_info.status != WorkflowStatus::Created || id != FIRST_EVENT_ID {
                    return Err(invalid("workflow execution already started"));
                }
                let info = &mut s.execution_info;
                info.workflow_type = attrs.workflow_type.clone();
                info.task_list = attrs.task_list.name.clone();
                info.execution_timeout_secs = attrs.execution_start_to_close_timeout_seconds;
                info.decision_timeout_secs = attrs.task_start_to_close_timeout_seconds;
                info.start_request_id = attrs.request_id.clone();
                info.identity = attrs.identity.clone();
                info.status = WorkflowStatus::Running;
                info.start_timestamp = Some(ts);
            }

            EventAttributes::DecisionTaskScheduled {
                task_list,
                start_to_close_timeout_seconds,
                attempt,
            } => {
                if s.pending_decision.is_some() {
                    return Err(invalid("a decision task is already pending"));
                }
                let original = match s.decision_original_scheduled_timestamp {
                    Some(original) if *attempt > 0 => original,
                    _ => ts,
                };
                s.decision_original_scheduled_timestamp = Some(original);
                s.decision_attempt = *attempt;
                s.pending_decision = Some(DecisionInfo {
                    version,
                    schedule_id: id,
                    started_id: EMPTY_EVENT_ID,
                    request_id: None,
                    task_list: task_list.name.clone(),
                    kind: task_list.kind,
                    attempt: *attempt,
                    start_to_close_timeout_secs: *start_to_close_timeout_seconds,
                    scheduled_timestamp: ts,
                    started_timestamp: None,
                    original_scheduled_timestamp: original,
                });
            }

            EventAttributes::DecisionTaskStarted {
                scheduled_event_id,
                request_id,
                ..
            } => {
                let decision = match s.pending_decision.as_mut() {
                    Some(d) if d.schedule_id == *scheduled_event_id && !d.is_started() => d,
                    _ => return Err(invalid("no scheduled decision to start")),
                };
                decision.started_id = id;
                decision.request_id = Some(request_id.clone());
                decision.started_timestamp = Some(ts);
            }

            EventAttributes::DecisionTaskCompleted {
                scheduled_event_id,
                started_event_id,
                execution_context,
                ..
            } => {
                match s.pending_decision.as_ref() {
                    Some(d) if d.schedule_id == *scheduled_event_id && d.started_id == *started_event_id => {}
                    _ => return Err(invalid("no started decision to complete")),
                }
                s.pending_decision = None;
                s.decision_attempt = 0;
                s.decision_original_scheduled_timestamp = None;
                s.execution_info.last_processed_event_id = *started_event_id;
                if let Some(context) = execution_context {
                    s.execution_info.execution_context = Some(context.clone());
                }
            }

            EventAttributes::DecisionTaskFailed {
                scheduled_event_id,
                started_event_id,
                ..
            } => {
                match s.pending_decision.as_ref() {
                    Some(d) if d.schedule_id == *scheduled_event_id && d.started_id == *started_event_id => {}
                    _ => return Err(invalid("no started decision to fail")),
                }
                s.pending_decision = None;
                s.decision_attempt += 1;
            }

            EventAttributes::DecisionTaskTimedOut {
                scheduled_event_id,
                started_event_id,
                timeout_type,
            } => {
                match s.pending_decision.as_ref() {
                    Some(d) if d.schedule_id == *scheduled_event_id && d.started_id == *started_event_id => {}
                    _ => return Err(invalid("no matching decision to time out")),
                }
                s.pending_decision = None;
                s.decision_attempt += 1;
                if *timeout_type == TimeoutType::ScheduleToStart {
                    s.execution_info.sticky_task_list = None;
                    s.execution_info.sticky_schedule_to_start_timeout_secs = None;
                }
            }

            EventAttributes::ActivityTaskScheduled {
                activity_id,
                activity_type,
                task_list,
                schedule_to_close_timeout_seconds,
                schedule_to_start_timeout_seconds,
                start_to_close_timeout_seconds,
                heartbeat_timeout_seconds,
                ..
            } => {
                if s.activities.values().any(|a| &a.activity_id == activity_id) {
                    return Err(invalid(format!("activity {} is already pending", activity_id)));
                }
                s.activities.insert(
                    id,
                    ActivityInfo {
                        version,
                        schedule_id: id,
                        scheduled_event: event.clone(),
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        task_list: task_list.name.clone(),
                        started_id: EMPTY_EVENT_ID,
                        started_timestamp: None,
                        request_id: None,
                        started_identity: None,
                        attempt: 0,
                        schedule_to_close_timeout_secs: *schedule_to_close_timeout_seconds,
                        schedule_to_start_timeout_secs: *schedule_to_start_timeout_seconds,
                        start_to_close_timeout_secs: *start_to_close_timeout_seconds,
                        heartbeat_timeout_secs: *heartbeat_timeout_seconds,
                        details: None,
                    },
                );
            }

            EventAttributes::ActivityTaskStarted {
                scheduled_event_id,
                identity,
                request_id,
                attempt,
            } => {
                let activity = match s.activities.get_mut(scheduled_event_id) {
                    Some(a) if !a.is_started() => a,
                    _ => return Err(invalid("no scheduled activity to start")),
                };
                activity.started_id = id;
                activity.started_timestamp = Some(ts);
                activity.request_id = Some(request_id.clone());
                activity.started_identity = Some(identity.clone());
                activity.attempt = *attempt;
            }

            EventAttributes::ActivityTaskCompleted {
                scheduled_event_id,
                started_event_id,
                ..
            }
            | EventAttributes::ActivityTaskFailed {
                scheduled_event_id,
                started_event_id,
                ..
            } => {
                match s.activities.get(scheduled_event_id) {
                    Some(a) if a.is_started() && a.started_id == *started_event_id => {}
                    _ => return Err(invalid("no started activity to close")),
                }
                s.activities.remove(scheduled_event_id);
            }

            EventAttributes::ActivityTaskTimedOut { scheduled_event_id, .. } => {
                if s.activities.remove(scheduled_event_id).is_none() {
                    return Err(invalid("no pending activity to time out"));
                }
            }

            EventAttributes::TimerStarted {
                timer_id,
                start_to_fire_timeout_seconds,
                ..
            } => {
                if s.timers.contains_key(timer_id) {
                    return Err(invalid(format!("timer {} is already pending", timer_id)));
                }
                let expiry_timestamp = chrono::Duration::try_seconds(*start_to_fire_timeout_seconds)
                    .and_then(|delay| ts.checked_add_signed(delay))
                    .ok_or_else(|| {
                        invalid(format!(
                            "timer {} fires {}s out, past the representable time range",
                            timer_id, start_to_fire_timeout_seconds
                        ))
                    })?;
                s.timers.insert(
                    timer_id.clone(),
                    TimerInfo {
                        version,
                        timer_id: timer_id.clone(),
                        started_id: id,
                        expiry_timestamp,
                    },
                );
            }

            EventAttributes::TimerFired { timer_id, .. } | EventAttributes::TimerCanceled { timer_id, .. } => {
                if s.timers.remove(timer_id).is_none() {
                    return Err(invalid(format!("timer {} is not pending", timer_id)));
                }
            }

            EventAttributes::MarkerRecorded { .. } => {}

            EventAttributes::WorkflowExecutionSignaled { request_id, .. } => {
                s.execution_info.signal_count += 1;
                if let Some(request_id) = request_id {
                    s.signal_requested_ids.insert(request_id.clone());
                }
            }

            EventAttributes::WorkflowExecutionCancelRequested { request_id, .. } => {
                s.execution_info.cancel_requested = true;
                s.execution_info.cancel_request_id = request_id.clone();
            }

            EventAttributes::WorkflowExecutionCompleted { .. } => {
                close(s, WorkflowStatus::Completed, ts);
            }
            EventAttributes::WorkflowExecutionFailed { .. } => {
                close(s, WorkflowStatus::Failed, ts);
            }
            EventAttributes::WorkflowExecutionCanceled { .. } => {
                close(s, WorkflowStatus::Canceled, ts);
            }
            EventAttributes::WorkflowExecutionTerminated { .. } => {
                close(s, WorkflowStatus::Terminated, ts);
            }
            EventAttributes::WorkflowExecutionTimedOut => {
                close(s, WorkflowStatus::TimedOut, ts);
            }

            EventAttributes::StartChildWorkflowExecutionInitiated {
                domain,
                workflow_id,
                workflow_type,
                ..
            } => {
                s.children.insert(
                    id,
                    ChildExecutionInfo {
                        version,
                        initiated_id: id,
                        started_id: EMPTY_EVENT_ID,
                        domain: domain.clone(),
                        workflow_id: workflow_id.clone(),
                        workflow_type: workflow_type.clone(),
                        run_id: None,
                    },
                );
            }

            EventAttributes::ChildWorkflowExecutionStarted {
                initiated_event_id,
                run_id,
                ..
            } => {
                let child = match s.children.get_mut(initiated_event_id) {
                    Some(c) if c.started_id == EMPTY_EVENT_ID => c,
                    _ => return Err(invalid("no initiated child workflow to start")),
                };
                child.started_id = id;
                child.run_id = Some(run_id.clone());
            }

            EventAttributes::ChildWorkflowExecutionCompleted { initiated_event_id, .. }
            | EventAttributes::ChildWorkflowExecutionFailed { initiated_event_id, .. } => {
                match s.children.get(initiated_event_id) {
                    Some(c) if c.started_id != EMPTY_EVENT_ID => {}
                    _ => return Err(invalid("no started child workflow to close")),
                }
                s.children.remove(initiated_event_id);
            }

            EventAttributes::RequestCancelExternalWorkflowExecutionInitiated {
                domain,
                workflow_id,
                run_id,
                ..
            } => {
                s.request_cancels.insert(
                    id,
                    RequestCancelInfo {
                        version,
                        initiated_id: id,
                        domain: domain.clone(),
                        workflow_id: workflow_id.clone(),
                        run_id: run_id.clone(),
                    },
                );
            }

            EventAttributes::ExternalWorkflowExecutionCancelRequested { initiated_event_id, .. } => {
                if s.request_cancels.remove(initiated_event_id).is_none() {
                    return Err(invalid("no pending external cancel request"));
                }
            }

            EventAttributes::SignalExternalWorkflowExecutionInitiated {
                domain,
                workflow_id,
                run_id,
                signal_name,
                input,
                ..
            } => {
                s.signals.insert(
                    id,
                    SignalInfo {
                        version,
                        initiated_id: id,
                        domain: domain.clone(),
                        workflow_id: workflow_id.clone(),
                        run_id: run_id.clone(),
                        signal_name: signal_name.clone(),
                        input: input.clone(),
                    },
                );
            }

            EventAttributes::ExternalWorkflowExecutionSignaled { initiated_event_id, .. } => {
                if s.signals.remove(initiated_event_id).is_none() {
                    return Err(invalid("no pending external signal"));
                }
            }
        }

        let info = &mut s.execution_info;
        info.next_event_id = id + 1;
        info.last_updated_timestamp = Some(ts);
        s.version_history.last_write_version = version;
        if event.task_id != s.last_event_task_id {
            info.last_first_event_id = id;
            s.last_event_task_id = event.task_id;
        }

        if event.event_type().is_workflow_close() {
            self.query_registry.fail_all(QUERY_FAILED_WORKFLOW_CLOSED);
        }
        Ok(())
    }

    fn require_running(&self, event: &HistoryEvent) -> Result<(), CoreError> {
        if self.is_workflow_running() {
            Ok(())
        } else {
            Err(invalid(format!(
                "cannot apply {:?} to a workflow in status {:?}",
                event.event_type(),
                self.snapshot.execution_info.status
            )))
        }
    }

    fn append(&mut self, attributes: EventAttributes) -> Result<HistoryEvent, CoreError> {
        let event = HistoryEvent {
            event_id: self.next_event_id(),
            version: self.snapshot.version_history.current_version,
            task_id: self.transaction_task_id,
            timestamp: Utc::now(),
            attributes,
        };
        self.apply_event(&event)?;
        self.new_events.push(event.clone());
        Ok(event)
    }

    fn pending_decision_or_err(&self) -> Result<DecisionInfo, CoreError> {
        self.snapshot
            .pending_decision
            .clone()
            .ok_or_else(|| invalid("no pending decision"))
    }

    // ----- workflow lifecycle -----

    /// First event of a run
    pub fn add_workflow_execution_started_event(
        &mut self,
        attributes: WorkflowExecutionStartedAttributes,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::WorkflowExecutionStarted(attributes))
    }

    /// Close the run successfully
    pub fn add_workflow_execution_completed_event(
        &mut self,
        decision_task_completed_event_id: i64,
        result: Payload,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::WorkflowExecutionCompleted {
            result,
            decision_task_completed_event_id,
        })
    }

    /// Close the run with failure
    pub fn add_workflow_execution_failed_event(
        &mut self,
        decision_task_completed_event_id: i64,
        reason: String,
        details: Payload,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::WorkflowExecutionFailed {
            reason,
            details,
            decision_task_completed_event_id,
        })
    }

    /// Close the run as canceled
    pub fn add_workflow_execution_canceled_event(
        &mut self,
        decision_task_completed_event_id: i64,
        details: Payload,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::WorkflowExecutionCanceled {
            details,
            decision_task_completed_event_id,
        })
    }

    /// Close the run on operator request
    pub fn add_workflow_execution_terminated_event(
        &mut self,
        reason: String,
        details: Payload,
        identity: String,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::WorkflowExecutionTerminated {
            reason,
            details,
            identity,
        })
    }

    /// Close the run on its execution timeout
    pub fn add_workflow_execution_timed_out_event(&mut self) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::WorkflowExecutionTimedOut)
    }

    /// Deliver an external signal
    pub fn add_workflow_execution_signaled_event(
        &mut self,
        signal_name: String,
        input: Payload,
        identity: String,
        request_id: Option<String>,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::WorkflowExecutionSignaled {
            signal_name,
            input,
            identity,
            request_id,
        })
    }

    /// Deliver an external cancel request
    pub fn add_workflow_execution_cancel_requested_event(
        &mut self,
        cause: String,
        identity: String,
        request_id: Option<String>,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::WorkflowExecutionCancelRequested {
            cause,
            identity,
            request_id,
        })
    }

    // ----- decisions -----

    /// Schedule a decision on the sticky task list when enabled, else the normal one
    pub fn add_decision_task_scheduled_event(&mut self) -> Result<DecisionInfo, CoreError> {
        if self.has_pending_decision() {
            return Err(invalid("a decision task is already pending"));
        }
        let sticky = self.is_sticky_task_list_enabled();
        let info = &self.snapshot.execution_info;
        let task_list = match info.sticky_task_list.as_deref() {
            Some(name) if sticky => TaskList::sticky(name),
            _ => TaskList::normal(info.task_list.clone()),
        };
        let attributes = EventAttributes::DecisionTaskScheduled {
            task_list,
            start_to_close_timeout_seconds: info.decision_timeout_secs,
            attempt: self.snapshot.decision_attempt,
        };
        self.append(attributes)?;
        self.pending_decision_or_err()
    }

    /// Start the pending decision for a poll arriving on `poll_task_list`
    ///
    /// A poll from any task list other than the configured sticky one clears
    /// stickiness, so the next decision goes to the normal task list. So does
    /// stickiness that expired before the poll arrived.
    pub fn add_decision_task_started_event(
        &mut self,
        schedule_id: i64,
        request_id: String,
        poll_task_list: &TaskList,
        identity: String,
    ) -> Result<DecisionInfo, CoreError> {
        let sticky_matches = self.is_sticky_task_list_enabled()
            && self
                .snapshot
                .execution_info
                .sticky_task_list
                .as_deref()
                .map(|sticky| sticky == poll_task_list.name)
                .unwrap_or(false);
        self.append(EventAttributes::DecisionTaskStarted {
            scheduled_event_id: schedule_id,
            identity,
            request_id,
        })?;
        if !sticky_matches {
            self.clear_stickiness();
        }
        self.pending_decision_or_err()
    }

    /// Complete the started decision
    pub fn add_decision_task_completed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        identity: String,
        execution_context: Option<Payload>,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::DecisionTaskCompleted {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            identity,
            execution_context,
        })
    }

    /// Fail the started decision
    pub fn add_decision_task_failed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        cause: DecisionTaskFailedCause,
        details: Payload,
        identity: String,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::DecisionTaskFailed {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            cause,
            details,
            identity,
        })
    }

    /// Time out the pending decision
    pub fn add_decision_task_timed_out_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        timeout_type: TimeoutType,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::DecisionTaskTimedOut {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            timeout_type,
        })
    }

    // ----- activities -----

    /// Schedule an activity
    pub fn add_activity_task_scheduled_event(
        &mut self,
        decision_task_completed_event_id: i64,
        attributes: ScheduleActivityAttributes,
    ) -> Result<ActivityInfo, CoreError> {
        let event = self.append(EventAttributes::ActivityTaskScheduled {
            activity_id: attributes.activity_id,
            activity_type: attributes.activity_type,
            task_list: TaskList::normal(attributes.task_list),
            input: attributes.input,
            schedule_to_close_timeout_seconds: attributes.schedule_to_close_timeout_seconds,
            schedule_to_start_timeout_seconds: attributes.schedule_to_start_timeout_seconds,
            start_to_close_timeout_seconds: attributes.start_to_close_timeout_seconds,
            heartbeat_timeout_seconds: attributes.heartbeat_timeout_seconds,
            decision_task_completed_event_id,
        })?;
        self.pending_activity(event.event_id)
            .cloned()
            .ok_or_else(|| invalid("scheduled activity missing after apply"))
    }

    /// Start a scheduled activity
    pub fn add_activity_task_started_event(
        &mut self,
        schedule_id: i64,
        request_id: String,
        identity: String,
    ) -> Result<ActivityInfo, CoreError> {
        let attempt = self
            .pending_activity(schedule_id)
            .map(|a| a.attempt)
            .unwrap_or_default();
        self.append(EventAttributes::ActivityTaskStarted {
            scheduled_event_id: schedule_id,
            identity,
            request_id,
            attempt,
        })?;
        self.pending_activity(schedule_id)
            .cloned()
            .ok_or_else(|| invalid("started activity missing after apply"))
    }

    /// Complete a started activity
    pub fn add_activity_task_completed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        result: Payload,
        identity: String,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::ActivityTaskCompleted {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            result,
            identity,
        })
    }

    /// Fail a started activity
    pub fn add_activity_task_failed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        reason: String,
        details: Payload,
        identity: String,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::ActivityTaskFailed {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            reason,
            details,
            identity,
        })
    }

    /// Time out a pending activity
    pub fn add_activity_task_timed_out_event(
        &mut self,
        schedule_id: i64,
        timeout_type: TimeoutType,
    ) -> Result<HistoryEvent, CoreError> {
        let started_id = self
            .pending_activity(schedule_id)
            .map(|a| a.started_id)
            .unwrap_or(EMPTY_EVENT_ID);
        self.append(EventAttributes::ActivityTaskTimedOut {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            timeout_type,
        })
    }

    // ----- timers and markers -----

    /// Start a user timer
    pub fn add_timer_started_event(
        &mut self,
        decision_task_completed_event_id: i64,
        timer_id: String,
        start_to_fire_timeout_seconds: i64,
    ) -> Result<TimerInfo, CoreError> {
        let key = timer_id.clone();
        self.append(EventAttributes::TimerStarted {
            timer_id,
            start_to_fire_timeout_seconds,
            decision_task_completed_event_id,
        })?;
        self.pending_timer(&key)
            .cloned()
            .ok_or_else(|| invalid("started timer missing after apply"))
    }

    /// Fire a pending user timer
    pub fn add_timer_fired_event(&mut self, timer_id: &str) -> Result<HistoryEvent, CoreError> {
        let started_id = self
            .pending_timer(timer_id)
            .map(|t| t.started_id)
            .ok_or_else(|| invalid(format!("timer {} is not pending", timer_id)))?;
        self.append(EventAttributes::TimerFired {
            timer_id: timer_id.to_string(),
            started_event_id: started_id,
        })
    }

    /// Cancel a pending user timer
    pub fn add_timer_canceled_event(
        &mut self,
        decision_task_completed_event_id: i64,
        timer_id: &str,
        identity: String,
    ) -> Result<HistoryEvent, CoreError> {
        let started_id = self
            .pending_timer(timer_id)
            .map(|t| t.started_id)
            .ok_or_else(|| invalid(format!("timer {} is not pending", timer_id)))?;
        self.append(EventAttributes::TimerCanceled {
            timer_id: timer_id.to_string(),
            started_event_id: started_id,
            decision_task_completed_event_id,
            identity,
        })
    }

    /// Record a marker
    pub fn add_marker_recorded_event(
        &mut self,
        decision_task_completed_event_id: i64,
        marker_name: String,
        details: Payload,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::MarkerRecorded {
            marker_name,
            details,
            decision_task_completed_event_id,
        })
    }

    // ----- child workflows -----

    /// Request a child workflow start
    pub fn add_start_child_workflow_execution_initiated_event(
        &mut self,
        decision_task_completed_event_id: i64,
        domain: String,
        workflow_id: String,
        workflow_type: String,
        task_list: String,
        input: Payload,
    ) -> Result<ChildExecutionInfo, CoreError> {
        let event = self.append(EventAttributes::StartChildWorkflowExecutionInitiated {
            domain,
            workflow_id,
            workflow_type,
            task_list: TaskList::normal(task_list),
            input,
            decision_task_completed_event_id,
        })?;
        self.snapshot
            .children
            .get(&event.event_id)
            .cloned()
            .ok_or_else(|| invalid("initiated child missing after apply"))
    }

    /// Record that a child run was created
    pub fn add_child_workflow_execution_started_event(
        &mut self,
        initiated_id: i64,
        execution: &WorkflowExecution,
    ) -> Result<HistoryEvent, CoreError> {
        self.append(EventAttributes::ChildWorkflowExecutionStarted {
            initiated_event_id: initiated_id,
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id.clone(),
        })
    }

    /// Record that a child run completed
    pub fn add_child_workflow_execution_completed_event(
        &mut self,
        initiated_id: i64,
        result: Payload,
    ) -> Result<HistoryEvent, CoreError> {
        let started_id = self.child_started_id(initiated_id)?;
        self.append(EventAttributes::ChildWorkflowExecutionCompleted {
            initiated_event_id: initiated_id,
            started_event_id: started_id,
            result,
        })
    }

    /// Record that a child run failed
    pub fn add_child_workflow_execution_failed_event(
        &mut self,
        initiated_id: i64,
        reason: String,
        details: Payload,
    ) -> Result<HistoryEvent, CoreError> {
        let started_id = self.child_started_id(initiated_id)?;
        self.append(EventAttributes::ChildWorkflowExecutionFailed {
            initiated_event_id: initiated_id,
            started_event_id: started_id,
            reason,
            details,
        })
    }

    fn child_started_id(&self, initiated_id: i64) -> Result<i64, CoreError> {
        self.snapshot
            .children
            .get(&initiated_id)
            .map(|c| c.started_id)
            .ok_or_else(|| invalid(format!("child {} is not pending", initiated_id)))
    }

    // ----- external workflows -----

    /// Request cancellation of another workflow
    pub fn add_request_cancel_external_initiated_event(
        &mut self,
        decision_task_completed_event_id: i64,
        domain: String,
        workflow_id: String,
        run_id: Option<String>,
    ) -> Result<RequestCancelInfo, CoreError> {
        let event = self.append(EventAttributes::RequestCancelExternalWorkflowExecutionInitiated {
            domain,
            workflow_id,
            run_id,
            decision_task_completed_event_id,
        })?;
        self.snapshot
            .request_cancels
            .get(&event.event_id)
            .cloned()
            .ok_or_else(|| invalid("cancel request missing after apply"))
    }

    /// Record that a cancel request reached its target
    pub fn add_external_workflow_cancel_requested_event(
        &mut self,
        initiated_id: i64,
    ) -> Result<HistoryEvent, CoreError> {
        let info = self
            .snapshot
            .request_cancels
            .get(&initiated_id)
            .cloned()
            .ok_or_else(|| invalid(format!("cancel request {} is not pending", initiated_id)))?;
        self.append(EventAttributes::ExternalWorkflowExecutionCancelRequested {
            initiated_event_id: initiated_id,
            workflow_id: info.workflow_id,
            run_id: info.run_id,
        })
    }

    /// Request a signal to another workflow
    pub fn add_signal_external_initiated_event(
        &mut self,
        decision_task_completed_event_id: i64,
        domain: String,
        workflow_id: String,
        run_id: Option<String>,
        signal_name: String,
        input: Payload,
    ) -> Result<SignalInfo, CoreError> {
        let event = self.append(EventAttributes::SignalExternalWorkflowExecutionInitiated {
            domain,
            workflow_id,
            run_id,
            signal_name,
            input,
            decision_task_completed_event_id,
        })?;
        self.snapshot
            .signals
            .get(&event.event_id)
            .cloned()
            .ok_or_else(|| invalid("external signal missing after apply"))
    }

    /// Record that a signal reached its target
    pub fn add_external_workflow_signaled_event(
        &mut self,
        initiated_id: i64,
    ) -> Result<HistoryEvent, CoreError> {
        let info = self
            .snapshot
            .signals
            .get(&initiated_id)
            .cloned()
            .ok_or_else(|| invalid(format!("external signal {} is not pending", initiated_id)))?;
        self.append(EventAttributes::ExternalWorkflowExecutionSignaled {
            initiated_event_id: initiated_id,
            workflow_id: info.workflow_id,
            run_id: info.run_id,
        })
    }
}

fn close(s: &mut MutableStateSnapshot, status: WorkflowStatus, ts: DateTime<Utc>) {
    s.execution_info.status = status;
    s.execution_info.close_timestamp = Some(ts);
}

fn invalid(message: impl Into<String>) -> CoreError {
    CoreError::InvalidStateTransition(message.into())
}
