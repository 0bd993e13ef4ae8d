//! Decision task coordinator
//!
//! Drives the decision lifecycle of an execution:
//! `Scheduled -> Started -> Completed | Failed | TimedOut`, with at most one
//! decision pending at a time. Every transition runs under the execution
//! lock through the optimistic retry loop.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::deadline::{new_child_context, OperationContext};
use super::execution_cache::ExecutionCache;
use super::retry::{update_workflow_execution, Mutation};
use crate::config::EngineConfig;
use crate::domain::decision::{Decision, DecisionInfo, DecisionRejection};
use crate::domain::events::{DecisionTaskFailedCause, TimeoutType};
use crate::domain::execution::{
    DomainId, ExecutionKey, TaskList, WorkflowExecution, EMPTY_EVENT_ID,
};
use crate::domain::mutable_state::{MutableState, ScheduleActivityAttributes};
use crate::types::{
    require_domain, DecisionTimeoutTask, RecordDecisionTaskStartedRequest,
    RecordDecisionTaskStartedResponse, RespondDecisionTaskCompletedRequest,
    RespondDecisionTaskCompletedResponse, RespondDecisionTaskFailedRequest,
};
use crate::CoreError;

pub(crate) const WORKFLOW_COMPLETED_MESSAGE: &str = "Workflow execution already completed.";
const DECISION_NOT_FOUND_MESSAGE: &str = "Decision task not found.";
const QUERY_NOT_ANSWERED_REASON: &str = "decision task completed without answering the query";

/// Longest timer a decision may start: 100 years
pub const MAX_START_TO_FIRE_TIMEOUT_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

/// Coordinates the decision tasks of every execution in the cache
pub struct DecisionTaskCoordinator {
    cache: ExecutionCache,
    config: Arc<EngineConfig>,
}

impl DecisionTaskCoordinator {
    /// Create a coordinator over `cache`
    pub fn new(cache: ExecutionCache, config: Arc<EngineConfig>) -> Self {
        Self { cache, config }
    }

    /// Schedule a decision for a run that has none; a pending one is left alone
    pub async fn schedule_decision_task(
        &self,
        op_ctx: &OperationContext,
        domain_id: &DomainId,
        execution: &WorkflowExecution,
    ) -> Result<Option<i64>, CoreError> {
        require_domain(domain_id)?;
        let key = ExecutionKey::new(domain_id, execution);

        update_workflow_execution(
            &self.cache,
            key,
            self.config.conditional_retry_count,
            op_ctx,
            |state| {
                ensure_running(state)?;
                if state.has_pending_decision() {
                    return Ok(Mutation::Unchanged(None));
                }
                let decision = state.add_decision_task_scheduled_event()?;
                Ok(Mutation::Persist(Some(decision.schedule_id)))
            },
        )
        .await
    }

    /// Hand the scheduled decision to a poller
    ///
    /// A retried dispatch carrying the request id that already started the
    /// decision gets the original response back without a second
    /// transition; any other request id loses with `EventAlreadyStarted`.
    pub async fn record_decision_task_started(
        &self,
        op_ctx: &OperationContext,
        request: RecordDecisionTaskStartedRequest,
    ) -> Result<RecordDecisionTaskStartedResponse, CoreError> {
        require_domain(&request.domain_id)?;
        let key = ExecutionKey::new(&request.domain_id, &request.execution);
        let child_ctx = new_child_context(op_ctx, &self.config);

        let response = update_workflow_execution(
            &self.cache,
            key,
            self.config.conditional_retry_count,
            &child_ctx,
            |state| {
                ensure_running(state)?;
                let decision = match state.pending_decision() {
                    Some(d) if d.schedule_id == request.schedule_id => d.clone(),
                    _ => return Err(missing_decision(state, request.schedule_id)),
                };

                if decision.is_started() {
                    return if decision.request_id.as_deref() == Some(request.request_id.as_str()) {
                        debug!(
                            schedule_id = request.schedule_id,
                            request_id = %request.request_id,
                            "Decision already started by this request"
                        );
                        Ok(Mutation::Unchanged(started_response(state, &decision)))
                    } else {
                        Err(CoreError::EventAlreadyStarted(format!(
                            "decision {} already started by another request",
                            request.schedule_id
                        )))
                    };
                }

                let decision = state.add_decision_task_started_event(
                    request.schedule_id,
                    request.request_id.clone(),
                    &request.poll_task_list,
                    request.identity.clone(),
                )?;
                state.query_registry_mut().start_buffered_queries();
                Ok(Mutation::Persist(started_response(state, &decision)))
            },
        )
        .await?;

        debug!(
            workflow_id = %request.execution.workflow_id,
            run_id = %request.execution.run_id,
            started_id = response.started_event_id,
            sticky = response.sticky_execution_enabled,
            "Decision task started"
        );
        Ok(response)
    }

    /// Apply a worker's decisions
    ///
    /// Decisions are validated before anything is written. A rejected batch
    /// records DecisionTaskFailed instead of DecisionTaskCompleted and
    /// schedules a new decision.
    pub async fn respond_decision_task_completed(
        &self,
        op_ctx: &OperationContext,
        request: RespondDecisionTaskCompletedRequest,
    ) -> Result<RespondDecisionTaskCompletedResponse, CoreError> {
        let token = &request.task_token;
        require_domain(&token.domain_id)?;
        let default_sticky_timeout = self.config.default_sticky_schedule_to_start_timeout_secs;

        let response = update_workflow_execution(
            &self.cache,
            token.key(),
            self.config.conditional_retry_count,
            op_ctx,
            |state| {
                ensure_running(state)?;
                let decision = started_decision(state, token.schedule_id)?;
                let started_id = decision.started_id;
                let unhandled_events = state.next_event_id() > started_id + 1;

                if let Err(rejection) = validate_decisions(state, &request.decisions, unhandled_events) {
                    warn!(
                        workflow_id = %token.workflow_id,
                        cause = ?rejection.cause,
                        message = %rejection.message,
                        "Rejecting decisions"
                    );
                    state.add_decision_task_failed_event(
                        token.schedule_id,
                        started_id,
                        rejection.cause,
                        rejection.message.clone().into_bytes(),
                        request.identity.clone(),
                    )?;
                    state.query_registry_mut().return_started_to_buffered();
                    let next = state.add_decision_task_scheduled_event()?;
                    return Ok(Mutation::Persist(RespondDecisionTaskCompletedResponse {
                        failed_cause: Some(rejection.cause),
                        new_decision_schedule_id: Some(next.schedule_id),
                    }));
                }

                let completed = state.add_decision_task_completed_event(
                    token.schedule_id,
                    started_id,
                    request.identity.clone(),
                    request.execution_context.clone(),
                )?;

                match &request.sticky_attributes {
                    Some(sticky) if !sticky.worker_task_list.is_empty() => state.set_sticky_task_list(
                        sticky.worker_task_list.clone(),
                        sticky
                            .schedule_to_start_timeout_seconds
                            .unwrap_or(default_sticky_timeout),
                    ),
                    _ => state.clear_stickiness(),
                }

                for (query_id, result) in &request.query_results {
                    if !state.query_registry_mut().complete_query(query_id, result.clone()) {
                        debug!(query_id = %query_id, "Dropping result for unknown query");
                    }
                }
                state.query_registry_mut().fail_started_queries(QUERY_NOT_ANSWERED_REASON);

                for decision in &request.decisions {
                    apply_decision(state, completed.event_id, &request.identity, decision)?;
                }

                let new_decision_schedule_id = if state.is_workflow_running()
                    && (unhandled_events || request.force_create_new_decision_task)
                {
                    Some(state.add_decision_task_scheduled_event()?.schedule_id)
                } else {
                    None
                };

                Ok(Mutation::Persist(RespondDecisionTaskCompletedResponse {
                    failed_cause: None,
                    new_decision_schedule_id,
                }))
            },
        )
        .await?;

        info!(
            workflow_id = %token.workflow_id,
            run_id = %token.run_id,
            schedule_id = token.schedule_id,
            decisions = request.decisions.len(),
            rejected = response.failed_cause.is_some(),
            "Decision task completed"
        );
        Ok(response)
    }

    /// Record that a worker could not process the decision and retry it
    pub async fn respond_decision_task_failed(
        &self,
        op_ctx: &OperationContext,
        request: RespondDecisionTaskFailedRequest,
    ) -> Result<i64, CoreError> {
        let token = &request.task_token;
        require_domain(&token.domain_id)?;

        update_workflow_execution(
            &self.cache,
            token.key(),
            self.config.conditional_retry_count,
            op_ctx,
            |state| {
                ensure_running(state)?;
                let decision = started_decision(state, token.schedule_id)?;
                state.add_decision_task_failed_event(
                    token.schedule_id,
                    decision.started_id,
                    request.cause,
                    request.details.clone(),
                    request.identity.clone(),
                )?;
                if request.cause == DecisionTaskFailedCause::ResetStickyTaskList {
                    state.clear_stickiness();
                }
                state.query_registry_mut().return_started_to_buffered();
                let next = state.add_decision_task_scheduled_event()?;
                debug!(
                    schedule_id = next.schedule_id,
                    attempt = next.attempt,
                    "Rescheduled failed decision"
                );
                Ok(Mutation::Persist(next.schedule_id))
            },
        )
        .await
    }

    /// Apply a decision timeout; returns false when the timer was stale
    ///
    /// Start-to-close applies to started decisions. Schedule-to-start only
    /// applies to unstarted sticky decisions and moves the execution back to
    /// its normal task list.
    pub async fn time_out_decision_task(
        &self,
        op_ctx: &OperationContext,
        task: DecisionTimeoutTask,
    ) -> Result<bool, CoreError> {
        require_domain(&task.domain_id)?;
        let key = ExecutionKey::new(&task.domain_id, &task.execution);

        update_workflow_execution(
            &self.cache,
            key,
            self.config.conditional_retry_count,
            op_ctx,
            |state| {
                if !state.is_workflow_running() {
                    return Ok(Mutation::Unchanged(false));
                }
                let decision = match state.pending_decision() {
                    Some(d) if d.schedule_id == task.schedule_id && d.attempt == task.attempt => d.clone(),
                    _ => return Ok(Mutation::Unchanged(false)),
                };

                let applies = match task.timeout_type {
                    TimeoutType::StartToClose => decision.is_started(),
                    TimeoutType::ScheduleToStart => !decision.is_started() && decision.is_sticky(),
                    TimeoutType::ScheduleToClose | TimeoutType::Heartbeat => false,
                };
                if !applies {
                    debug!(
                        schedule_id = task.schedule_id,
                        timeout_type = ?task.timeout_type,
                        "Ignoring decision timeout"
                    );
                    return Ok(Mutation::Unchanged(false));
                }

                let started_id = if decision.is_started() {
                    decision.started_id
                } else {
                    EMPTY_EVENT_ID
                };
                state.add_decision_task_timed_out_event(task.schedule_id, started_id, task.timeout_type)?;
                state.query_registry_mut().return_started_to_buffered();
                state.add_decision_task_scheduled_event()?;
                Ok(Mutation::Persist(true))
            },
        )
        .await
    }
}

fn ensure_running(state: &MutableState) -> Result<(), CoreError> {
    if state.is_workflow_running() {
        Ok(())
    } else {
        Err(CoreError::EntityNotExists(WORKFLOW_COMPLETED_MESSAGE.to_string()))
    }
}

/// A schedule id past the end of the cached history means the cache is stale
fn missing_decision(state: &MutableState, schedule_id: i64) -> CoreError {
    if schedule_id >= state.next_event_id() {
        CoreError::ConditionFailed(format!(
            "schedule id {} is beyond next event id {}",
            schedule_id,
            state.next_event_id()
        ))
    } else {
        CoreError::EntityNotExists(DECISION_NOT_FOUND_MESSAGE.to_string())
    }
}

fn started_decision(state: &MutableState, schedule_id: i64) -> Result<DecisionInfo, CoreError> {
    match state.pending_decision() {
        Some(d) if d.schedule_id == schedule_id && d.is_started() => Ok(d.clone()),
        Some(d) if d.schedule_id == schedule_id => {
            Err(CoreError::EntityNotExists(DECISION_NOT_FOUND_MESSAGE.to_string()))
        }
        _ => Err(missing_decision(state, schedule_id)),
    }
}

fn started_response(state: &MutableState, decision: &DecisionInfo) -> RecordDecisionTaskStartedResponse {
    let info = state.execution_info();
    RecordDecisionTaskStartedResponse {
        workflow_type: info.workflow_type.clone(),
        previous_started_event_id: state.previous_started_event_id(),
        scheduled_event_id: decision.schedule_id,
        started_event_id: decision.started_id,
        next_event_id: state.next_event_id(),
        attempt: decision.attempt,
        sticky_execution_enabled: state.is_sticky_task_list_enabled(),
        workflow_execution_task_list: TaskList::normal(info.task_list.clone()),
        branch_token: state.current_branch_token().to_vec(),
        scheduled_timestamp: decision.scheduled_timestamp,
        started_timestamp: decision.started_timestamp,
        queries: state.query_registry().started_queries(),
    }
}

/// Check a whole batch against the current state before any of it is applied
fn validate_decisions(
    state: &MutableState,
    decisions: &[Decision],
    unhandled_events: bool,
) -> Result<(), DecisionRejection> {
    let mut activity_ids = BTreeSet::new();
    let mut timer_ids = BTreeSet::new();
    let bad = |message: String| DecisionRejection::new(DecisionTaskFailedCause::BadDecisionAttributes, message);

    for (index, decision) in decisions.iter().enumerate() {
        if decision.closes_workflow() {
            if index + 1 != decisions.len() {
                return Err(bad("close decision must be the last decision".to_string()));
            }
            if unhandled_events {
                return Err(DecisionRejection::new(
                    DecisionTaskFailedCause::UnhandledDecision,
                    "new events arrived while the decision was running",
                ));
            }
        }

        match decision {
            Decision::ScheduleActivityTask {
                activity_id,
                activity_type,
                ..
            } => {
                if activity_id.is_empty() || activity_type.is_empty() {
                    return Err(bad("activity id and type are required".to_string()));
                }
                if state.has_pending_activity_id(activity_id) || !activity_ids.insert(activity_id.as_str()) {
                    return Err(DecisionRejection::new(
                        DecisionTaskFailedCause::ScheduleActivityDuplicateId,
                        format!("activity {} is already scheduled", activity_id),
                    ));
                }
            }
            Decision::StartTimer {
                timer_id,
                start_to_fire_timeout_seconds,
            } => {
                if timer_id.is_empty() {
                    return Err(bad("timer id is required".to_string()));
                }
                if !(1..=MAX_START_TO_FIRE_TIMEOUT_SECONDS).contains(start_to_fire_timeout_seconds) {
                    return Err(bad(format!(
                        "timer {} needs a timeout between 1 and {} seconds, got {}",
                        timer_id, MAX_START_TO_FIRE_TIMEOUT_SECONDS, start_to_fire_timeout_seconds
                    )));
                }
                if state.pending_timer(timer_id).is_some() || !timer_ids.insert(timer_id.as_str()) {
                    return Err(DecisionRejection::new(
                        DecisionTaskFailedCause::StartTimerDuplicateId,
                        format!("timer {} is already started", timer_id),
                    ));
                }
            }
            Decision::CancelTimer { timer_id } => {
                let known = state.pending_timer(timer_id).is_some() || timer_ids.contains(timer_id.as_str());
                if !known {
                    return Err(bad(format!("timer {} is not pending", timer_id)));
                }
                timer_ids.remove(timer_id.as_str());
            }
            Decision::RequestCancelExternalWorkflowExecution {
                domain, workflow_id, ..
            }
            | Decision::SignalExternalWorkflowExecution {
                domain, workflow_id, ..
            } => {
                if domain.is_empty() || workflow_id.is_empty() {
                    return Err(bad("target domain and workflow id are required".to_string()));
                }
            }
            Decision::StartChildWorkflowExecution {
                domain,
                workflow_id,
                workflow_type,
                ..
            } => {
                if domain.is_empty() || workflow_id.is_empty() || workflow_type.is_empty() {
                    return Err(bad("child domain, workflow id and type are required".to_string()));
                }
            }
            Decision::RecordMarker { marker_name, .. } => {
                if marker_name.is_empty() {
                    return Err(bad("marker name is required".to_string()));
                }
            }
            Decision::CompleteWorkflowExecution { .. }
            | Decision::FailWorkflowExecution { .. }
            | Decision::CancelWorkflowExecution { .. } => {}
        }
    }
    Ok(())
}

fn apply_decision(
    state: &mut MutableState,
    completed_id: i64,
    identity: &str,
    decision: &Decision,
) -> Result<(), CoreError> {
    match decision.clone() {
        Decision::ScheduleActivityTask {
            activity_id,
            activity_type,
            task_list,
            input,
            schedule_to_close_timeout_seconds,
            schedule_to_start_timeout_seconds,
            start_to_close_timeout_seconds,
            heartbeat_timeout_seconds,
        } => {
            let task_list = task_list.unwrap_or_else(|| state.execution_info().task_list.clone());
            state.add_activity_task_scheduled_event(
                completed_id,
                ScheduleActivityAttributes {
                    activity_id,
                    activity_type,
                    task_list,
                    input,
                    schedule_to_close_timeout_seconds,
                    schedule_to_start_timeout_seconds,
                    start_to_close_timeout_seconds,
                    heartbeat_timeout_seconds,
                },
            )?;
        }
        Decision::StartTimer {
            timer_id,
            start_to_fire_timeout_seconds,
        } => {
            state.add_timer_started_event(completed_id, timer_id, start_to_fire_timeout_seconds)?;
        }
        Decision::CancelTimer { timer_id } => {
            state.add_timer_canceled_event(completed_id, &timer_id, identity.to_string())?;
        }
        Decision::RecordMarker { marker_name, details } => {
            state.add_marker_recorded_event(completed_id, marker_name, details)?;
        }
        Decision::CompleteWorkflowExecution { result } => {
            state.add_workflow_execution_completed_event(completed_id, result)?;
        }
        Decision::FailWorkflowExecution { reason, details } => {
            state.add_workflow_execution_failed_event(completed_id, reason, details)?;
        }
        Decision::CancelWorkflowExecution { details } => {
            state.add_workflow_execution_canceled_event(completed_id, details)?;
        }
        Decision::RequestCancelExternalWorkflowExecution {
            domain,
            workflow_id,
            run_id,
        } => {
            state.add_request_cancel_external_initiated_event(completed_id, domain, workflow_id, run_id)?;
        }
        Decision::SignalExternalWorkflowExecution {
            domain,
            workflow_id,
            run_id,
            signal_name,
            input,
        } => {
            state.add_signal_external_initiated_event(
                completed_id,
                domain,
                workflow_id,
                run_id,
                signal_name,
                input,
            )?;
        }
        Decision::StartChildWorkflowExecution {
            domain,
            workflow_id,
            workflow_type,
            task_list,
            input,
        } => {
            let task_list = task_list.unwrap_or_else(|| state.execution_info().task_list.clone());
            state.add_start_child_workflow_execution_initiated_event(
                completed_id,
                domain,
                workflow_id,
                workflow_type,
                task_list,
                input,
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::test_support::{accepting_history_store, MockExecutionStore};
    use crate::domain::decision::StickyExecutionAttributes;
    use crate::domain::execution::WorkflowStatus;
    use crate::domain::mutable_state::MutableStateSnapshot;
    use crate::domain::persistence::{GetWorkflowExecutionResponse, PersistenceError};
    use crate::domain::query_registry::{QueryResultType, WorkflowQuery, WorkflowQueryResult};
    use crate::domain::shard::ShardContext;
    use crate::testing::{TestWorkflow, TEST_TASK_LIST};
    use crate::types::TaskToken;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn domain() -> DomainId {
        DomainId("domain".to_string())
    }

    fn execution() -> WorkflowExecution {
        WorkflowExecution::new("wId", "rId")
    }

    /// Store that serves `workflow` and records every accepted update
    fn serving(workflow: &TestWorkflow) -> (MockExecutionStore, Arc<Mutex<Vec<MutableState>>>) {
        serving_snapshot(workflow.snapshot())
    }

    fn serving_snapshot(snapshot: MutableStateSnapshot) -> (MockExecutionStore, Arc<Mutex<Vec<MutableState>>>) {
        let current = Arc::new(Mutex::new(snapshot));
        let updates = Arc::new(Mutex::new(Vec::new()));
        let mut store = MockExecutionStore::new();

        let read = current.clone();
        store.expect_get_workflow_execution().returning(move |_| {
            Ok(GetWorkflowExecutionResponse {
                state: read.lock().unwrap().clone(),
            })
        });
        let write = current.clone();
        let seen = updates.clone();
        store.expect_update_workflow_execution().returning(move |request| {
            let mut current = write.lock().unwrap();
            if request.condition.expected_next_event_id != current.execution_info.next_event_id {
                return Err(PersistenceError::ConditionFailed("next event id mismatch".to_string()));
            }
            *current = request.snapshot.clone();
            seen.lock().unwrap().push(MutableState::from_snapshot(request.snapshot));
            Ok(())
        });
        (store, updates)
    }

    fn coordinator(store: MockExecutionStore) -> DecisionTaskCoordinator {
        coordinator_with(store, EngineConfig::default())
    }

    fn coordinator_with(store: MockExecutionStore, config: EngineConfig) -> DecisionTaskCoordinator {
        let cache = ExecutionCache::from_config(
            &config,
            Arc::new(store),
            Arc::new(accepting_history_store()),
            Arc::new(ShardContext::local(1, 1)),
        );
        DecisionTaskCoordinator::new(cache, Arc::new(config))
    }

    /// Sticky run with a scheduled decision, last touched `idle` ago
    fn idle_sticky_run(idle: chrono::Duration) -> MutableStateSnapshot {
        let mut workflow = TestWorkflow::started(&domain(), &execution()).unwrap();
        workflow.set_sticky("sticky-A", 5);
        workflow.schedule_decision().unwrap();
        let mut snapshot = workflow.snapshot();
        snapshot.execution_info.last_updated_timestamp = Some(chrono::Utc::now() - idle);
        snapshot
    }

    fn one_day_sticky_ttl() -> EngineConfig {
        EngineConfig {
            sticky_ttl_secs: 24 * 60 * 60,
            ..EngineConfig::default()
        }
    }

    fn started_request(request_id: &str, poll: TaskList) -> RecordDecisionTaskStartedRequest {
        RecordDecisionTaskStartedRequest {
            domain_id: domain(),
            execution: execution(),
            schedule_id: 2,
            task_id: 100,
            request_id: request_id.to_string(),
            identity: "worker".to_string(),
            poll_task_list: poll,
        }
    }

    fn completed_request(schedule_id: i64, decisions: Vec<Decision>) -> RespondDecisionTaskCompletedRequest {
        RespondDecisionTaskCompletedRequest {
            task_token: TaskToken {
                domain_id: domain(),
                workflow_id: "wId".to_string(),
                run_id: "rId".to_string(),
                schedule_id,
            },
            decisions,
            sticky_attributes: None,
            query_results: BTreeMap::new(),
            identity: "worker".to_string(),
            execution_context: None,
            force_create_new_decision_task: false,
        }
    }

    fn in_flight() -> TestWorkflow {
        let mut workflow = TestWorkflow::with_pending_decision(&domain(), &execution()).unwrap();
        workflow.start_decision(2, "req").unwrap();
        workflow
    }

    #[tokio::test]
    async fn test_record_decision_started_assigns_next_id() {
        let workflow = TestWorkflow::with_pending_decision(&domain(), &execution()).unwrap();
        let (store, updates) = serving(&workflow);
        let coordinator = coordinator(store);

        let response = coordinator
            .record_decision_task_started(
                &OperationContext::background(),
                started_request("req", TaskList::normal(TEST_TASK_LIST)),
            )
            .await
            .unwrap();

        assert_eq!(response.scheduled_event_id, 2);
        assert_eq!(response.started_event_id, 3);
        assert_eq!(response.next_event_id, 4);
        assert_eq!(response.previous_started_event_id, None);
        assert!(!response.sticky_execution_enabled);
        assert_eq!(updates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_request_id_is_idempotent() {
        let workflow = TestWorkflow::with_pending_decision(&domain(), &execution()).unwrap();
        let (store, updates) = serving(&workflow);
        let coordinator = coordinator(store);
        let ctx = OperationContext::background();

        let first = coordinator
            .record_decision_task_started(&ctx, started_request("req", TaskList::normal(TEST_TASK_LIST)))
            .await
            .unwrap();
        let second = coordinator
            .record_decision_task_started(&ctx, started_request("req", TaskList::normal(TEST_TASK_LIST)))
            .await
            .unwrap();

        assert_eq!(first.started_event_id, second.started_event_id);
        assert_eq!(updates.lock().unwrap().len(), 1);

        let other = coordinator
            .record_decision_task_started(&ctx, started_request("other", TaskList::normal(TEST_TASK_LIST)))
            .await;
        assert!(matches!(other, Err(CoreError::EventAlreadyStarted(_))));
    }

    #[tokio::test]
    async fn test_sticky_poll_keeps_stickiness() {
        let mut workflow = TestWorkflow::started(&domain(), &execution()).unwrap();
        workflow.set_sticky("sticky-A", 5);
        workflow.schedule_decision().unwrap();
        let (store, _) = serving(&workflow);
        let coordinator = coordinator(store);

        let response = coordinator
            .record_decision_task_started(
                &OperationContext::background(),
                started_request("req", TaskList::sticky("sticky-A")),
            )
            .await
            .unwrap();

        assert!(response.sticky_execution_enabled);
        assert_eq!(response.workflow_execution_task_list, TaskList::normal(TEST_TASK_LIST));
    }

    #[tokio::test]
    async fn test_sticky_expired_after_ttl() {
        let (store, updates) = serving_snapshot(idle_sticky_run(chrono::Duration::days(2)));
        let coordinator = coordinator_with(store, one_day_sticky_ttl());

        let response = coordinator
            .record_decision_task_started(
                &OperationContext::background(),
                started_request("req", TaskList::sticky("sticky-A")),
            )
            .await
            .unwrap();

        assert!(!response.sticky_execution_enabled);
        assert_eq!(response.started_event_id, 3);
        let persisted = updates.lock().unwrap().last().cloned().unwrap();
        assert_eq!(persisted.execution_info().sticky_task_list, None);
    }

    #[tokio::test]
    async fn test_sticky_enabled_within_ttl() {
        let (store, updates) = serving_snapshot(idle_sticky_run(chrono::Duration::hours(1)));
        let coordinator = coordinator_with(store, one_day_sticky_ttl());

        let response = coordinator
            .record_decision_task_started(
                &OperationContext::background(),
                started_request("req", TaskList::sticky("sticky-A")),
            )
            .await
            .unwrap();

        assert!(response.sticky_execution_enabled);
        let persisted = updates.lock().unwrap().last().cloned().unwrap();
        assert_eq!(persisted.execution_info().sticky_task_list.as_deref(), Some("sticky-A"));
    }

    #[tokio::test]
    async fn test_sticky_mismatch_clears_stickiness() {
        let mut workflow = TestWorkflow::started(&domain(), &execution()).unwrap();
        workflow.set_sticky("A", 5);
        workflow.schedule_decision().unwrap();
        let (store, updates) = serving(&workflow);
        let coordinator = coordinator(store);

        let response = coordinator
            .record_decision_task_started(
                &OperationContext::background(),
                started_request("req", TaskList::normal("B")),
            )
            .await
            .unwrap();

        assert!(!response.sticky_execution_enabled);
        let persisted = updates.lock().unwrap().last().cloned().unwrap();
        assert!(!persisted.is_sticky_task_list_enabled());
    }

    #[tokio::test]
    async fn test_completed_decision_is_entity_not_exists() {
        let mut workflow = in_flight();
        workflow.complete_decision(2, 3).unwrap();
        let (store, _) = serving(&workflow);
        let coordinator = coordinator(store);

        let result = coordinator
            .record_decision_task_started(
                &OperationContext::background(),
                started_request("req", TaskList::normal(TEST_TASK_LIST)),
            )
            .await;
        assert!(matches!(result, Err(CoreError::EntityNotExists(_))));
    }

    #[tokio::test]
    async fn test_closed_workflow_is_entity_not_exists() {
        let mut workflow = TestWorkflow::with_pending_decision(&domain(), &execution()).unwrap();
        workflow.close(WorkflowStatus::Terminated).unwrap();
        let (store, _) = serving(&workflow);
        let coordinator = coordinator(store);

        let result = coordinator
            .record_decision_task_started(
                &OperationContext::background(),
                started_request("req", TaskList::normal(TEST_TASK_LIST)),
            )
            .await;
        assert_eq!(
            result.unwrap_err(),
            CoreError::EntityNotExists(WORKFLOW_COMPLETED_MESSAGE.to_string())
        );
    }

    #[tokio::test]
    async fn test_record_marker_decision() {
        let workflow = in_flight();
        let (store, updates) = serving(&workflow);
        let coordinator = coordinator(store);

        let response = coordinator
            .respond_decision_task_completed(
                &OperationContext::background(),
                completed_request(
                    2,
                    vec![Decision::RecordMarker {
                        marker_name: "marker".to_string(),
                        details: b"details".to_vec(),
                    }],
                ),
            )
            .await
            .unwrap();

        assert_eq!(response.failed_cause, None);
        assert_eq!(response.new_decision_schedule_id, None);
        let persisted = updates.lock().unwrap().last().cloned().unwrap();
        assert_eq!(persisted.next_event_id(), 6);
        assert!(!persisted.has_pending_decision());
        assert_eq!(persisted.previous_started_event_id(), Some(3));
    }

    #[tokio::test]
    async fn test_complete_workflow_decision_closes_run() {
        let workflow = in_flight();
        let (store, updates) = serving(&workflow);
        let coordinator = coordinator(store);

        coordinator
            .respond_decision_task_completed(
                &OperationContext::background(),
                completed_request(2, vec![Decision::CompleteWorkflowExecution { result: b"done".to_vec() }]),
            )
            .await
            .unwrap();

        let persisted = updates.lock().unwrap().last().cloned().unwrap();
        assert_eq!(persisted.execution_info().status, WorkflowStatus::Completed);
        assert!(!persisted.has_pending_decision());
    }

    #[tokio::test]
    async fn test_close_decision_with_new_events_is_rejected() {
        let workflow = in_flight();
        // A signal lands while the worker holds the decision
        let mut state = MutableState::from_snapshot(workflow.snapshot());
        state
            .add_workflow_execution_signaled_event("sig".to_string(), Vec::new(), "id".to_string(), None)
            .unwrap();
        let (store, updates) = serving_state(state);
        let coordinator = coordinator(store);

        let response = coordinator
            .respond_decision_task_completed(
                &OperationContext::background(),
                completed_request(2, vec![Decision::CompleteWorkflowExecution { result: Vec::new() }]),
            )
            .await
            .unwrap();

        assert_eq!(response.failed_cause, Some(DecisionTaskFailedCause::UnhandledDecision));
        let persisted = updates.lock().unwrap().last().cloned().unwrap();
        assert!(persisted.is_workflow_running());
        let decision = persisted.pending_decision().unwrap();
        assert_eq!(decision.attempt, 1);
        assert_eq!(Some(decision.schedule_id), response.new_decision_schedule_id);
    }

    /// Variant of `serving` that starts from an arbitrary aggregate
    fn serving_state(mut state: MutableState) -> (MockExecutionStore, Arc<Mutex<Vec<MutableState>>>) {
        state.commit();
        let current = Arc::new(Mutex::new(state.to_snapshot()));
        let updates = Arc::new(Mutex::new(Vec::new()));
        let mut store = MockExecutionStore::new();
        let read = current.clone();
        store.expect_get_workflow_execution().returning(move |_| {
            Ok(GetWorkflowExecutionResponse {
                state: read.lock().unwrap().clone(),
            })
        });
        let seen = updates.clone();
        store.expect_update_workflow_execution().returning(move |request| {
            *current.lock().unwrap() = request.snapshot.clone();
            seen.lock().unwrap().push(MutableState::from_snapshot(request.snapshot));
            Ok(())
        });
        (store, updates)
    }

    #[tokio::test]
    async fn test_duplicate_activity_id_is_rejected() {
        let workflow = in_flight();
        let (store, updates) = serving(&workflow);
        let coordinator = coordinator(store);
        let schedule = |id: &str| Decision::ScheduleActivityTask {
            activity_id: id.to_string(),
            activity_type: "type".to_string(),
            task_list: None,
            input: Vec::new(),
            schedule_to_close_timeout_seconds: 10,
            schedule_to_start_timeout_seconds: 10,
            start_to_close_timeout_seconds: 10,
            heartbeat_timeout_seconds: 10,
        };

        let response = coordinator
            .respond_decision_task_completed(
                &OperationContext::background(),
                completed_request(2, vec![schedule("a"), schedule("a")]),
            )
            .await
            .unwrap();

        assert_eq!(
            response.failed_cause,
            Some(DecisionTaskFailedCause::ScheduleActivityDuplicateId)
        );
        let persisted = updates.lock().unwrap().last().cloned().unwrap();
        assert!(persisted.pending_activities().is_empty());
    }

    #[tokio::test]
    async fn test_timer_beyond_limit_is_rejected() {
        let workflow = in_flight();
        let (store, updates) = serving(&workflow);
        let coordinator = coordinator(store);

        let response = coordinator
            .respond_decision_task_completed(
                &OperationContext::background(),
                completed_request(
                    2,
                    vec![Decision::StartTimer {
                        timer_id: "forever".to_string(),
                        start_to_fire_timeout_seconds: i64::MAX,
                    }],
                ),
            )
            .await
            .unwrap();

        assert_eq!(response.failed_cause, Some(DecisionTaskFailedCause::BadDecisionAttributes));
        assert_eq!(response.new_decision_schedule_id, Some(5));
        let persisted = updates.lock().unwrap().last().cloned().unwrap();
        assert!(persisted.pending_timers().is_empty());
    }

    #[tokio::test]
    async fn test_sticky_attributes_enable_stickiness() {
        let workflow = in_flight();
        let (store, updates) = serving(&workflow);
        let coordinator = coordinator(store);
        let mut request = completed_request(2, Vec::new());
        request.sticky_attributes = Some(StickyExecutionAttributes {
            worker_task_list: "worker-list".to_string(),
            schedule_to_start_timeout_seconds: None,
        });
        request.force_create_new_decision_task = true;

        let response = coordinator
            .respond_decision_task_completed(&OperationContext::background(), request)
            .await
            .unwrap();

        let persisted = updates.lock().unwrap().last().cloned().unwrap();
        assert!(persisted.is_sticky_task_list_enabled());
        let next = persisted.pending_decision().unwrap();
        assert_eq!(Some(next.schedule_id), response.new_decision_schedule_id);
        assert!(next.is_sticky());
        assert_eq!(next.task_list, "worker-list");
    }

    #[tokio::test]
    async fn test_query_answered_with_decision() {
        let workflow = TestWorkflow::with_pending_decision(&domain(), &execution()).unwrap();
        let (store, _) = serving(&workflow);
        let coordinator = coordinator(store);
        let ctx = OperationContext::background();

        let mut receiver = {
            let mut guard = coordinator.cache.acquire(ExecutionKey::new(&domain(), &execution()), &ctx).await.unwrap();
            let state = guard.load_state().await.unwrap();
            let (_, receiver) = state.query_registry_mut().buffer_query(WorkflowQuery {
                query_type: "state".to_string(),
                query_args: Vec::new(),
            });
            guard.release(None);
            receiver
        };

        let started = coordinator
            .record_decision_task_started(&ctx, started_request("req", TaskList::normal(TEST_TASK_LIST)))
            .await
            .unwrap();
        assert_eq!(started.queries.len(), 1);
        let query_id = started.queries.keys().next().cloned().unwrap();

        let mut request = completed_request(2, Vec::new());
        request.query_results.insert(
            query_id,
            WorkflowQueryResult {
                result_type: QueryResultType::Answered,
                answer: Some(b"answer".to_vec()),
                error_message: None,
            },
        );
        coordinator.respond_decision_task_completed(&ctx, request).await.unwrap();

        receiver.changed().await.unwrap();
        assert_eq!(
            receiver.borrow().clone(),
            Some(crate::domain::query_registry::QueryOutcome::Answered(b"answer".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_failed_decision_is_rescheduled() {
        let workflow = in_flight();
        let (store, updates) = serving(&workflow);
        let coordinator = coordinator(store);

        let schedule_id = coordinator
            .respond_decision_task_failed(
                &OperationContext::background(),
                RespondDecisionTaskFailedRequest {
                    task_token: completed_request(2, Vec::new()).task_token,
                    cause: DecisionTaskFailedCause::WorkflowWorkerUnhandledFailure,
                    details: Vec::new(),
                    identity: "worker".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(schedule_id, 5);
        let persisted = updates.lock().unwrap().last().cloned().unwrap();
        assert_eq!(persisted.pending_decision().unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn test_schedule_to_start_timeout_clears_stickiness() {
        let mut workflow = TestWorkflow::started(&domain(), &execution()).unwrap();
        workflow.set_sticky("sticky", 5);
        workflow.schedule_decision().unwrap();
        let (store, updates) = serving(&workflow);
        let coordinator = coordinator(store);
        let task = DecisionTimeoutTask {
            domain_id: domain(),
            execution: execution(),
            schedule_id: 2,
            attempt: 0,
            timeout_type: TimeoutType::ScheduleToStart,
        };

        assert!(coordinator
            .time_out_decision_task(&OperationContext::background(), task.clone())
            .await
            .unwrap());

        let persisted = updates.lock().unwrap().last().cloned().unwrap();
        assert!(!persisted.is_sticky_task_list_enabled());
        let next = persisted.pending_decision().unwrap();
        assert!(!next.is_sticky());
        assert_eq!(next.schedule_id, 4);

        // The same timer firing again is stale
        assert!(!coordinator
            .time_out_decision_task(&OperationContext::background(), task)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_start_to_close_ignored_for_unstarted_decision() {
        let workflow = TestWorkflow::with_pending_decision(&domain(), &execution()).unwrap();
        let (store, updates) = serving(&workflow);
        let coordinator = coordinator(store);

        let applied = coordinator
            .time_out_decision_task(
                &OperationContext::background(),
                DecisionTimeoutTask {
                    domain_id: domain(),
                    execution: execution(),
                    schedule_id: 2,
                    attempt: 0,
                    timeout_type: TimeoutType::StartToClose,
                },
            )
            .await
            .unwrap();

        assert!(!applied);
        assert!(updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_types_of_completed_decision() {
        let workflow = in_flight();
        let (store, _) = serving(&workflow);
        let coordinator = coordinator(store);
        let mut request = completed_request(
            2,
            vec![Decision::StartTimer {
                timer_id: "t".to_string(),
                start_to_fire_timeout_seconds: 30,
            }],
        );
        request.force_create_new_decision_task = true;
        coordinator
            .respond_decision_task_completed(&OperationContext::background(), request)
            .await
            .unwrap();

        let guard = coordinator
            .cache
            .acquire(ExecutionKey::new(&domain(), &execution()), &OperationContext::background())
            .await
            .unwrap();
        let state = guard.loaded_state().unwrap();
        assert!(state.pending_timer("t").is_some());
        assert_eq!(state.next_event_id(), 7);
        assert!(state.new_events().is_empty());
    }
}
