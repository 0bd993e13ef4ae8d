//! History engine: the single entry point of the execution core
//!
//! Every operation validates its request, bounds itself with the caller's
//! deadline (or the configured default) and mutates the execution only
//! through the cache lock and the optimistic retry loop.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::deadline::{new_child_context, OperationContext};
use super::decision_handler::{DecisionTaskCoordinator, WORKFLOW_COMPLETED_MESSAGE};
use super::execution_cache::ExecutionCache;
use super::retry::{update_workflow_execution, Mutation};
use super::start_handler::StartSignalOrchestrator;
use crate::config::EngineConfig;
use crate::domain::execution::{DomainId, ExecutionKey, WorkflowExecution};
use crate::domain::mutable_state::{ActivityInfo, MutableState};
use crate::domain::persistence::{ExecutionStore, GetCurrentExecutionRequest, HistoryStore};
use crate::domain::query_registry::{QueryOutcome, QueryTermination};
use crate::domain::shard::ShardContext;
use crate::types::*;
use crate::CoreError;

const ACTIVITY_NOT_FOUND_MESSAGE: &str = "Activity task not found.";
const QUERY_DISCARDED_REASON: &str = "query was discarded with the cached workflow state";

/// Entry point for every workflow operation of one shard
pub struct HistoryEngine {
    config: Arc<EngineConfig>,
    cache: ExecutionCache,
    execution_store: Arc<dyn ExecutionStore>,
    shard: Arc<ShardContext>,
    decisions: DecisionTaskCoordinator,
    starts: StartSignalOrchestrator,
}

impl HistoryEngine {
    /// Build an engine and its execution cache
    pub fn new(
        config: EngineConfig,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        shard: Arc<ShardContext>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let config = Arc::new(config);
        let cache = ExecutionCache::from_config(&config, execution_store.clone(), history_store, shard.clone());

        info!(
            shard_id = shard.shard_id(),
            range_id = shard.range_id(),
            cache_capacity = config.execution_cache_capacity,
            "History engine created"
        );

        Ok(Self {
            decisions: DecisionTaskCoordinator::new(cache.clone(), config.clone()),
            starts: StartSignalOrchestrator::new(
                cache.clone(),
                execution_store.clone(),
                shard.clone(),
                config.clone(),
            ),
            config,
            cache,
            execution_store,
            shard,
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execution cache shared by every operation
    pub fn cache(&self) -> &ExecutionCache {
        &self.cache
    }

    /// Shard this engine writes under
    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }

    /// Deadline for a sub-operation of `parent`
    pub fn new_child_context(&self, parent: &OperationContext) -> OperationContext {
        new_child_context(parent, &self.config)
    }

    /// Drop idle cached executions; call on shutdown
    pub fn drain(&self) -> usize {
        let drained = self.cache.drain();
        info!(drained, "History engine drained");
        drained
    }

    fn bounded(&self, ctx: &OperationContext) -> OperationContext {
        ctx.or_timeout(self.config.default_operation_timeout())
    }

    // ----- start -----

    /// Start a new run
    pub async fn start_workflow_execution(
        &self,
        ctx: &OperationContext,
        request: StartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse, CoreError> {
        self.starts
            .start_workflow_execution(&self.bounded(ctx), request)
            .await
    }

    /// Signal the current run, starting one when none is open
    pub async fn signal_with_start_workflow_execution(
        &self,
        ctx: &OperationContext,
        request: SignalWithStartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse, CoreError> {
        self.starts
            .signal_with_start_workflow_execution(&self.bounded(ctx), request)
            .await
    }

    // ----- decisions -----

    /// Schedule the first decision of a run created without one
    pub async fn schedule_decision_task(
        &self,
        ctx: &OperationContext,
        domain_id: &DomainId,
        execution: &WorkflowExecution,
    ) -> Result<Option<i64>, CoreError> {
        self.decisions
            .schedule_decision_task(&self.bounded(ctx), domain_id, execution)
            .await
    }

    /// Start a decision for a poller
    pub async fn record_decision_task_started(
        &self,
        ctx: &OperationContext,
        request: RecordDecisionTaskStartedRequest,
    ) -> Result<RecordDecisionTaskStartedResponse, CoreError> {
        self.decisions
            .record_decision_task_started(&self.bounded(ctx), request)
            .await
    }

    /// Apply a completed decision
    pub async fn respond_decision_task_completed(
        &self,
        ctx: &OperationContext,
        request: RespondDecisionTaskCompletedRequest,
    ) -> Result<RespondDecisionTaskCompletedResponse, CoreError> {
        self.decisions
            .respond_decision_task_completed(&self.bounded(ctx), request)
            .await
    }

    /// Fail a decision and reschedule it
    pub async fn respond_decision_task_failed(
        &self,
        ctx: &OperationContext,
        request: RespondDecisionTaskFailedRequest,
    ) -> Result<i64, CoreError> {
        self.decisions
            .respond_decision_task_failed(&self.bounded(ctx), request)
            .await
    }

    /// Apply a decision timeout from the timeout sweeper
    pub async fn time_out_decision_task(
        &self,
        ctx: &OperationContext,
        task: DecisionTimeoutTask,
    ) -> Result<bool, CoreError> {
        self.decisions
            .time_out_decision_task(&self.bounded(ctx), task)
            .await
    }

    // ----- activities -----

    /// Start an activity for a poller
    pub async fn record_activity_task_started(
        &self,
        ctx: &OperationContext,
        request: RecordActivityTaskStartedRequest,
    ) -> Result<RecordActivityTaskStartedResponse, CoreError> {
        require_domain(&request.domain_id)?;
        let ctx = self.new_child_context(&self.bounded(ctx));
        let key = ExecutionKey::new(&request.domain_id, &request.execution);

        self.update(key, &ctx, |state| {
            ensure_running(state)?;
            let activity = match state.pending_activity(request.schedule_id) {
                Some(activity) => activity.clone(),
                None => return Err(missing_activity(state, request.schedule_id)),
            };

            if activity.is_started() {
                return if activity.request_id.as_deref() == Some(request.request_id.as_str()) {
                    Ok(Mutation::Unchanged(activity_response(state, &activity)))
                } else {
                    Err(CoreError::EventAlreadyStarted(format!(
                        "activity {} already started by another request",
                        request.schedule_id
                    )))
                };
            }

            let activity = state.add_activity_task_started_event(
                request.schedule_id,
                request.request_id.clone(),
                request.identity.clone(),
            )?;
            Ok(Mutation::Persist(activity_response(state, &activity)))
        })
        .await
    }

    /// Complete a started activity
    pub async fn respond_activity_task_completed(
        &self,
        ctx: &OperationContext,
        request: RespondActivityTaskCompletedRequest,
    ) -> Result<(), CoreError> {
        let token = &request.task_token;
        require_domain(&token.domain_id)?;

        self.update(token.key(), &self.bounded(ctx), |state| {
            ensure_running(state)?;
            let started_id = started_activity(state, token.schedule_id)?;
            state.add_activity_task_completed_event(
                token.schedule_id,
                started_id,
                request.result.clone(),
                request.identity.clone(),
            )?;
            schedule_decision_if_idle(state)?;
            Ok(Mutation::Persist(()))
        })
        .await
    }

    /// Fail a started activity
    pub async fn respond_activity_task_failed(
        &self,
        ctx: &OperationContext,
        request: RespondActivityTaskFailedRequest,
    ) -> Result<(), CoreError> {
        let token = &request.task_token;
        require_domain(&token.domain_id)?;

        self.update(token.key(), &self.bounded(ctx), |state| {
            ensure_running(state)?;
            let started_id = started_activity(state, token.schedule_id)?;
            state.add_activity_task_failed_event(
                token.schedule_id,
                started_id,
                request.reason.clone(),
                request.details.clone(),
                request.identity.clone(),
            )?;
            schedule_decision_if_idle(state)?;
            Ok(Mutation::Persist(()))
        })
        .await
    }

    // ----- external requests -----

    /// Deliver a signal; a repeated request id is accepted without a new event
    pub async fn signal_workflow_execution(
        &self,
        ctx: &OperationContext,
        request: SignalWorkflowExecutionRequest,
    ) -> Result<(), CoreError> {
        require_domain(&request.domain_id)?;
        require_non_empty(&request.signal_name, "Signal name is not set on request.")?;
        let ctx = self.bounded(ctx);
        let key = self
            .resolve(&ctx, &request.domain_id, &request.workflow_id, request.run_id.as_deref())
            .await?;

        self.update(key, &ctx, |state| {
            ensure_running(state)?;
            if let Some(request_id) = request.request_id.as_deref() {
                if state.is_signal_requested(request_id) {
                    debug!(request_id, "Duplicate signal request");
                    return Ok(Mutation::Unchanged(()));
                }
            }
            state.add_workflow_execution_signaled_event(
                request.signal_name.clone(),
                request.input.clone(),
                request.identity.clone(),
                request.request_id.clone(),
            )?;
            schedule_decision_if_idle(state)?;
            Ok(Mutation::Persist(()))
        })
        .await
    }

    /// Ask a run to cancel; a repeated request is a no-op
    pub async fn request_cancel_workflow_execution(
        &self,
        ctx: &OperationContext,
        request: RequestCancelWorkflowExecutionRequest,
    ) -> Result<(), CoreError> {
        require_domain(&request.domain_id)?;
        let ctx = self.bounded(ctx);
        let key = self
            .resolve(&ctx, &request.domain_id, &request.workflow_id, request.run_id.as_deref())
            .await?;

        self.update(key, &ctx, |state| {
            ensure_running(state)?;
            if state.is_cancel_requested() {
                debug!(workflow_id = %request.workflow_id, "Cancellation already requested");
                return Ok(Mutation::Unchanged(()));
            }
            state.add_workflow_execution_cancel_requested_event(
                request.cause.clone(),
                request.identity.clone(),
                request.request_id.clone(),
            )?;
            schedule_decision_if_idle(state)?;
            Ok(Mutation::Persist(()))
        })
        .await
    }

    /// Close a run immediately
    pub async fn terminate_workflow_execution(
        &self,
        ctx: &OperationContext,
        request: TerminateWorkflowExecutionRequest,
    ) -> Result<(), CoreError> {
        require_domain(&request.domain_id)?;
        let ctx = self.bounded(ctx);
        let key = self
            .resolve(&ctx, &request.domain_id, &request.workflow_id, request.run_id.as_deref())
            .await?;

        self.update(key, &ctx, |state| {
            ensure_running(state)?;
            state.add_workflow_execution_terminated_event(
                request.reason.clone(),
                request.details.clone(),
                request.identity.clone(),
            )?;
            Ok(Mutation::Persist(()))
        })
        .await?;

        info!(workflow_id = %request.workflow_id, reason = %request.reason, "Workflow terminated");
        Ok(())
    }

    /// Fire a user timer from the timer sweeper; returns false when stale
    pub async fn fire_user_timer(&self, ctx: &OperationContext, task: UserTimerTask) -> Result<bool, CoreError> {
        require_domain(&task.domain_id)?;
        let key = ExecutionKey::new(&task.domain_id, &task.execution);

        self.update(key, &self.bounded(ctx), |state| {
            if !state.is_workflow_running() || state.pending_timer(&task.timer_id).is_none() {
                return Ok(Mutation::Unchanged(false));
            }
            state.add_timer_fired_event(&task.timer_id)?;
            schedule_decision_if_idle(state)?;
            Ok(Mutation::Persist(true))
        })
        .await
    }

    // ----- reads -----

    /// Ask the workflow a question through its next decision task
    ///
    /// The query is buffered on the run and answered when a worker completes
    /// a decision that carried it. The call waits until the deadline; on
    /// timeout the query is withdrawn.
    pub async fn query_workflow(
        &self,
        ctx: &OperationContext,
        request: QueryWorkflowRequest,
    ) -> Result<QueryWorkflowResponse, CoreError> {
        require_domain(&request.domain_id)?;
        require_non_empty(&request.query.query_type, "QueryType is not set on request.")?;
        let ctx = self.bounded(ctx);
        let key = ExecutionKey::new(&request.domain_id, &request.execution);

        let (query_id, receiver) = self.buffer_query(&ctx, key.clone(), &request).await?;
        match ctx.bound(wait_for_outcome(receiver)).await {
            Ok(QueryOutcome::Answered(answer)) => Ok(QueryWorkflowResponse { query_result: answer }),
            Ok(QueryOutcome::Failed(reason)) => Err(CoreError::QueryFailed(reason)),
            Err(CoreError::Timeout(message)) => {
                self.withdraw_query(key, &query_id).await;
                Err(CoreError::Timeout(message))
            }
            Err(err) => Err(err),
        }
    }

    async fn buffer_query(
        &self,
        ctx: &OperationContext,
        key: ExecutionKey,
        request: &QueryWorkflowRequest,
    ) -> Result<(String, QueryTermination), CoreError> {
        let mut guard = self.cache.acquire(key, ctx).await?;
        let result = match ctx.bound(guard.load_state()).await {
            Ok(state) if state.is_workflow_running() => {
                Ok(state.query_registry_mut().buffer_query(request.query.clone()))
            }
            Ok(_) => Err(CoreError::EntityNotExists(WORKFLOW_COMPLETED_MESSAGE.to_string())),
            Err(err) => Err(err),
        };
        guard.release(result.as_ref().err());
        result
    }

    async fn withdraw_query(&self, key: ExecutionKey, query_id: &str) {
        let ctx = OperationContext::with_timeout(self.config.default_operation_timeout());
        match self.cache.acquire(key, &ctx).await {
            Ok(mut guard) => {
                if let Some(state) = guard.loaded_state_mut() {
                    state.query_registry_mut().remove(query_id);
                }
                guard.release(None);
            }
            Err(err) => warn!(query_id, error = %err, "Could not withdraw timed out query"),
        }
    }

    /// Read-only view of a run
    pub async fn get_mutable_state(
        &self,
        ctx: &OperationContext,
        request: GetMutableStateRequest,
    ) -> Result<GetMutableStateResponse, CoreError> {
        require_domain(&request.domain_id)?;
        let ctx = self.bounded(ctx);
        let key = ExecutionKey::new(&request.domain_id, &request.execution);

        let mut guard = self.cache.acquire(key, &ctx).await?;
        let result = ctx.bound(guard.load_state()).await.map(|state| describe(state));
        guard.release(result.as_ref().err());
        result
    }

    async fn resolve(
        &self,
        ctx: &OperationContext,
        domain_id: &DomainId,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> Result<ExecutionKey, CoreError> {
        require_non_empty(workflow_id, "WorkflowId is not set on request.")?;
        let run_id = match run_id {
            Some(run_id) if !run_id.is_empty() => run_id.to_string(),
            _ => {
                let lookup = async {
                    self.execution_store
                        .get_current_execution(GetCurrentExecutionRequest {
                            domain_id: domain_id.clone(),
                            workflow_id: workflow_id.to_string(),
                        })
                        .await
                        .map_err(CoreError::from)
                };
                ctx.bound(lookup).await?.run_id
            }
        };
        Ok(ExecutionKey::new(domain_id, &WorkflowExecution::new(workflow_id, run_id)))
    }

    async fn update<T, F>(&self, key: ExecutionKey, ctx: &OperationContext, mutate: F) -> Result<T, CoreError>
    where
        T: Send,
        F: FnMut(&mut MutableState) -> Result<Mutation<T>, CoreError> + Send,
    {
        update_workflow_execution(&self.cache, key, self.config.conditional_retry_count, ctx, mutate).await
    }
}

impl std::fmt::Debug for HistoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryEngine")
            .field("shard", &self.shard)
            .field("cache", &self.cache)
            .finish()
    }
}

async fn wait_for_outcome(mut receiver: QueryTermination) -> Result<QueryOutcome, CoreError> {
    loop {
        if let Some(outcome) = receiver.borrow().clone() {
            return Ok(outcome);
        }
        if receiver.changed().await.is_err() {
            return Err(CoreError::QueryFailed(QUERY_DISCARDED_REASON.to_string()));
        }
    }
}

fn ensure_running(state: &MutableState) -> Result<(), CoreError> {
    if state.is_workflow_running() {
        Ok(())
    } else {
        Err(CoreError::EntityNotExists(WORKFLOW_COMPLETED_MESSAGE.to_string()))
    }
}

fn schedule_decision_if_idle(state: &mut MutableState) -> Result<(), CoreError> {
    if !state.has_pending_decision() {
        state.add_decision_task_scheduled_event()?;
    }
    Ok(())
}

fn missing_activity(state: &MutableState, schedule_id: i64) -> CoreError {
    if schedule_id >= state.next_event_id() {
        CoreError::ConditionFailed(format!(
            "schedule id {} is beyond next event id {}",
            schedule_id,
            state.next_event_id()
        ))
    } else {
        CoreError::EntityNotExists(ACTIVITY_NOT_FOUND_MESSAGE.to_string())
    }
}

fn started_activity(state: &MutableState, schedule_id: i64) -> Result<i64, CoreError> {
    match state.pending_activity(schedule_id) {
        Some(activity) if activity.is_started() => Ok(activity.started_id),
        Some(_) => Err(CoreError::EntityNotExists(ACTIVITY_NOT_FOUND_MESSAGE.to_string())),
        None => Err(missing_activity(state, schedule_id)),
    }
}

fn activity_response(state: &MutableState, activity: &ActivityInfo) -> RecordActivityTaskStartedResponse {
    RecordActivityTaskStartedResponse {
        scheduled_event: activity.scheduled_event.clone(),
        started_timestamp: activity.started_timestamp,
        attempt: activity.attempt,
        heartbeat_details: activity.details.clone(),
        workflow_type: state.execution_info().workflow_type.clone(),
    }
}

fn describe(state: &MutableState) -> GetMutableStateResponse {
    let info = state.execution_info();
    GetMutableStateResponse {
        execution: state.execution(),
        workflow_type: info.workflow_type.clone(),
        status: info.status,
        next_event_id: state.next_event_id(),
        previous_started_event_id: state.previous_started_event_id(),
        last_first_event_id: info.last_first_event_id,
        is_workflow_running: state.is_workflow_running(),
        task_list: info.task_list.clone(),
        sticky_task_list: info.sticky_task_list.clone(),
        sticky_schedule_to_start_timeout_secs: info.sticky_schedule_to_start_timeout_secs,
        branch_token: state.current_branch_token().to_vec(),
        last_transaction_id: state.committed_transaction_id(),
    }
}
