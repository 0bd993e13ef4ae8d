//! Start and signal-with-start orchestration
//!
//! A start builds the new run in memory, appends its history and asks the
//! store to create it as the current run of the workflow id. When another
//! run holds the id, the store reports it and the orchestrator decides:
//! same request id means the start already happened, an open run always
//! wins, and a closed run is replaced only when the reuse policy allows.

use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::deadline::OperationContext;
use super::decision_handler::WORKFLOW_COMPLETED_MESSAGE;
use super::execution_cache::{ContextGuard, ExecutionCache};
use super::execution_context::CreateOutcome;
use super::retry::{update_workflow_execution, Mutation};
use crate::config::EngineConfig;
use crate::domain::events::WorkflowExecutionStartedAttributes;
use crate::domain::execution::{
    DomainId, ExecutionKey, TaskList, WorkflowExecution, WorkflowIdReusePolicy, WorkflowStatus,
};
use crate::domain::mutable_state::MutableState;
use crate::domain::persistence::{
    AlreadyStartedConflict, CreateWorkflowMode, ExecutionStore, GetCurrentExecutionRequest,
    GetCurrentExecutionResponse,
};
use crate::domain::shard::ShardContext;
use crate::types::{
    require_domain, require_non_empty, SignalWithStartWorkflowExecutionRequest,
    StartWorkflowExecutionRequest, StartWorkflowExecutionResponse,
};
use crate::CoreError;

/// Creates runs and routes signal-with-start requests
pub struct StartSignalOrchestrator {
    cache: ExecutionCache,
    execution_store: Arc<dyn ExecutionStore>,
    shard: Arc<ShardContext>,
    config: Arc<EngineConfig>,
}

impl StartSignalOrchestrator {
    /// Create an orchestrator
    pub fn new(
        cache: ExecutionCache,
        execution_store: Arc<dyn ExecutionStore>,
        shard: Arc<ShardContext>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            cache,
            execution_store,
            shard,
            config,
        }
    }

    /// Start a new run, or return the run this request already started
    pub async fn start_workflow_execution(
        &self,
        op_ctx: &OperationContext,
        request: StartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse, CoreError> {
        let attributes = validate_start_request(&request)?;
        let policy = request.workflow_id_reuse_policy.unwrap_or_default();

        let mut state = self.new_run(&request.domain_id, &request.workflow_id);
        state.add_workflow_execution_started_event(attributes)?;
        state.add_decision_task_scheduled_event()?;

        let run_id = self
            .create_run(op_ctx, state, &request.request_id, policy, CreateWorkflowMode::BrandNew)
            .await?;
        Ok(StartWorkflowExecutionResponse { run_id })
    }

    /// Signal the current run, or start a new run carrying the signal
    pub async fn signal_with_start_workflow_execution(
        &self,
        op_ctx: &OperationContext,
        request: SignalWithStartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse, CoreError> {
        require_domain(&request.domain_id)?;
        require_non_empty(&request.signal_name, "Signal name is not set on request.")?;
        let start = request.start_request();
        let attributes = validate_start_request(&start)?;
        let policy = start.workflow_id_reuse_policy.unwrap_or_default();

        let current = self.current_execution(op_ctx, &request.domain_id, &request.workflow_id).await?;
        let mut mode = CreateWorkflowMode::BrandNew;

        if let Some(current) = current {
            if current.status.is_open() {
                match self.signal_running(op_ctx, &request, &current.run_id).await {
                    Ok(()) => {
                        return Ok(StartWorkflowExecutionResponse {
                            run_id: current.run_id,
                        })
                    }
                    // Closed between the lookup and the lock; start a new run instead
                    Err(CoreError::EntityNotExists(_)) => {
                        debug!(
                            workflow_id = %request.workflow_id,
                            run_id = %current.run_id,
                            "Current run closed before it could be signaled"
                        );
                    }
                    Err(err) => return Err(err),
                }
            } else {
                if !policy.allows_reuse_of(current.status) {
                    return Err(policy_rejection(
                        current.status,
                        &current.start_request_id,
                        &current.run_id,
                        policy,
                    ));
                }
                mode = CreateWorkflowMode::WorkflowIdReuse {
                    previous_run_id: current.run_id.clone(),
                    previous_last_write_version: current.last_write_version,
                };
            }
        }

        let mut state = self.new_run(&request.domain_id, &request.workflow_id);
        state.add_workflow_execution_started_event(attributes)?;
        state.add_workflow_execution_signaled_event(
            request.signal_name.clone(),
            request.signal_input.clone(),
            request.identity.clone(),
            Some(request.request_id.clone()),
        )?;
        state.add_decision_task_scheduled_event()?;

        let run_id = self
            .create_run(op_ctx, state, &request.request_id, policy, mode)
            .await?;
        Ok(StartWorkflowExecutionResponse { run_id })
    }

    fn new_run(&self, domain_id: &DomainId, workflow_id: &str) -> MutableState {
        let execution = WorkflowExecution::new(workflow_id, Uuid::new_v4().to_string());
        let mut state = MutableState::new(
            domain_id.clone(),
            &execution,
            self.shard.failover_version(domain_id),
        );
        state.set_transaction_task_id(self.shard.next_task_id());
        state
    }

    async fn current_execution(
        &self,
        op_ctx: &OperationContext,
        domain_id: &DomainId,
        workflow_id: &str,
    ) -> Result<Option<GetCurrentExecutionResponse>, CoreError> {
        let lookup = async {
            self.execution_store
                .get_current_execution(GetCurrentExecutionRequest {
                    domain_id: domain_id.clone(),
                    workflow_id: workflow_id.to_string(),
                })
                .await
                .map_err(CoreError::from)
        };
        match op_ctx.bound(lookup).await {
            Ok(current) => Ok(Some(current)),
            Err(CoreError::EntityNotExists(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn signal_running(
        &self,
        op_ctx: &OperationContext,
        request: &SignalWithStartWorkflowExecutionRequest,
        run_id: &str,
    ) -> Result<(), CoreError> {
        let key = ExecutionKey::new(
            &request.domain_id,
            &WorkflowExecution::new(request.workflow_id.clone(), run_id),
        );
        update_workflow_execution(
            &self.cache,
            key,
            self.config.conditional_retry_count,
            op_ctx,
            |state| {
                if !state.is_workflow_running() {
                    return Err(CoreError::EntityNotExists(WORKFLOW_COMPLETED_MESSAGE.to_string()));
                }
                if state.is_signal_requested(&request.request_id) {
                    debug!(request_id = %request.request_id, "Duplicate signal-with-start request");
                    return Ok(Mutation::Unchanged(()));
                }
                state.add_workflow_execution_signaled_event(
                    request.signal_name.clone(),
                    request.signal_input.clone(),
                    request.identity.clone(),
                    Some(request.request_id.clone()),
                )?;
                if !state.has_pending_decision() {
                    state.add_decision_task_scheduled_event()?;
                }
                Ok(Mutation::Persist(()))
            },
        )
        .await
    }

    /// Persist a brand new run, resolving a conflict with the current run once
    async fn create_run(
        &self,
        op_ctx: &OperationContext,
        state: MutableState,
        request_id: &str,
        policy: WorkflowIdReusePolicy,
        mode: CreateWorkflowMode,
    ) -> Result<String, CoreError> {
        let execution = state.execution();
        let key = ExecutionKey::new(&state.execution_info().domain_id, &execution);

        let mut guard = self.cache.acquire(key, op_ctx).await?;
        let result = self
            .create_run_locked(&mut guard, op_ctx, state, request_id, policy, mode)
            .await;
        guard.release(result.as_ref().err());

        if let Ok(run_id) = &result {
            info!(
                workflow_id = %execution.workflow_id,
                run_id = %run_id,
                created = run_id == &execution.run_id,
                "Workflow start handled"
            );
        }
        result
    }

    async fn create_run_locked(
        &self,
        guard: &mut ContextGuard,
        op_ctx: &OperationContext,
        state: MutableState,
        request_id: &str,
        policy: WorkflowIdReusePolicy,
        mode: CreateWorkflowMode,
    ) -> Result<String, CoreError> {
        let run_id = state.execution().run_id;
        op_ctx.bound(guard.append_initial_history(&state)).await?;

        let retry_as_reuse = matches!(mode, CreateWorkflowMode::BrandNew);
        let conflict = match op_ctx.bound(guard.create_workflow_execution(&state, mode)).await? {
            CreateOutcome::Created => {
                guard.install(state);
                return Ok(run_id);
            }
            CreateOutcome::Conflict(conflict) => conflict,
        };

        if conflict.start_request_id == request_id {
            debug!(run_id = %conflict.run_id, "Start request already handled");
            return Ok(conflict.run_id);
        }
        if !retry_as_reuse || conflict.status.is_open() {
            return Err(already_started(&conflict));
        }
        if !policy.allows_reuse_of(conflict.status) {
            return Err(policy_rejection(
                conflict.status,
                &conflict.start_request_id,
                &conflict.run_id,
                policy,
            ));
        }

        // The history branch is already written; only the row is retried
        let mode = CreateWorkflowMode::WorkflowIdReuse {
            previous_run_id: conflict.run_id.clone(),
            previous_last_write_version: conflict.last_write_version,
        };
        match op_ctx.bound(guard.create_workflow_execution(&state, mode)).await? {
            CreateOutcome::Created => {
                guard.install(state);
                Ok(run_id)
            }
            CreateOutcome::Conflict(conflict) if conflict.start_request_id == request_id => Ok(conflict.run_id),
            CreateOutcome::Conflict(conflict) => Err(already_started(&conflict)),
        }
    }
}

fn validate_start_request(
    request: &StartWorkflowExecutionRequest,
) -> Result<WorkflowExecutionStartedAttributes, CoreError> {
    require_domain(&request.domain_id)?;
    require_non_empty(&request.workflow_id, "WorkflowId is not set on request.")?;
    require_non_empty(&request.workflow_type, "WorkflowType is not set on request.")?;
    require_non_empty(&request.task_list, "TaskList is not set on request.")?;
    require_non_empty(&request.request_id, "RequestId is not set on request.")?;

    let execution_timeout = match request.execution_start_to_close_timeout_seconds {
        Some(secs) if secs > 0 => secs,
        _ => {
            return Err(CoreError::BadRequest(
                "Missing or invalid ExecutionStartToCloseTimeoutSeconds.".to_string(),
            ))
        }
    };
    let decision_timeout = match request.task_start_to_close_timeout_seconds {
        Some(secs) if secs > 0 => secs,
        _ => {
            return Err(CoreError::BadRequest(
                "Missing or invalid TaskStartToCloseTimeoutSeconds.".to_string(),
            ))
        }
    };

    Ok(WorkflowExecutionStartedAttributes {
        workflow_type: request.workflow_type.clone(),
        task_list: TaskList::normal(request.task_list.clone()),
        input: request.input.clone(),
        execution_start_to_close_timeout_seconds: execution_timeout,
        task_start_to_close_timeout_seconds: decision_timeout,
        identity: request.identity.clone(),
        request_id: request.request_id.clone(),
        workflow_id_reuse_policy: request.workflow_id_reuse_policy.unwrap_or_default(),
        continued_execution_run_id: None,
        parent_workflow_id: None,
        parent_run_id: None,
    })
}

fn already_started(conflict: &AlreadyStartedConflict) -> CoreError {
    CoreError::WorkflowExecutionAlreadyStarted {
        message: format!("Workflow execution is already running. RunId: {}", conflict.run_id),
        start_request_id: conflict.start_request_id.clone(),
        run_id: conflict.run_id.clone(),
    }
}

fn policy_rejection(
    status: WorkflowStatus,
    start_request_id: &str,
    run_id: &str,
    policy: WorkflowIdReusePolicy,
) -> CoreError {
    CoreError::WorkflowExecutionAlreadyStarted {
        message: format!(
            "Workflow execution already finished with status {:?}; reuse policy {:?} rejects a new run",
            status, policy
        ),
        start_request_id: start_request_id.to_string(),
        run_id: run_id.to_string(),
    }
}
