//! Shared mocks and builders for the engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chronicle_core::domain::persistence::*;
use chronicle_core::testing::TestWorkflow;
use chronicle_core::types::RecordDecisionTaskStartedRequest;
use chronicle_core::{
    DomainId, EngineConfig, HistoryEngine, MutableStateSnapshot, ShardContext, TaskList,
    WorkflowExecution,
};
use mockall::mock;
use std::sync::Arc;

mock! {
    pub Executions {}

    #[async_trait]
    impl ExecutionStore for Executions {
        async fn get_workflow_execution(&self, request: GetWorkflowExecutionRequest) -> Result<GetWorkflowExecutionResponse, PersistenceError>;
        async fn create_workflow_execution(&self, request: CreateWorkflowExecutionRequest) -> Result<(), PersistenceError>;
        async fn update_workflow_execution(&self, request: UpdateWorkflowExecutionRequest) -> Result<(), PersistenceError>;
        async fn get_current_execution(&self, request: GetCurrentExecutionRequest) -> Result<GetCurrentExecutionResponse, PersistenceError>;
    }
}

mock! {
    pub Histories {}

    #[async_trait]
    impl HistoryStore for Histories {
        async fn append_history_nodes(&self, request: AppendHistoryNodesRequest) -> Result<AppendHistoryNodesResponse, PersistenceError>;
        async fn read_history_branch(&self, request: ReadHistoryBranchRequest) -> Result<ReadHistoryBranchResponse, PersistenceError>;
    }
}

pub const WORKFLOW_ID: &str = "wId";
pub const RUN_ID: &str = "rId";

pub fn domain() -> DomainId {
    DomainId("domain".to_string())
}

pub fn execution() -> WorkflowExecution {
    WorkflowExecution::new(WORKFLOW_ID, RUN_ID)
}

/// Open run whose first decision is scheduled at event 2
pub fn running_snapshot() -> MutableStateSnapshot {
    TestWorkflow::with_pending_decision(&domain(), &execution())
        .expect("fixture history is valid")
        .snapshot()
}

pub fn accepting_histories() -> MockHistories {
    let mut histories = MockHistories::new();
    histories
        .expect_append_history_nodes()
        .returning(|_| Ok(AppendHistoryNodesResponse { size: 0 }));
    histories
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn engine_with(executions: MockExecutions, config: EngineConfig) -> HistoryEngine {
    init_tracing();
    HistoryEngine::new(
        config,
        Arc::new(executions),
        Arc::new(accepting_histories()),
        Arc::new(ShardContext::local(1, 1)),
    )
    .expect("valid engine configuration")
}

pub fn decision_poll(schedule_id: i64, request_id: &str) -> RecordDecisionTaskStartedRequest {
    RecordDecisionTaskStartedRequest {
        domain_id: domain(),
        execution: execution(),
        schedule_id,
        task_id: 100,
        request_id: request_id.to_string(),
        identity: "poller".to_string(),
        poll_task_list: TaskList::normal("testTaskList"),
    }
}
