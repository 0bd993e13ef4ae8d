//! Store mocks and fixtures shared by the application unit tests

use async_trait::async_trait;
use mockall::mock;

use crate::domain::execution::{DomainId, WorkflowExecution};
use crate::domain::mutable_state::MutableStateSnapshot;
use crate::domain::persistence::*;
use crate::testing::TestWorkflow;

mock! {
    pub ExecutionStore {}

    #[async_trait]
    impl ExecutionStore for ExecutionStore {
        async fn get_workflow_execution(&self, request: GetWorkflowExecutionRequest) -> Result<GetWorkflowExecutionResponse, PersistenceError>;
        async fn create_workflow_execution(&self, request: CreateWorkflowExecutionRequest) -> Result<(), PersistenceError>;
        async fn update_workflow_execution(&self, request: UpdateWorkflowExecutionRequest) -> Result<(), PersistenceError>;
        async fn get_current_execution(&self, request: GetCurrentExecutionRequest) -> Result<GetCurrentExecutionResponse, PersistenceError>;
    }
}

mock! {
    pub HistoryStore {}

    #[async_trait]
    impl HistoryStore for HistoryStore {
        async fn append_history_nodes(&self, request: AppendHistoryNodesRequest) -> Result<AppendHistoryNodesResponse, PersistenceError>;
        async fn read_history_branch(&self, request: ReadHistoryBranchRequest) -> Result<ReadHistoryBranchResponse, PersistenceError>;
    }
}

/// Open run with the first decision scheduled (next event id 3)
pub fn running_snapshot(workflow_id: &str, run_id: &str) -> MutableStateSnapshot {
    TestWorkflow::with_pending_decision(
        &DomainId("domain".to_string()),
        &WorkflowExecution::new(workflow_id, run_id),
    )
    .expect("fixture history is valid")
    .snapshot()
}

/// History store that accepts every append
pub fn accepting_history_store() -> MockHistoryStore {
    let mut store = MockHistoryStore::new();
    store
        .expect_append_history_nodes()
        .returning(|_| Ok(AppendHistoryNodesResponse { size: 0 }));
    store
}
