use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use chronicle_core::domain::execution::{DomainId, ExecutionKey, WorkflowStatus};
use chronicle_core::domain::mutable_state::MutableStateSnapshot;
use chronicle_core::domain::persistence::{
    AlreadyStartedConflict, CreateWorkflowExecutionRequest, CreateWorkflowMode, ExecutionStore,
    GetCurrentExecutionRequest, GetCurrentExecutionResponse, GetWorkflowExecutionRequest,
    GetWorkflowExecutionResponse, PersistenceError, UpdateWorkflowExecutionRequest,
};

/// Current-run pointer of one workflow id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentRun {
    /// Run id
    pub run_id: String,
    /// Request id that created the run
    pub start_request_id: String,
    /// Run status
    pub status: WorkflowStatus,
    /// Last write version of the run
    pub last_write_version: i64,
}

impl CurrentRun {
    fn of(snapshot: &MutableStateSnapshot) -> Self {
        Self {
            run_id: snapshot.execution_info.run_id.clone(),
            start_request_id: snapshot.execution_info.start_request_id.clone(),
            status: snapshot.execution_info.status,
            last_write_version: snapshot.version_history.last_write_version,
        }
    }

    fn conflict(&self, workflow_id: &str) -> AlreadyStartedConflict {
        AlreadyStartedConflict {
            message: format!(
                "Workflow execution already started. WorkflowId: {}, RunId: {}",
                workflow_id, self.run_id
            ),
            start_request_id: self.start_request_id.clone(),
            run_id: self.run_id.clone(),
            status: self.status,
            last_write_version: self.last_write_version,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<ExecutionKey, MutableStateSnapshot>,
    current: HashMap<(DomainId, String), CurrentRun>,
}

/// In-memory execution rows and current-run pointers
///
/// Creates and updates are checked against the shard range id the store was
/// built with; a writer presenting another range id has lost the shard.
#[derive(Debug)]
pub struct InMemoryExecutionStore {
    tables: RwLock<Tables>,
    range_id: AtomicI64,
}

impl InMemoryExecutionStore {
    /// Create an empty store owned by `range_id`
    pub fn new(range_id: i64) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            range_id: AtomicI64::new(range_id),
        }
    }

    /// Hand the shard to another owner
    pub fn set_range_id(&self, range_id: i64) {
        self.range_id.store(range_id, Ordering::Release);
    }

    /// Current-run pointer of a workflow id
    pub async fn current_run(&self, domain_id: &DomainId, workflow_id: &str) -> Option<CurrentRun> {
        let tables = self.tables.read().await;
        tables
            .current
            .get(&(domain_id.clone(), workflow_id.to_string()))
            .cloned()
    }

    /// Number of stored runs
    pub async fn run_count(&self) -> usize {
        self.tables.read().await.rows.len()
    }

    fn check_range(&self, range_id: i64) -> Result<(), PersistenceError> {
        let owned = self.range_id.load(Ordering::Acquire);
        if range_id == owned {
            Ok(())
        } else {
            warn!(presented = range_id, owned, "Rejected write from stale shard owner");
            Err(PersistenceError::ShardOwnershipLost(format!(
                "range id {} does not match {}",
                range_id, owned
            )))
        }
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn get_workflow_execution(
        &self,
        request: GetWorkflowExecutionRequest,
    ) -> Result<GetWorkflowExecutionResponse, PersistenceError> {
        let key = ExecutionKey::new(&request.domain_id, &request.execution);
        let tables = self.tables.read().await;
        match tables.rows.get(&key) {
            Some(snapshot) => Ok(GetWorkflowExecutionResponse { state: snapshot.clone() }),
            None => Err(PersistenceError::EntityNotExists(format!(
                "Workflow execution not found. WorkflowId: {}, RunId: {}",
                request.execution.workflow_id, request.execution.run_id
            ))),
        }
    }

    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<(), PersistenceError> {
        self.check_range(request.range_id)?;
        let info = &request.new_snapshot.execution_info;
        let current_key = (info.domain_id.clone(), info.workflow_id.clone());
        let key = ExecutionKey::new(&info.domain_id, &info.execution());

        let mut tables = self.tables.write().await;
        if let Some(current) = tables.current.get(&current_key) {
            match &request.mode {
                CreateWorkflowMode::BrandNew => {
                    return Err(PersistenceError::WorkflowExecutionAlreadyStarted(
                        current.conflict(&info.workflow_id),
                    ));
                }
                CreateWorkflowMode::WorkflowIdReuse {
                    previous_run_id,
                    previous_last_write_version,
                } => {
                    let moved_on = current.run_id != *previous_run_id
                        || current.last_write_version != *previous_last_write_version;
                    if moved_on || current.status.is_open() {
                        return Err(PersistenceError::WorkflowExecutionAlreadyStarted(
                            current.conflict(&info.workflow_id),
                        ));
                    }
                }
            }
        } else if let CreateWorkflowMode::WorkflowIdReuse { previous_run_id, .. } = &request.mode {
            return Err(PersistenceError::ConditionFailed(format!(
                "current run {} of {} no longer exists",
                previous_run_id, info.workflow_id
            )));
        }

        debug!(workflow_id = %info.workflow_id, run_id = %info.run_id, "Created workflow execution");
        tables.current.insert(current_key, CurrentRun::of(&request.new_snapshot));
        tables.rows.insert(key, request.new_snapshot);
        Ok(())
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<(), PersistenceError> {
        self.check_range(request.condition.range_id)?;
        let info = &request.snapshot.execution_info;
        let key = ExecutionKey::new(&info.domain_id, &info.execution());
        let current_key = (info.domain_id.clone(), info.workflow_id.clone());

        let mut tables = self.tables.write().await;
        let stored = tables.rows.get(&key).ok_or_else(|| {
            PersistenceError::EntityNotExists(format!(
                "Workflow execution not found. WorkflowId: {}, RunId: {}",
                info.workflow_id, info.run_id
            ))
        })?;

        let stored_next = stored.execution_info.next_event_id;
        if stored_next != request.condition.expected_next_event_id {
            debug!(
                workflow_id = %info.workflow_id,
                expected = request.condition.expected_next_event_id,
                stored = stored_next,
                "Conditional update lost"
            );
            return Err(PersistenceError::ConditionFailed(format!(
                "next event id is {}, writer expected {}",
                stored_next, request.condition.expected_next_event_id
            )));
        }

        if let Some(current) = tables.current.get_mut(&current_key) {
            if current.run_id == info.run_id {
                *current = CurrentRun::of(&request.snapshot);
            }
        }
        tables.rows.insert(key, request.snapshot);
        Ok(())
    }

    async fn get_current_execution(
        &self,
        request: GetCurrentExecutionRequest,
    ) -> Result<GetCurrentExecutionResponse, PersistenceError> {
        let current = self
            .current_run(&request.domain_id, &request.workflow_id)
            .await
            .ok_or_else(|| {
                PersistenceError::EntityNotExists(format!(
                    "Workflow execution not found. WorkflowId: {}",
                    request.workflow_id
                ))
            })?;
        Ok(GetCurrentExecutionResponse {
            run_id: current.run_id,
            start_request_id: current.start_request_id,
            status: current.status,
            last_write_version: current.last_write_version,
        })
    }
}
