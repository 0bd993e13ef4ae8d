//! Harness for cross-crate scenarios
//!
//! A [`TestCluster`] wires one or more history engines to a shared pair of
//! in-memory stores, the way several hosts would share a database.

use std::collections::BTreeMap;
use std::sync::Arc;

use chronicle_core::domain::decision::Decision;
use chronicle_core::domain::events::HistoryEvent;
use chronicle_core::types::{
    GetMutableStateRequest, GetMutableStateResponse, RecordDecisionTaskStartedRequest,
    RespondDecisionTaskCompletedRequest, StartWorkflowExecutionRequest, TaskToken,
};
use chronicle_core::{
    DomainId, EngineConfig, HistoryEngine, OperationContext, ShardContext, TaskList,
    WorkflowExecution, WorkflowIdReusePolicy,
};
use chronicle_state_inmemory::InMemoryStateStoreProvider;

/// Domain every scenario runs in
pub const DOMAIN: &str = "scenario-domain";
/// Task list every scenario starts workflows on
pub const TASK_LIST: &str = "scenario-task-list";

/// Engines sharing one set of in-memory stores
pub struct TestCluster {
    provider: InMemoryStateStoreProvider,
    shard: Arc<ShardContext>,
    config: EngineConfig,
    engine: Arc<HistoryEngine>,
}

impl TestCluster {
    /// Cluster with the default engine configuration
    pub fn new() -> anyhow::Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    /// Cluster whose engines use `config`
    pub fn with_config(config: EngineConfig) -> anyhow::Result<Self> {
        chronicle_monitoring::init_test_logging();
        let provider = InMemoryStateStoreProvider::new(1);
        let shard = Arc::new(ShardContext::local(1, 1));
        let engine = Arc::new(Self::build(&provider, &shard, &config)?);
        Ok(Self {
            provider,
            shard,
            config,
            engine,
        })
    }

    fn build(
        provider: &InMemoryStateStoreProvider,
        shard: &Arc<ShardContext>,
        config: &EngineConfig,
    ) -> anyhow::Result<HistoryEngine> {
        let (executions, histories) = provider.create_stores();
        Ok(HistoryEngine::new(config.clone(), executions, histories, shard.clone())?)
    }

    /// The primary engine
    pub fn engine(&self) -> &Arc<HistoryEngine> {
        &self.engine
    }

    /// Another engine with its own cache over the same stores
    pub fn second_engine(&self) -> anyhow::Result<Arc<HistoryEngine>> {
        Ok(Arc::new(Self::build(&self.provider, &self.shard, &self.config)?))
    }

    /// The stores
    pub fn provider(&self) -> &InMemoryStateStoreProvider {
        &self.provider
    }

    /// Describe a run through the primary engine
    pub async fn describe(&self, execution: &WorkflowExecution) -> anyhow::Result<GetMutableStateResponse> {
        Ok(self
            .engine
            .get_mutable_state(
                &OperationContext::background(),
                GetMutableStateRequest {
                    domain_id: domain(),
                    execution: execution.clone(),
                },
            )
            .await?)
    }

    /// Committed history of a run, as a fresh reader sees it
    pub async fn history(&self, execution: &WorkflowExecution) -> anyhow::Result<Vec<HistoryEvent>> {
        let view = self.describe(execution).await?;
        Ok(self
            .provider
            .histories()
            .committed_events(&view.branch_token, view.last_transaction_id)
            .await?)
    }
}

/// Scenario domain
pub fn domain() -> DomainId {
    DomainId(DOMAIN.to_string())
}

/// Start request with generous timeouts
pub fn start_request(workflow_id: &str, request_id: &str) -> StartWorkflowExecutionRequest {
    StartWorkflowExecutionRequest {
        domain_id: domain(),
        workflow_id: workflow_id.to_string(),
        workflow_type: "scenario-workflow".to_string(),
        task_list: TASK_LIST.to_string(),
        input: b"input".to_vec(),
        execution_start_to_close_timeout_seconds: Some(3600),
        task_start_to_close_timeout_seconds: Some(10),
        identity: "scenario-client".to_string(),
        request_id: request_id.to_string(),
        workflow_id_reuse_policy: Some(WorkflowIdReusePolicy::AllowDuplicateFailedOnly),
    }
}

/// Decision poll on the normal task list
pub fn decision_poll(
    execution: &WorkflowExecution,
    schedule_id: i64,
    request_id: &str,
) -> RecordDecisionTaskStartedRequest {
    RecordDecisionTaskStartedRequest {
        domain_id: domain(),
        execution: execution.clone(),
        schedule_id,
        task_id: schedule_id * 10,
        request_id: request_id.to_string(),
        identity: "scenario-worker".to_string(),
        poll_task_list: TaskList::normal(TASK_LIST),
    }
}

/// Task token of a decision or activity
pub fn task_token(execution: &WorkflowExecution, schedule_id: i64) -> TaskToken {
    TaskToken {
        domain_id: domain(),
        workflow_id: execution.workflow_id.clone(),
        run_id: execution.run_id.clone(),
        schedule_id,
    }
}

/// Completed decision carrying `decisions`
pub fn completion(
    execution: &WorkflowExecution,
    schedule_id: i64,
    decisions: Vec<Decision>,
) -> RespondDecisionTaskCompletedRequest {
    RespondDecisionTaskCompletedRequest {
        task_token: task_token(execution, schedule_id),
        decisions,
        sticky_attributes: None,
        query_results: BTreeMap::new(),
        identity: "scenario-worker".to_string(),
        execution_context: None,
        force_create_new_decision_task: false,
    }
}

/// ScheduleActivityTask decision with fixed timeouts
pub fn schedule_activity(activity_id: &str) -> Decision {
    Decision::ScheduleActivityTask {
        activity_id: activity_id.to_string(),
        activity_type: "scenario-activity".to_string(),
        task_list: None,
        input: Vec::new(),
        schedule_to_close_timeout_seconds: 60,
        schedule_to_start_timeout_seconds: 30,
        start_to_close_timeout_seconds: 30,
        heartbeat_timeout_seconds: 0,
    }
}
