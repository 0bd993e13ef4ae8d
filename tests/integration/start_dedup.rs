use chronicle_core::types::{
    SignalWithStartWorkflowExecutionRequest, TerminateWorkflowExecutionRequest,
};
use chronicle_core::{CoreError, OperationContext, WorkflowIdReusePolicy, WorkflowStatus};
use chronicle_tests::*;

#[tokio::test]
async fn test_duplicate_start_returns_same_run() -> anyhow::Result<()> {
    let cluster = TestCluster::new()?;
    let engine = cluster.engine();
    let ctx = OperationContext::background();

    let first = engine
        .start_workflow_execution(&ctx, start_request("dedup", "start-1"))
        .await?;
    let retried = engine
        .start_workflow_execution(&ctx, start_request("dedup", "start-1"))
        .await?;
    assert_eq!(first.run_id, retried.run_id);
    assert_eq!(cluster.provider().executions().run_count().await, 1);

    let other = engine
        .start_workflow_execution(&ctx, start_request("dedup", "start-2"))
        .await;
    match other {
        Err(CoreError::WorkflowExecutionAlreadyStarted { run_id, start_request_id, .. }) => {
            assert_eq!(run_id, first.run_id);
            assert_eq!(start_request_id, "start-1");
        }
        unexpected => panic!("expected already started, got {:?}", unexpected),
    }
    Ok(())
}

#[tokio::test]
async fn test_reuse_policy_after_termination() -> anyhow::Result<()> {
    let cluster = TestCluster::new()?;
    let engine = cluster.engine();
    let ctx = OperationContext::background();

    let first = engine
        .start_workflow_execution(&ctx, start_request("reused", "start-1"))
        .await?;
    engine
        .terminate_workflow_execution(
            &ctx,
            TerminateWorkflowExecutionRequest {
                domain_id: domain(),
                workflow_id: "reused".to_string(),
                run_id: None,
                reason: "operator".to_string(),
                details: Vec::new(),
                identity: "admin".to_string(),
            },
        )
        .await?;

    // Terminated counts as an unsuccessful close
    let mut request = start_request("reused", "start-2");
    request.workflow_id_reuse_policy = Some(WorkflowIdReusePolicy::AllowDuplicateFailedOnly);
    let second = engine.start_workflow_execution(&ctx, request).await?;
    assert_ne!(first.run_id, second.run_id);

    let current = cluster
        .provider()
        .executions()
        .current_run(&domain(), "reused")
        .await
        .map(|current| (current.run_id, current.status));
    assert_eq!(current, Some((second.run_id.clone(), WorkflowStatus::Running)));

    let mut blocked = start_request("reused", "start-3");
    blocked.workflow_id_reuse_policy = Some(WorkflowIdReusePolicy::RejectDuplicate);
    assert!(matches!(
        engine.start_workflow_execution(&ctx, blocked).await,
        Err(CoreError::WorkflowExecutionAlreadyStarted { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_signal_with_start_creates_then_signals() -> anyhow::Result<()> {
    let cluster = TestCluster::new()?;
    let engine = cluster.engine();
    let ctx = OperationContext::background();

    let request = |request_id: &str| {
        let start = start_request("sws", request_id);
        SignalWithStartWorkflowExecutionRequest {
            domain_id: start.domain_id,
            workflow_id: start.workflow_id,
            workflow_type: start.workflow_type,
            task_list: start.task_list,
            input: start.input,
            execution_start_to_close_timeout_seconds: start.execution_start_to_close_timeout_seconds,
            task_start_to_close_timeout_seconds: start.task_start_to_close_timeout_seconds,
            identity: start.identity,
            request_id: start.request_id,
            workflow_id_reuse_policy: start.workflow_id_reuse_policy,
            signal_name: "ping".to_string(),
            signal_input: Vec::new(),
        }
    };

    let created = engine
        .signal_with_start_workflow_execution(&ctx, request("sws-1"))
        .await?;
    let execution = chronicle_core::WorkflowExecution::new("sws", created.run_id.clone());
    let view = cluster.describe(&execution).await?;
    assert_eq!(view.next_event_id, 4);

    // Retried request is not signaled twice
    let retried = engine
        .signal_with_start_workflow_execution(&ctx, request("sws-1"))
        .await?;
    assert_eq!(retried.run_id, created.run_id);
    assert_eq!(cluster.describe(&execution).await?.next_event_id, 4);

    let signaled = engine
        .signal_with_start_workflow_execution(&ctx, request("sws-2"))
        .await?;
    assert_eq!(signaled.run_id, created.run_id);
    assert_eq!(cluster.describe(&execution).await?.next_event_id, 5);
    Ok(())
}
