use std::collections::BTreeMap;
use std::time::Duration;

use chronicle_core::domain::decision::Decision;
use chronicle_core::domain::events::EventType;
use chronicle_core::domain::query_registry::{QueryResultType, WorkflowQuery, WorkflowQueryResult};
use chronicle_core::types::{
    QueryWorkflowRequest, RecordActivityTaskStartedRequest, RespondActivityTaskCompletedRequest,
    SignalWorkflowExecutionRequest,
};
use chronicle_core::{ExecutionKey, OperationContext, WorkflowExecution, WorkflowStatus};
use chronicle_tests::*;

#[tokio::test]
async fn test_decision_and_activity_flow_to_completion() -> anyhow::Result<()> {
    let cluster = TestCluster::new()?;
    let engine = cluster.engine();
    let ctx = OperationContext::background();

    let run_id = engine
        .start_workflow_execution(&ctx, start_request("flow", "start-1"))
        .await?
        .run_id;
    let execution = WorkflowExecution::new("flow", run_id);

    let decision = engine
        .record_decision_task_started(&ctx, decision_poll(&execution, 2, "poll-1"))
        .await?;
    assert_eq!(decision.started_event_id, 3);
    assert_eq!(decision.previous_started_event_id, None);

    let response = engine
        .respond_decision_task_completed(&ctx, completion(&execution, 2, vec![schedule_activity("a1")]))
        .await?;
    assert_eq!(response.failed_cause, None);
    assert_eq!(response.new_decision_schedule_id, None);

    let activity = engine
        .record_activity_task_started(
            &ctx,
            RecordActivityTaskStartedRequest {
                domain_id: domain(),
                execution: execution.clone(),
                schedule_id: 5,
                task_id: 50,
                request_id: "activity-poll".to_string(),
                identity: "scenario-worker".to_string(),
            },
        )
        .await?;
    assert_eq!(activity.scheduled_event.event_type(), EventType::ActivityTaskScheduled);
    assert_eq!(activity.workflow_type, "scenario-workflow");

    engine
        .respond_activity_task_completed(
            &ctx,
            RespondActivityTaskCompletedRequest {
                task_token: task_token(&execution, 5),
                result: b"done".to_vec(),
                identity: "scenario-worker".to_string(),
            },
        )
        .await?;
    assert_eq!(cluster.describe(&execution).await?.next_event_id, 9);

    let decision = engine
        .record_decision_task_started(&ctx, decision_poll(&execution, 8, "poll-2"))
        .await?;
    assert_eq!(decision.started_event_id, 9);
    assert_eq!(decision.previous_started_event_id, Some(3));

    engine
        .respond_decision_task_completed(
            &ctx,
            completion(
                &execution,
                8,
                vec![Decision::CompleteWorkflowExecution {
                    result: b"result".to_vec(),
                }],
            ),
        )
        .await?;

    let view = cluster.describe(&execution).await?;
    assert_eq!(view.status, WorkflowStatus::Completed);
    assert!(!view.is_workflow_running);
    assert_eq!(view.next_event_id, 12);

    let types: Vec<EventType> = cluster
        .history(&execution)
        .await?
        .iter()
        .map(|event| event.event_type())
        .collect();
    assert_eq!(
        types,
        vec![
            EventType::WorkflowExecutionStarted,
            EventType::DecisionTaskScheduled,
            EventType::DecisionTaskStarted,
            EventType::DecisionTaskCompleted,
            EventType::ActivityTaskScheduled,
            EventType::ActivityTaskStarted,
            EventType::ActivityTaskCompleted,
            EventType::DecisionTaskScheduled,
            EventType::DecisionTaskStarted,
            EventType::DecisionTaskCompleted,
            EventType::WorkflowExecutionCompleted,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_signal_during_decision_schedules_follow_up() -> anyhow::Result<()> {
    let cluster = TestCluster::new()?;
    let engine = cluster.engine();
    let ctx = OperationContext::background();

    let run_id = engine
        .start_workflow_execution(&ctx, start_request("signaled", "start-1"))
        .await?
        .run_id;
    let execution = WorkflowExecution::new("signaled", run_id.clone());
    engine
        .record_decision_task_started(&ctx, decision_poll(&execution, 2, "poll-1"))
        .await?;

    engine
        .signal_workflow_execution(
            &ctx,
            SignalWorkflowExecutionRequest {
                domain_id: domain(),
                workflow_id: "signaled".to_string(),
                run_id: None,
                signal_name: "wake".to_string(),
                input: Vec::new(),
                identity: "scenario-client".to_string(),
                request_id: Some("signal-1".to_string()),
            },
        )
        .await?;
    assert_eq!(cluster.describe(&execution).await?.next_event_id, 5);

    let response = engine
        .respond_decision_task_completed(&ctx, completion(&execution, 2, Vec::new()))
        .await?;
    assert_eq!(response.new_decision_schedule_id, Some(6));
    Ok(())
}

#[tokio::test]
async fn test_query_answered_by_next_decision() -> anyhow::Result<()> {
    let cluster = TestCluster::new()?;
    let engine = cluster.engine().clone();
    let ctx = OperationContext::background();

    let run_id = engine
        .start_workflow_execution(&ctx, start_request("queried", "start-1"))
        .await?
        .run_id;
    let execution = WorkflowExecution::new("queried", run_id);

    let query_engine = engine.clone();
    let query_execution = execution.clone();
    let pending = tokio::spawn(async move {
        query_engine
            .query_workflow(
                &OperationContext::with_timeout(Duration::from_secs(10)),
                QueryWorkflowRequest {
                    domain_id: domain(),
                    execution: query_execution,
                    query: WorkflowQuery {
                        query_type: "state".to_string(),
                        query_args: Vec::new(),
                    },
                },
            )
            .await
    });

    let key = ExecutionKey::new(&domain(), &execution);
    loop {
        let guard = engine.cache().acquire(key.clone(), &ctx).await?;
        let buffered = guard
            .loaded_state()
            .map(|state| !state.query_registry().is_empty())
            .unwrap_or(false);
        drop(guard);
        if buffered {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let decision = engine
        .record_decision_task_started(&ctx, decision_poll(&execution, 2, "poll-1"))
        .await?;
    assert_eq!(decision.queries.len(), 1);
    let query_id = decision.queries.keys().next().cloned().unwrap_or_default();

    let mut request = completion(&execution, 2, Vec::new());
    request.query_results = BTreeMap::from([(
        query_id,
        WorkflowQueryResult {
            result_type: QueryResultType::Answered,
            answer: Some(b"42".to_vec()),
            error_message: None,
        },
    )]);
    engine.respond_decision_task_completed(&ctx, request).await?;

    let answer = pending.await??;
    assert_eq!(answer.query_result, b"42".to_vec());
    Ok(())
}
