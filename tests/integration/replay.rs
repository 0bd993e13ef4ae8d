use chronicle_core::domain::decision::Decision;
use chronicle_core::types::{RecordActivityTaskStartedRequest, SignalWorkflowExecutionRequest, UserTimerTask};
use chronicle_core::{ExecutionKey, MutableState, OperationContext, WorkflowExecution};
use chronicle_tests::*;

#[tokio::test]
async fn test_replayed_history_matches_stored_state() -> anyhow::Result<()> {
    let cluster = TestCluster::new()?;
    let engine = cluster.engine();
    let ctx = OperationContext::background();

    let run_id = engine
        .start_workflow_execution(&ctx, start_request("replayed", "start-1"))
        .await?
        .run_id;
    let execution = WorkflowExecution::new("replayed", run_id);

    engine
        .record_decision_task_started(&ctx, decision_poll(&execution, 2, "poll-1"))
        .await?;
    engine
        .respond_decision_task_completed(
            &ctx,
            completion(
                &execution,
                2,
                vec![
                    schedule_activity("a1"),
                    Decision::StartTimer {
                        timer_id: "t1".to_string(),
                        start_to_fire_timeout_seconds: 30,
                    },
                    Decision::RecordMarker {
                        marker_name: "version".to_string(),
                        details: b"1".to_vec(),
                    },
                ],
            ),
        )
        .await?;
    engine
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
    engine
        .signal_workflow_execution(
            &ctx,
            SignalWorkflowExecutionRequest {
                domain_id: domain(),
                workflow_id: "replayed".to_string(),
                run_id: Some(execution.run_id.clone()),
                signal_name: "wake".to_string(),
                input: Vec::new(),
                identity: "scenario-client".to_string(),
                request_id: Some("signal-1".to_string()),
            },
        )
        .await?;
    assert!(
        engine
            .fire_user_timer(
                &ctx,
                UserTimerTask {
                    domain_id: domain(),
                    execution: execution.clone(),
                    timer_id: "t1".to_string(),
                },
            )
            .await?
    );

    let history = cluster.history(&execution).await?;
    let replayed = MutableState::replay(domain(), &execution, &history)?;
    let view = cluster.describe(&execution).await?;
    assert_eq!(replayed.next_event_id(), view.next_event_id);
    assert_eq!(replayed.previous_started_event_id(), view.previous_started_event_id);
    assert_eq!(replayed.execution_info().status, view.status);

    let live = engine
        .cache()
        .acquire(ExecutionKey::new(&domain(), &execution), &ctx)
        .await?;
    let live_state = live.loaded_state().cloned();
    drop(live);
    let live_state = live_state.ok_or_else(|| anyhow::anyhow!("execution not cached"))?;

    assert_eq!(replayed.pending_activities(), live_state.pending_activities());
    assert_eq!(replayed.pending_timers(), live_state.pending_timers());
    assert_eq!(
        replayed.pending_decision().map(|d| d.schedule_id),
        live_state.pending_decision().map(|d| d.schedule_id)
    );
    assert_eq!(
        replayed.snapshot().signal_requested_ids,
        live_state.snapshot().signal_requested_ids
    );
    assert!(replayed.is_signal_requested("signal-1"));
    Ok(())
}
