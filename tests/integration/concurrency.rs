use chronicle_core::domain::events::{EventAttributes, EventType};
use chronicle_core::{
    CoreError, EngineConfig, ExecutionKey, OperationContext, WorkflowExecution,
};
use chronicle_tests::*;

fn started_decisions(events: &[chronicle_core::domain::events::HistoryEvent]) -> usize {
    events
        .iter()
        .filter(|event| event.event_type() == EventType::DecisionTaskStarted)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_dispatchers_on_one_engine() -> anyhow::Result<()> {
    let cluster = TestCluster::new()?;
    let ctx = OperationContext::background();
    let run_id = cluster
        .engine()
        .start_workflow_execution(&ctx, start_request("raced", "start-1"))
        .await?
        .run_id;
    let execution = WorkflowExecution::new("raced", run_id);

    let first = cluster.engine().clone();
    let second = cluster.engine().clone();
    let (a, b) = tokio::join!(
        tokio::spawn({
            let execution = execution.clone();
            async move {
                first
                    .record_decision_task_started(&OperationContext::background(), decision_poll(&execution, 2, "poll-a"))
                    .await
            }
        }),
        tokio::spawn({
            let execution = execution.clone();
            async move {
                second
                    .record_decision_task_started(&OperationContext::background(), decision_poll(&execution, 2, "poll-b"))
                    .await
            }
        }),
    );
    let results = [a?, b?];

    let winners = results.iter().filter(|result| result.is_ok()).count();
    let losers = results
        .iter()
        .filter(|result| matches!(result, Err(CoreError::EventAlreadyStarted(_))))
        .count();
    assert_eq!((winners, losers), (1, 1));
    assert_eq!(started_decisions(&cluster.history(&execution).await?), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_dispatchers_on_two_hosts() -> anyhow::Result<()> {
    let cluster = TestCluster::new()?;
    let ctx = OperationContext::background();
    let run_id = cluster
        .engine()
        .start_workflow_execution(&ctx, start_request("raced", "start-1"))
        .await?
        .run_id;
    let execution = WorkflowExecution::new("raced", run_id);

    // Each host has its own cache, so only the store condition arbitrates
    let first = cluster.engine().clone();
    let second = cluster.second_engine()?;
    let (a, b) = tokio::join!(
        tokio::spawn({
            let execution = execution.clone();
            async move {
                first
                    .record_decision_task_started(&OperationContext::background(), decision_poll(&execution, 2, "poll-a"))
                    .await
            }
        }),
        tokio::spawn({
            let execution = execution.clone();
            async move {
                second
                    .record_decision_task_started(&OperationContext::background(), decision_poll(&execution, 2, "poll-b"))
                    .await
            }
        }),
    );
    let results = [a?, b?];

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|result| matches!(result, Err(CoreError::EventAlreadyStarted(_)))));

    let row = cluster
        .provider()
        .executions()
        .current_run(&domain(), "raced")
        .await
        .map(|current| current.run_id);
    assert_eq!(row.as_deref(), Some(execution.run_id.as_str()));
    assert_eq!(started_decisions(&cluster.history(&execution).await?), 1);
    assert_eq!(cluster.describe(&execution).await?.next_event_id, 4);
    Ok(())
}

#[tokio::test]
async fn test_stale_host_cannot_replace_winning_start() -> anyhow::Result<()> {
    let cluster = TestCluster::new()?;
    let ctx = OperationContext::background();
    let run_id = cluster
        .engine()
        .start_workflow_execution(&ctx, start_request("raced", "start-1"))
        .await?
        .run_id;
    let execution = WorkflowExecution::new("raced", run_id);

    // Host A caches the run while the decision is still only scheduled
    assert_eq!(cluster.describe(&execution).await?.next_event_id, 3);

    let host_b = cluster.second_engine()?;
    host_b
        .record_decision_task_started(&ctx, decision_poll(&execution, 2, "poll-b"))
        .await?;

    let stale = cluster
        .engine()
        .record_decision_task_started(&ctx, decision_poll(&execution, 2, "poll-a"))
        .await;
    assert!(matches!(stale, Err(CoreError::EventAlreadyStarted(_))));

    let history = cluster.history(&execution).await?;
    assert_eq!(history.len(), 3);
    match &history[2].attributes {
        EventAttributes::DecisionTaskStarted { request_id, .. } => assert_eq!(request_id, "poll-b"),
        other => panic!("event 3 is not a started decision: {:?}", other),
    }
    assert_eq!(history[2].event_id, 3);
    assert_eq!(cluster.describe(&execution).await?.next_event_id, 4);
    Ok(())
}

#[tokio::test]
async fn test_eviction_keeps_pinned_execution() -> anyhow::Result<()> {
    let config = EngineConfig {
        execution_cache_capacity: 2,
        ..EngineConfig::default()
    };
    let cluster = TestCluster::with_config(config)?;
    let engine = cluster.engine();
    let ctx = OperationContext::background();

    let pinned_run = engine
        .start_workflow_execution(&ctx, start_request("pinned", "start-pinned"))
        .await?
        .run_id;
    let pinned_key = ExecutionKey::new(&domain(), &WorkflowExecution::new("pinned", pinned_run));
    let guard = engine.cache().acquire(pinned_key.clone(), &ctx).await?;

    for index in 0..4 {
        engine
            .start_workflow_execution(&ctx, start_request(&format!("other-{}", index), &format!("start-{}", index)))
            .await?;
        assert!(engine.cache().contains(&pinned_key));
        assert!(engine.cache().len() <= 2);
    }

    drop(guard);
    assert!(engine.cache().len() <= 2);
    Ok(())
}
