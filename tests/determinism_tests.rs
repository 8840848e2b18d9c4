use std::time::Duration;

use durable_workflows::{
    ActivityContext, Backend, Converter, EventType, JsonConverter, Registry, WorkflowContext,
    WorkflowExecutor, WorkflowInstance, WorkflowInstanceOptions,
};

mod common;

fn mixed_registry() -> Registry {
    Registry::builder()
        .register_activity("A", |_ctx: ActivityContext, input: i32| async move {
            Ok(input + 1)
        })
        .register_activity("B", |_ctx: ActivityContext, input: String| async move {
            Ok(format!("{input}!"))
        })
        .register_workflow(
            "deterministic",
            |ctx: WorkflowContext, _input: ()| async move {
                let f_a = ctx.execute_activity::<_, i32>("A", &1);
                let f_t = ctx.schedule_timer(Duration::from_millis(20));
                let f_e = ctx.wait_for_signal::<String>("Go");
                let (a, t, evt) = futures::future::join3(f_a, f_t, f_e).await;
                let a = a?;
                t?;
                let evt = evt?;
                let b: String = ctx.execute_activity("B", &a.to_string()).await?;
                Ok(format!("evt={evt}, b={b}"))
            },
        )
        .build()
}

#[tokio::test]
async fn workflow_completes_and_replays_deterministically() {
    let registry = mixed_registry();
    let backend = common::test_backend();
    let (client, handle) = common::start_worker(backend.clone(), registry.clone());

    let instance = client
        .create_workflow_instance(
            WorkflowInstanceOptions {
                instance_id: Some("inst-det-1".to_string()),
                ..Default::default()
            },
            "deterministic",
            &(),
        )
        .await
        .unwrap();
    // The signal may land before the workflow registers its receiver; the
    // channel buffers it either way.
    client.signal_workflow("inst-det-1", "Go", &"ok").await.unwrap();

    let output = client
        .get_workflow_result::<String>(&instance, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output, "evt=ok, b=2!");
    handle.shutdown();

    // Replay the committed history with a fresh executor: no new commands,
    // no new events, same terminal result.
    let history = backend.get_workflow_instance_history(&instance).await.unwrap();
    let mut executor = WorkflowExecutor::new(registry, instance.clone());
    let replayed = executor.execute_task(&history, &[]);
    assert!(
        replayed.executed_events.is_empty(),
        "replay should not produce new events: {:?}",
        replayed.executed_events
    );
    assert!(replayed.activity_events.is_empty());
    assert!(replayed.timer_events.is_empty());
    assert!(replayed.workflow_events.is_empty());
    let payload = executor.workflow_result().unwrap().as_ref().unwrap();
    let replay_output: String = JsonConverter.from_payload(payload).unwrap();
    assert_eq!(replay_output, output);
}

#[test]
fn command_order_is_deterministic_in_first_episode() {
    let registry = mixed_registry();
    let mut executor = WorkflowExecutor::new(registry, WorkflowInstance::new("inst-order", "e1"));
    let result = executor.execute_task(&[], &[common::started_event("deterministic", &())]);

    let kinds: Vec<EventType> = result
        .executed_events
        .iter()
        .map(|e| e.event_type())
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventType::WorkflowExecutionStarted,
            EventType::ActivityScheduled,
            EventType::TimerScheduled,
        ],
        "echo events must follow declaration order"
    );
    // Command ids are the deterministic counter values, in order.
    assert_eq!(result.executed_events[1].schedule_event_id, Some(0));
    assert_eq!(result.executed_events[2].schedule_event_id, Some(1));
    assert_eq!(result.activity_events.len(), 1);
    assert_eq!(result.timer_events.len(), 1);
}

#[tokio::test]
async fn sequential_activity_chain_produces_dense_correlated_history() {
    let registry = Registry::builder()
        .register_activity("A", |_ctx: ActivityContext, input: i32| async move {
            Ok(input + 1)
        })
        .register_activity("B", |_ctx: ActivityContext, input: String| async move {
            Ok(format!("{input}b"))
        })
        .register_activity("C", |_ctx: ActivityContext, input: String| async move {
            Ok(format!("{input}c"))
        })
        .register_workflow("chain", |ctx: WorkflowContext, _input: ()| async move {
            let a: i32 = ctx.execute_activity("A", &1).await?;
            let b: String = ctx.execute_activity("B", &a.to_string()).await?;
            let c: String = ctx.execute_activity("C", &b).await?;
            Ok(format!("c={c}"))
        })
        .build();

    let backend = common::test_backend();
    let (client, handle) = common::start_worker(backend.clone(), registry);
    let instance = client
        .create_workflow_instance(WorkflowInstanceOptions::default(), "chain", &())
        .await
        .unwrap();
    let output = client
        .get_workflow_result::<String>(&instance, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output, "c=2bc");
    handle.shutdown();

    let history = backend.get_workflow_instance_history(&instance).await.unwrap();
    // Started + three scheduled/completed pairs + terminal event.
    assert_eq!(history.len(), 8, "unexpected history: {history:#?}");

    // Sequence ids are dense and strictly increasing from 1.
    for (index, event) in history.iter().enumerate() {
        assert_eq!(event.sequence_id, index as i64 + 1);
    }

    // Every completion points at an earlier scheduled event with the same id.
    for (index, event) in history.iter().enumerate() {
        if event.event_type() != EventType::ActivityCompleted {
            continue;
        }
        let sid = event.schedule_event_id.expect("completion correlation id");
        let scheduled = history[..index]
            .iter()
            .find(|e| {
                e.event_type() == EventType::ActivityScheduled && e.schedule_event_id == Some(sid)
            })
            .expect("scheduled event precedes completion");
        assert!(scheduled.sequence_id < event.sequence_id);
    }
}
