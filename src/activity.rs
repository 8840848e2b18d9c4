//! Stateless activity execution.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;

use tracing::{debug, warn};

use crate::backend::ActivityTask;
use crate::core::WorkflowInstance;
use crate::error::{panic_message, WorkflowError};
use crate::history::{Event, EventAttributes};
use crate::registry::Registry;

/// Context handed to activity functions.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// The workflow instance that scheduled this activity.
    pub instance: WorkflowInstance,
    /// Correlation id of the scheduling event.
    pub schedule_event_id: u64,
}

/// Runs one activity invocation and produces its completion event. No
/// retries happen at this layer; a lost lease simply makes the backend
/// redeliver the task, which is why activities must be idempotent.
pub struct ActivityExecutor {
    registry: Registry,
}

impl ActivityExecutor {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Look up the activity by name, decode its input, invoke it, and encode
    /// the outcome as an `ActivityCompleted` or `ActivityFailed` event.
    /// A panic in the activity body becomes a panic-typed failure.
    pub async fn execute_task(&self, task: &ActivityTask) -> Event {
        let schedule_event_id = task.event.schedule_event_id;
        let completion = match &task.event.attributes {
            EventAttributes::ActivityScheduled { name, input } => {
                match self.registry.activity(name) {
                    Some(handler) => {
                        debug!(
                            instance_id = %task.instance.instance_id,
                            activity = %name,
                            "executing activity"
                        );
                        let ctx = ActivityContext {
                            instance: task.instance.clone(),
                            schedule_event_id: schedule_event_id.unwrap_or_default(),
                        };
                        match AssertUnwindSafe(handler.invoke(ctx, input.clone()))
                            .catch_unwind()
                            .await
                        {
                            Ok(result) => result,
                            Err(payload) => {
                                warn!(activity = %name, "activity panicked");
                                Err(WorkflowError::panic(panic_message(payload.as_ref())))
                            }
                        }
                    }
                    None => Err(WorkflowError::application(format!(
                        "activity not registered: {name}"
                    ))),
                }
            }
            other => Err(WorkflowError::application(format!(
                "malformed activity task: expected ActivityScheduled, got {:?}",
                other.event_type()
            ))),
        };

        let mut event = match completion {
            Ok(result) => Event::new(EventAttributes::ActivityCompleted { result }),
            Err(error) => Event::new(EventAttributes::ActivityFailed { error }),
        };
        if let Some(id) = schedule_event_id {
            event = event.with_schedule_event_id(id);
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{Converter, JsonConverter};

    fn activity_task(name: &str, input: impl serde::Serialize) -> ActivityTask {
        ActivityTask {
            task_id: "t1".to_string(),
            instance: WorkflowInstance::new("i1", "e1"),
            event: Event::new(EventAttributes::ActivityScheduled {
                name: name.to_string(),
                input: JsonConverter.to_payload(&input).unwrap(),
            })
            .with_schedule_event_id(0),
        }
    }

    #[tokio::test]
    async fn completion_carries_the_schedule_event_id() {
        let registry = Registry::builder()
            .register_activity("add", |_ctx: ActivityContext, (a, b): (i64, i64)| async move {
                Ok(a + b)
            })
            .build();
        let executor = ActivityExecutor::new(registry);

        let event = executor.execute_task(&activity_task("add", (35, 12))).await;
        assert_eq!(event.schedule_event_id, Some(0));
        match &event.attributes {
            EventAttributes::ActivityCompleted { result } => {
                let sum: i64 = JsonConverter.from_payload(result).unwrap();
                assert_eq!(sum, 47);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_activity_fails() {
        let executor = ActivityExecutor::new(Registry::builder().build());
        let event = executor.execute_task(&activity_task("missing", ())).await;
        match &event.attributes {
            EventAttributes::ActivityFailed { error } => {
                assert!(error.message.contains("not registered"))
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn panic_becomes_activity_failed() {
        let registry = Registry::builder()
            .register_activity("explode", |_ctx: ActivityContext, _input: ()| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            })
            .build();
        let executor = ActivityExecutor::new(registry);
        let event = executor.execute_task(&activity_task("explode", ())).await;
        match &event.attributes {
            EventAttributes::ActivityFailed { error } => {
                assert!(error.is_panic());
                assert_eq!(error.message, "kaboom");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
