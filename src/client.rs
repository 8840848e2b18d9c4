//! Client API for starting, signaling, canceling, and observing workflow
//! instances.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::backend::Backend;
use crate::converter::{Converter, JsonConverter, Payload};
use crate::core::{InstanceState, Metadata, WorkflowInstance, WorkflowInstanceState};
use crate::error::{ClientError, WorkflowError};
use crate::history::{Event, EventAttributes};

#[derive(Debug, Clone, Default)]
pub struct WorkflowInstanceOptions {
    /// Explicit instance id; a random one is generated when absent.
    pub instance_id: Option<String>,
    pub metadata: Metadata,
}

#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn Backend>,
}

impl Client {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Create a workflow instance and enqueue its first task.
    pub async fn create_workflow_instance<In: Serialize>(
        &self,
        options: WorkflowInstanceOptions,
        workflow: &str,
        input: &In,
    ) -> Result<WorkflowInstance, ClientError> {
        let instance_id = options
            .instance_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let instance = WorkflowInstance::with_random_execution(instance_id);
        let input = JsonConverter.to_payload(input)?;
        let event = Event::new(EventAttributes::WorkflowExecutionStarted {
            name: workflow.to_string(),
            input,
            metadata: options.metadata.clone(),
        });
        self.backend
            .create_workflow_instance(instance.clone(), options.metadata, event)
            .await?;
        info!(instance_id = %instance.instance_id, workflow, "created workflow instance");
        Ok(instance)
    }

    /// Deliver a signal to the active execution of an instance.
    pub async fn signal_workflow<T: Serialize>(
        &self,
        instance_id: &str,
        name: &str,
        payload: &T,
    ) -> Result<(), ClientError> {
        let payload = JsonConverter.to_payload(payload)?;
        let event = Event::new(EventAttributes::SignalReceived {
            name: name.to_string(),
            payload,
        });
        self.backend.signal_workflow(instance_id, event).await?;
        Ok(())
    }

    /// Request cancellation of the active execution of an instance. A no-op
    /// for instances already in a terminal state.
    pub async fn cancel_workflow_instance(
        &self,
        instance_id: &str,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        let event = Event::new(EventAttributes::WorkflowExecutionCanceled {
            reason: reason.into(),
        });
        self.backend.cancel_workflow_instance(instance_id, event).await?;
        Ok(())
    }

    /// State record of the active execution.
    pub async fn get_workflow_instance_state(
        &self,
        instance_id: &str,
    ) -> Result<InstanceState, ClientError> {
        Ok(self.backend.get_workflow_instance_state(instance_id).await?)
    }

    /// Poll with backoff until the instance finishes or the timeout elapses.
    ///
    /// The wait is keyed by the instance id, not by the given execution:
    /// continue-as-new hops are followed transparently, and the returned
    /// state belongs to the execution that actually finished.
    pub async fn wait_for_workflow_instance(
        &self,
        instance: &WorkflowInstance,
        timeout: Duration,
    ) -> Result<InstanceState, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let state = self
                .backend
                .get_workflow_instance_state(&instance.instance_id)
                .await?;
            if state.state == WorkflowInstanceState::Finished {
                return Ok(state);
            }
            if tokio::time::Instant::now() + delay > deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }

    /// Wait for the instance to finish and decode its result, reading the
    /// history of whichever execution completed (after any number of
    /// continue-as-new hops). The outer `Result` is infrastructure failure;
    /// the inner one is the workflow's own outcome.
    pub async fn get_workflow_result<Out: DeserializeOwned>(
        &self,
        instance: &WorkflowInstance,
        timeout: Duration,
    ) -> Result<Result<Out, WorkflowError>, ClientError> {
        let finished = self.wait_for_workflow_instance(instance, timeout).await?;
        let history = self
            .backend
            .get_workflow_instance_history(&finished.instance)
            .await?;
        for event in history.iter().rev() {
            if let EventAttributes::WorkflowExecutionFinished { result, error } = &event.attributes
            {
                return match error {
                    Some(error) => Ok(Err(error.clone())),
                    None => {
                        let payload = result.clone().unwrap_or_else(Payload::null);
                        let value = JsonConverter.from_payload(&payload)?;
                        Ok(Ok(value))
                    }
                };
            }
        }
        Ok(Err(WorkflowError::application(
            "workflow history has no terminal event",
        )))
    }
}
