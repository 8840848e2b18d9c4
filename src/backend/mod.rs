//! The storage/queue boundary consumed by the core.
//!
//! A backend owns history, instance state, pending-event streams, the
//! future-events store, and both task queues. The engine only ever mutates
//! them through this interface; `complete_workflow_task` in particular must
//! be atomic: append history, drain consumed pending events, stage timers,
//! enqueue activity tasks, route workflow events, and release the lease as
//! one commit.

pub mod memory;

use async_trait::async_trait;

use crate::core::{InstanceState, Metadata, WorkflowInstance, WorkflowInstanceState};
use crate::error::BackendError;
use crate::history::Event;

/// A leased unit of workflow work: one instance's pending events.
///
/// The task id is the lease token; at most one task per instance id is
/// outstanding at any time, and the lease expires after the backend's
/// workflow lock timeout unless extended.
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    pub task_id: String,
    pub instance: WorkflowInstance,
    pub state: WorkflowInstanceState,
    pub metadata: Metadata,
    /// Sequence id of the last committed history event at lease time.
    pub last_sequence_id: i64,
    /// Pending events since the last task, in delivery order.
    pub new_events: Vec<Event>,
    /// Opaque backend cursor carried back into `complete_workflow_task`.
    pub custom_data: Option<String>,
}

/// A leased activity invocation: the `ActivityScheduled` event to run.
#[derive(Debug, Clone)]
pub struct ActivityTask {
    pub task_id: String,
    pub instance: WorkflowInstance,
    pub event: Event,
}

/// An event produced by one instance but destined for another (or for a
/// fresh execution of the same instance): child starts, signals, parent
/// notifications, cancellation requests.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    /// Target instance. An empty execution id addresses whatever execution
    /// is currently active; a `WorkflowExecutionStarted` event creates the
    /// target.
    pub target: WorkflowInstance,
    pub event: Event,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Atomically persist a new instance, append its start event to the
    /// pending stream, and enqueue a workflow task.
    async fn create_workflow_instance(
        &self,
        instance: WorkflowInstance,
        metadata: Metadata,
        event: Event,
    ) -> Result<(), BackendError>;

    /// Append a cancellation event to the active execution's pending stream.
    /// A no-op for instances already in a terminal state.
    async fn cancel_workflow_instance(
        &self,
        instance_id: &str,
        event: Event,
    ) -> Result<(), BackendError>;

    /// Append a `SignalReceived` event to the active execution's pending
    /// stream and enqueue a workflow task.
    async fn signal_workflow(&self, instance_id: &str, event: Event) -> Result<(), BackendError>;

    /// Long-poll for a workflow task. Returns `None` when the block timeout
    /// elapses without work. Dequeuing leases the instance.
    async fn get_workflow_task(&self) -> Result<Option<WorkflowTask>, BackendError>;

    /// Refresh a workflow task lease before it expires.
    async fn extend_workflow_task(
        &self,
        task_id: &str,
        instance: &WorkflowInstance,
    ) -> Result<(), BackendError>;

    /// Atomic commit of one executed workflow task; see the module docs for
    /// the full step list.
    async fn complete_workflow_task(
        &self,
        task: &WorkflowTask,
        state: WorkflowInstanceState,
        executed_events: Vec<Event>,
        activity_events: Vec<Event>,
        timer_events: Vec<Event>,
        workflow_events: Vec<WorkflowEvent>,
    ) -> Result<(), BackendError>;

    /// Committed history of an execution, ordered by sequence id. An empty
    /// execution id reads the active execution.
    async fn get_workflow_instance_history(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Vec<Event>, BackendError>;

    /// State record of the active execution of an instance.
    async fn get_workflow_instance_state(
        &self,
        instance_id: &str,
    ) -> Result<InstanceState, BackendError>;

    /// Long-poll for an activity task; analogous to `get_workflow_task`.
    async fn get_activity_task(&self) -> Result<Option<ActivityTask>, BackendError>;

    /// Refresh an activity task lease before it expires.
    async fn extend_activity_task(&self, task_id: &str) -> Result<(), BackendError>;

    /// Deliver an activity's completion event back to the scheduling
    /// execution and release the lease.
    async fn complete_activity_task(
        &self,
        instance: &WorkflowInstance,
        task_id: &str,
        event: Event,
    ) -> Result<(), BackendError>;
}
