//! Core identity types: workflow instances, executions, and instance state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque headers attached to a workflow instance at creation and propagated
/// to child instances.
pub type Metadata = HashMap<String, String>;

/// Identity of a single workflow orchestration.
///
/// `(instance_id, execution_id)` is unique; `instance_id` alone denotes the
/// active execution, which is what signaling and cancellation address. A
/// fresh execution under the same instance id is created by continue-as-new.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub execution_id: String,
    /// Present when this instance was created as a sub-workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentInstance>,
}

/// Link from a sub-workflow back to the event in its parent's history that
/// scheduled it. Completions are routed to the parent through this link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentInstance {
    pub instance: Box<WorkflowInstance>,
    pub schedule_event_id: u64,
}

impl WorkflowInstance {
    pub fn new(instance_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
            parent: None,
        }
    }

    /// New instance with a random execution id.
    pub fn with_random_execution(instance_id: impl Into<String>) -> Self {
        Self::new(instance_id, Uuid::new_v4().to_string())
    }

    /// Address the active execution of an instance; the backend resolves the
    /// execution id when routing.
    pub fn active(instance_id: impl Into<String>) -> Self {
        Self::new(instance_id, String::new())
    }

    pub fn with_parent(mut self, parent: WorkflowInstance, schedule_event_id: u64) -> Self {
        self.parent = Some(ParentInstance {
            instance: Box::new(parent),
            schedule_event_id,
        });
        self
    }
}

/// Lifecycle state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowInstanceState {
    Active,
    ContinuedAsNew,
    Finished,
}

impl WorkflowInstanceState {
    /// Terminal executions accept no further events except cancellation no-ops.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowInstanceState::Active)
    }
}

/// Backend-owned record describing one execution of an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance: WorkflowInstance,
    pub state: WorkflowInstanceState,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    /// Sequence id of the last committed history event; 0 for a fresh instance.
    pub last_sequence_id: i64,
}
