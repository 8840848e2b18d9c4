//! The event model: append-only history entries persisted by a backend and
//! consumed during replay.
//!
//! An [`Event`] is an envelope around a type-discriminated attribute payload.
//! Completion-style events carry a `schedule_event_id` that pairs them with
//! the earlier `*Scheduled` event produced from the command with the same id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::converter::Payload;
use crate::core::Metadata;
use crate::error::WorkflowError;

/// One entry in a workflow instance's history. Immutable once persisted;
/// `sequence_id` is assigned by the backend on commit and is dense and
/// strictly increasing within an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub sequence_id: i64,
    pub timestamp: DateTime<Utc>,
    /// Correlation key pairing completions with the command that scheduled
    /// them. Absent on lifecycle events and signals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_event_id: Option<u64>,
    /// Delivery time for delayed events (timers). The backend keeps such
    /// events in its future-events store until this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_at: Option<DateTime<Utc>>,
    pub attributes: EventAttributes,
}

/// Type-discriminated event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        name: String,
        input: Payload,
        #[serde(default)]
        metadata: Metadata,
    },
    WorkflowExecutionFinished {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Payload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WorkflowError>,
    },
    WorkflowExecutionCanceled {
        reason: String,
    },
    WorkflowExecutionTerminated {
        reason: String,
    },
    WorkflowExecutionContinuedAsNew {
        input: Payload,
    },
    ActivityScheduled {
        name: String,
        input: Payload,
    },
    ActivityCompleted {
        result: Payload,
    },
    ActivityFailed {
        error: WorkflowError,
    },
    TimerScheduled {
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        fire_at: DateTime<Utc>,
    },
    TimerCanceled,
    SignalReceived {
        name: String,
        payload: Payload,
    },
    SubWorkflowScheduled {
        name: String,
        instance_id: String,
        input: Payload,
    },
    SubWorkflowCompleted {
        result: Payload,
    },
    SubWorkflowFailed {
        error: WorkflowError,
    },
    SubWorkflowCancellationRequested,
    SideEffectResult {
        result: Payload,
    },
}

/// Discriminant of [`EventAttributes`], used for dispatch and for checking
/// command echoes against history during replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionFinished,
    WorkflowExecutionCanceled,
    WorkflowExecutionTerminated,
    WorkflowExecutionContinuedAsNew,
    ActivityScheduled,
    ActivityCompleted,
    ActivityFailed,
    TimerScheduled,
    TimerFired,
    TimerCanceled,
    SignalReceived,
    SubWorkflowScheduled,
    SubWorkflowCompleted,
    SubWorkflowFailed,
    SubWorkflowCancellationRequested,
    SideEffectResult,
}

impl EventAttributes {
    pub fn event_type(&self) -> EventType {
        match self {
            EventAttributes::WorkflowExecutionStarted { .. } => EventType::WorkflowExecutionStarted,
            EventAttributes::WorkflowExecutionFinished { .. } => EventType::WorkflowExecutionFinished,
            EventAttributes::WorkflowExecutionCanceled { .. } => EventType::WorkflowExecutionCanceled,
            EventAttributes::WorkflowExecutionTerminated { .. } => EventType::WorkflowExecutionTerminated,
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
                EventType::WorkflowExecutionContinuedAsNew
            }
            EventAttributes::ActivityScheduled { .. } => EventType::ActivityScheduled,
            EventAttributes::ActivityCompleted { .. } => EventType::ActivityCompleted,
            EventAttributes::ActivityFailed { .. } => EventType::ActivityFailed,
            EventAttributes::TimerScheduled { .. } => EventType::TimerScheduled,
            EventAttributes::TimerFired { .. } => EventType::TimerFired,
            EventAttributes::TimerCanceled => EventType::TimerCanceled,
            EventAttributes::SignalReceived { .. } => EventType::SignalReceived,
            EventAttributes::SubWorkflowScheduled { .. } => EventType::SubWorkflowScheduled,
            EventAttributes::SubWorkflowCompleted { .. } => EventType::SubWorkflowCompleted,
            EventAttributes::SubWorkflowFailed { .. } => EventType::SubWorkflowFailed,
            EventAttributes::SubWorkflowCancellationRequested => {
                EventType::SubWorkflowCancellationRequested
            }
            EventAttributes::SideEffectResult { .. } => EventType::SideEffectResult,
        }
    }
}

impl Event {
    /// Fresh unsequenced event stamped with the current wall clock. The
    /// backend assigns `sequence_id` on commit.
    pub fn new(attributes: EventAttributes) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence_id: 0,
            timestamp: Utc::now(),
            schedule_event_id: None,
            visible_at: None,
            attributes,
        }
    }

    pub fn with_schedule_event_id(mut self, schedule_event_id: u64) -> Self {
        self.schedule_event_id = Some(schedule_event_id);
        self
    }

    pub fn with_visible_at(mut self, visible_at: DateTime<Utc>) -> Self {
        self.visible_at = Some(visible_at);
        self
    }

    pub fn event_type(&self) -> EventType {
        self.attributes.event_type()
    }

    /// True for terminal lifecycle events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type(),
            EventType::WorkflowExecutionFinished | EventType::WorkflowExecutionContinuedAsNew
        )
    }
}
