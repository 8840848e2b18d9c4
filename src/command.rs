//! Commands: decisions emitted by workflow code during one episode.
//!
//! Command ids come from the per-instance deterministic counter; matching
//! those ids against the `*Scheduled` echoes recorded in history is what
//! makes replay verifiable. Pending commands at the end of a task are
//! translated into outbound events; commands whose echo is found in history
//! are marked committed; a canceled command produces nothing.

use chrono::{DateTime, Utc};

use crate::converter::Payload;
use crate::history::{EventAttributes, EventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Pending,
    Committed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: u64,
    pub state: CommandState,
    pub attributes: CommandAttributes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandAttributes {
    ScheduleActivity {
        name: String,
        input: Payload,
    },
    ScheduleTimer {
        fire_at: DateTime<Utc>,
    },
    CancelTimer {
        timer_id: u64,
    },
    ScheduleSubWorkflow {
        name: String,
        instance_id: String,
        input: Payload,
    },
    CancelSubWorkflow {
        sub_workflow_id: u64,
        instance_id: String,
    },
    SignalWorkflow {
        instance_id: String,
        name: String,
        payload: Payload,
    },
    SideEffect {
        result: Payload,
    },
    ContinueAsNew {
        input: Payload,
    },
}

impl Command {
    pub fn new(id: u64, attributes: CommandAttributes) -> Self {
        Self {
            id,
            state: CommandState::Pending,
            attributes,
        }
    }

    /// Event type this command is echoed as in the instance's own history.
    /// `None` for commands whose only effect is an outbound event.
    pub fn echo_event_type(&self) -> Option<EventType> {
        match &self.attributes {
            CommandAttributes::ScheduleActivity { .. } => Some(EventType::ActivityScheduled),
            CommandAttributes::ScheduleTimer { .. } => Some(EventType::TimerScheduled),
            CommandAttributes::CancelTimer { .. } => Some(EventType::TimerCanceled),
            CommandAttributes::ScheduleSubWorkflow { .. } => Some(EventType::SubWorkflowScheduled),
            CommandAttributes::CancelSubWorkflow { .. } => {
                Some(EventType::SubWorkflowCancellationRequested)
            }
            CommandAttributes::SideEffect { .. } => Some(EventType::SideEffectResult),
            CommandAttributes::ContinueAsNew { .. } => {
                Some(EventType::WorkflowExecutionContinuedAsNew)
            }
            CommandAttributes::SignalWorkflow { .. } => None,
        }
    }

    /// Schedule-event id carried by the echo. Cancel commands point at the
    /// operation being canceled rather than at themselves.
    pub fn echo_schedule_event_id(&self) -> u64 {
        match &self.attributes {
            CommandAttributes::CancelTimer { timer_id } => *timer_id,
            CommandAttributes::CancelSubWorkflow { sub_workflow_id, .. } => *sub_workflow_id,
            _ => self.id,
        }
    }

    /// Check a history event against this command during replay: same echo
    /// type, and for named operations the same name and target.
    pub fn matches_event(&self, attributes: &EventAttributes) -> bool {
        if self.echo_event_type() != Some(attributes.event_type()) {
            return false;
        }
        match (&self.attributes, attributes) {
            (
                CommandAttributes::ScheduleActivity { name, .. },
                EventAttributes::ActivityScheduled { name: event_name, .. },
            ) => name == event_name,
            (
                CommandAttributes::ScheduleSubWorkflow {
                    name, instance_id, ..
                },
                EventAttributes::SubWorkflowScheduled {
                    name: event_name,
                    instance_id: event_instance,
                    ..
                },
            ) => name == event_name && instance_id == event_instance,
            _ => true,
        }
    }
}
