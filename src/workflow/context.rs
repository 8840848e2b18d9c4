//! The user-facing workflow context and its suspending primitives.
//!
//! Every primitive allocates the next command id, creates a one-shot future,
//! and records a command; the executor later resolves the future from a
//! history event. The allocation happens unconditionally so the command-id
//! sequence is identical on every replay, even when a primitive short-cuts
//! (side effects, outbound signals).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::command::{Command, CommandAttributes, CommandState};
use crate::converter::{Converter, JsonConverter, Payload};
use crate::core::WorkflowInstance;
use crate::error::WorkflowError;

use super::futures::{FutureCell, WorkflowFuture};
use super::state::WorkflowState;

/// Options for creating a sub-workflow.
#[derive(Debug, Clone, Default)]
pub struct SubWorkflowOptions {
    /// Explicit child instance id; a deterministic id derived from the parent
    /// instance and the command id is used when absent.
    pub instance_id: Option<String>,
}

/// Handle passed to workflow code. Cheap to clone; all clones share the same
/// per-instance state.
#[derive(Clone)]
pub struct WorkflowContext {
    state: Arc<Mutex<WorkflowState>>,
    instance: Arc<WorkflowInstance>,
}

impl WorkflowContext {
    pub(crate) fn new(state: Arc<Mutex<WorkflowState>>, instance: Arc<WorkflowInstance>) -> Self {
        Self { state, instance }
    }

    pub fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    /// True while recorded history is being consumed. Code must not branch on
    /// this for anything that schedules commands.
    pub fn replaying(&self) -> bool {
        self.state.lock().unwrap().replaying()
    }

    /// The deterministic workflow clock. Never read the wall clock inside
    /// workflow code; route it through [`WorkflowContext::side_effect`].
    pub fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().time()
    }

    /// True once a cancellation event has been applied to this execution.
    pub fn canceled(&self) -> bool {
        self.state.lock().unwrap().canceled()
    }

    /// Schedule an activity invocation and return the future for its result.
    pub fn execute_activity<In, Out>(&self, name: &str, input: &In) -> WorkflowFuture<Out>
    where
        In: Serialize,
        Out: DeserializeOwned,
    {
        let payload = JsonConverter.to_payload(input);
        let mut state = self.state.lock().unwrap();
        let id = state.next_schedule_event_id();
        let cell = FutureCell::new();
        match payload {
            Ok(input) => {
                state.add_command(Command::new(
                    id,
                    CommandAttributes::ScheduleActivity {
                        name: name.to_string(),
                        input,
                    },
                ));
                state.register_future(id, cell.clone());
            }
            Err(err) => cell.set(Err(err.into())),
        }
        WorkflowFuture::new(Some(id), cell)
    }

    /// Schedule a timer that fires `delay` after the current workflow time.
    pub fn schedule_timer(&self, delay: Duration) -> WorkflowFuture<()> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_schedule_event_id();
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let fire_at = state
            .time()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.add_command(Command::new(id, CommandAttributes::ScheduleTimer { fire_at }));
        let cell = FutureCell::new();
        state.register_future(id, cell.clone());
        WorkflowFuture::new(Some(id), cell)
    }

    /// Cancel a timer before it fires. The timer's future resolves with a
    /// cancellation error; a fired-timer event arriving later is discarded.
    /// Canceling a timer that already fired (or was already canceled) is a
    /// no-op.
    pub fn cancel_timer(&self, timer: &WorkflowFuture<()>) {
        let Some(timer_id) = timer.schedule_event_id else {
            return;
        };
        let mut state = self.state.lock().unwrap();
        // A resolved future means the timer fired or was canceled before;
        // there is nothing left to undo and no event to record.
        if !state.has_pending_future(timer_id) {
            return;
        }
        let mut canceled_in_buffer = false;
        if let Some(command) = state.commands_mut().iter_mut().find(|c| {
            c.id == timer_id
                && c.state == CommandState::Pending
                && matches!(c.attributes, CommandAttributes::ScheduleTimer { .. })
        }) {
            // Scheduled in this very episode: drop the command before it is
            // ever committed.
            command.state = CommandState::Canceled;
            canceled_in_buffer = true;
        }
        if !canceled_in_buffer {
            let id = state.next_schedule_event_id();
            state.add_command(Command::new(id, CommandAttributes::CancelTimer { timer_id }));
        }
        state.resolve_future(timer_id, Err(WorkflowError::canceled("timer canceled")));
    }

    /// A receive-only channel for signals with the given name. Payloads
    /// delivered before the first receive are buffered.
    pub fn signal_channel(&self, name: &str) -> SignalChannel {
        SignalChannel {
            name: name.to_string(),
            ctx: self.clone(),
        }
    }

    /// Future for the next payload of a named signal.
    pub fn wait_for_signal<T: DeserializeOwned>(&self, name: &str) -> WorkflowFuture<T> {
        let mut state = self.state.lock().unwrap();
        let cell = FutureCell::new();
        match state.pop_signal(name) {
            Some(payload) => cell.set(Ok(payload)),
            None => state.add_signal_waiter(name, cell.clone()),
        }
        WorkflowFuture::new(None, cell)
    }

    /// Create a sub-workflow and return the future for its result.
    pub fn create_sub_workflow<In, Out>(
        &self,
        options: SubWorkflowOptions,
        name: &str,
        input: &In,
    ) -> WorkflowFuture<Out>
    where
        In: Serialize,
        Out: DeserializeOwned,
    {
        let payload = JsonConverter.to_payload(input);
        let mut state = self.state.lock().unwrap();
        let id = state.next_schedule_event_id();
        let cell = FutureCell::new();
        match payload {
            Ok(input) => {
                let instance_id = options
                    .instance_id
                    .unwrap_or_else(|| format!("{}:{}", self.instance.instance_id, id));
                state.add_command(Command::new(
                    id,
                    CommandAttributes::ScheduleSubWorkflow {
                        name: name.to_string(),
                        instance_id,
                        input,
                    },
                ));
                state.register_future(id, cell.clone());
            }
            Err(err) => cell.set(Err(err.into())),
        }
        WorkflowFuture::new(Some(id), cell)
    }

    /// Send a signal to another workflow instance. The returned future
    /// resolves as soon as the signal is recorded for delivery.
    pub fn signal_workflow<T: Serialize>(
        &self,
        instance_id: &str,
        name: &str,
        payload: &T,
    ) -> WorkflowFuture<()> {
        let payload = JsonConverter.to_payload(payload);
        let mut state = self.state.lock().unwrap();
        let id = state.next_schedule_event_id();
        let cell = FutureCell::new();
        match payload {
            Ok(payload) => {
                // The signal leaves no echo in this instance's history, so it
                // must not be re-sent when the call site is replayed.
                if !state.replaying() {
                    state.add_command(Command::new(
                        id,
                        CommandAttributes::SignalWorkflow {
                            instance_id: instance_id.to_string(),
                            name: name.to_string(),
                            payload,
                        },
                    ));
                }
                cell.set(Ok(Payload::null()));
            }
            Err(err) => cell.set(Err(err.into())),
        }
        WorkflowFuture::new(Some(id), cell)
    }

    /// Run a non-deterministic computation exactly once. During live
    /// execution `f` runs immediately and its encoded result is recorded;
    /// replay returns the recorded value without invoking `f` again.
    pub fn side_effect<T, F>(&self, f: F) -> WorkflowFuture<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&WorkflowContext) -> T,
    {
        let (id, replaying) = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_schedule_event_id();
            (id, state.replaying())
        };
        let cell = FutureCell::new();
        if replaying {
            self.state.lock().unwrap().register_future(id, cell.clone());
        } else {
            let value = f(self);
            let mut state = self.state.lock().unwrap();
            match JsonConverter.to_payload(&value) {
                Ok(result) => {
                    state.add_command(Command::new(
                        id,
                        CommandAttributes::SideEffect {
                            result: result.clone(),
                        },
                    ));
                    cell.set(Ok(result));
                }
                Err(err) => cell.set(Err(err.into())),
            }
        }
        WorkflowFuture::new(Some(id), cell)
    }

    /// End this execution and start a fresh one with the given input under
    /// the same instance id. Return the result as the workflow's error:
    ///
    /// ```ignore
    /// return Err(ctx.continue_as_new(&next_input));
    /// ```
    pub fn continue_as_new<In: Serialize>(&self, input: &In) -> WorkflowError {
        let payload = JsonConverter.to_payload(input);
        let mut state = self.state.lock().unwrap();
        let id = state.next_schedule_event_id();
        match payload {
            Ok(input) => {
                state.add_command(Command::new(id, CommandAttributes::ContinueAsNew { input }));
                WorkflowError::continued_as_new()
            }
            Err(err) => err.into(),
        }
    }

    pub(crate) fn pop_signal(&self, name: &str) -> Option<Payload> {
        self.state.lock().unwrap().pop_signal(name)
    }
}

/// Receive-only handle for a named signal channel.
pub struct SignalChannel {
    name: String,
    ctx: WorkflowContext,
}

impl SignalChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Future for the next payload on this channel.
    pub fn receive<T: DeserializeOwned>(&self) -> WorkflowFuture<T> {
        self.ctx.wait_for_signal(&self.name)
    }
}
