//! Per-instance in-memory state shared between the context primitives and
//! the executor.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::command::{Command, CommandAttributes};
use crate::converter::Payload;
use crate::error::WorkflowError;

use super::futures::FutureCell;

#[derive(Default)]
struct SignalChannelState {
    /// Payloads delivered before any receiver existed.
    buffer: VecDeque<Payload>,
    /// Receivers waiting for the next payload.
    waiters: VecDeque<FutureCell>,
}

/// The deterministic heart of one workflow execution: the command-id counter,
/// the command buffer, pending futures keyed by command id, buffered signal
/// channels, the replay flag, and the workflow clock.
pub(crate) struct WorkflowState {
    next_schedule_event_id: u64,
    commands: Vec<Command>,
    pending_futures: HashMap<u64, FutureCell>,
    signal_channels: HashMap<String, SignalChannelState>,
    replaying: bool,
    canceled: bool,
    time: DateTime<Utc>,
}

impl WorkflowState {
    pub(crate) fn new() -> Self {
        Self {
            next_schedule_event_id: 0,
            commands: Vec::new(),
            pending_futures: HashMap::new(),
            signal_channels: HashMap::new(),
            replaying: false,
            canceled: false,
            time: DateTime::UNIX_EPOCH,
        }
    }

    /// Allocate the next command id. The counter advances unconditionally on
    /// every suspending primitive; its purity across replays is what the
    /// whole replay contract hangs on.
    pub(crate) fn next_schedule_event_id(&mut self) -> u64 {
        let id = self.next_schedule_event_id;
        self.next_schedule_event_id += 1;
        id
    }

    pub(crate) fn add_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub(crate) fn commands_mut(&mut self) -> &mut Vec<Command> {
        &mut self.commands
    }

    pub(crate) fn register_future(&mut self, schedule_event_id: u64, cell: FutureCell) {
        self.pending_futures.insert(schedule_event_id, cell);
    }

    /// Resolve and remove the pending future for a completion event. Returns
    /// false when no future is registered under the id.
    pub(crate) fn resolve_future(
        &mut self,
        schedule_event_id: u64,
        value: Result<Payload, WorkflowError>,
    ) -> bool {
        match self.pending_futures.remove(&schedule_event_id) {
            Some(cell) => {
                cell.set(value);
                true
            }
            None => false,
        }
    }

    pub(crate) fn has_pending_future(&self, schedule_event_id: u64) -> bool {
        self.pending_futures.contains_key(&schedule_event_id)
    }

    /// Resolve every pending future and signal waiter with the given error.
    pub(crate) fn resolve_all_pending(&mut self, error: WorkflowError) {
        for (_, cell) in self.pending_futures.drain() {
            cell.set(Err(error.clone()));
        }
        for channel in self.signal_channels.values_mut() {
            for cell in channel.waiters.drain(..) {
                cell.set(Err(error.clone()));
            }
        }
    }

    /// Sub-workflow commands whose result is still pending, in ascending
    /// command-id order.
    pub(crate) fn pending_sub_workflows(&self) -> Vec<(u64, String)> {
        let mut subs: Vec<(u64, String)> = self
            .commands
            .iter()
            .filter_map(|c| match &c.attributes {
                CommandAttributes::ScheduleSubWorkflow { instance_id, .. }
                    if self.pending_futures.contains_key(&c.id) =>
                {
                    Some((c.id, instance_id.clone()))
                }
                _ => None,
            })
            .collect();
        subs.sort_by_key(|(id, _)| *id);
        subs
    }

    /// Hand a signal payload to a waiting receiver, or buffer it until one
    /// shows up.
    pub(crate) fn deliver_signal(&mut self, name: &str, payload: Payload) {
        let channel = self.signal_channels.entry(name.to_string()).or_default();
        match channel.waiters.pop_front() {
            Some(cell) => cell.set(Ok(payload)),
            None => channel.buffer.push_back(payload),
        }
    }

    pub(crate) fn pop_signal(&mut self, name: &str) -> Option<Payload> {
        self.signal_channels
            .get_mut(name)
            .and_then(|channel| channel.buffer.pop_front())
    }

    pub(crate) fn add_signal_waiter(&mut self, name: &str, cell: FutureCell) {
        self.signal_channels
            .entry(name.to_string())
            .or_default()
            .waiters
            .push_back(cell);
    }

    pub(crate) fn replaying(&self) -> bool {
        self.replaying
    }

    pub(crate) fn set_replaying(&mut self, replaying: bool) {
        self.replaying = replaying;
    }

    pub(crate) fn canceled(&self) -> bool {
        self.canceled
    }

    pub(crate) fn set_canceled(&mut self) {
        self.canceled = true;
    }

    /// The deterministic workflow clock: the timestamp of the event currently
    /// being applied.
    pub(crate) fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub(crate) fn set_time(&mut self, time: DateTime<Utc>) {
        self.time = time;
    }
}
